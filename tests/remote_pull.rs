mod common;

use chrono::Duration as ChronoDuration;
use common::{make_assets, Harness};
use parking_lot::Mutex;
use photosync::checkpoint::CheckpointStore;
use photosync::media::PhotosApi;
use photosync::model::{PhotoPreview, RemotePhotoStatus};
use photosync::remote_pull::{RemotePullManager, RemotePullStatus};
use photosync::scanner::{DevicePresence, DeviceScanner, ScannerStatus};
use photosync::SyncManager;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct OnDevice(HashSet<String>);

impl DevicePresence for OnDevice {
    fn has_photo_in_device(&self, name: &str, _taken_at: i64) -> bool {
        self.0.contains(name)
    }
}

fn preview_text(h: &Harness, name: &str) -> Option<String> {
    std::fs::read_to_string(h.ctx.paths.preview_path(name, "jpg")).ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pulls_pages_and_materializes_previews() {
    let h = Harness::build(0, |c| c.remote_photos_per_page = 3);
    let mut seeded = Vec::new();
    for n in 0..7 {
        seeded.push(h.seed_remote_photo(n).await);
    }

    let manager = SyncManager::new(h.ctx.clone());
    let pages = Arc::new(Mutex::new(Vec::new()));
    let p = pages.clone();
    manager
        .remote()
        .on_remote_page_synced(move |photos| p.lock().push(photos.len()));

    assert_eq!(manager.pull_remote().await.unwrap(), RemotePullStatus::Synced);
    assert_eq!(*pages.lock(), vec![3, 3, 1]);
    assert_eq!(h.api.list_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.index.count().unwrap(), 7);
    for (n, photo) in seeded.iter().enumerate() {
        assert_eq!(preview_text(&h, &photo.name), Some(format!("preview {n}")));
    }
    let newest = seeded.iter().map(|p| p.updated_at).max();
    assert_eq!(h.checkpoints.last_pulled_date().unwrap(), newest);
    assert!(h.leftover_tmp_files().is_empty());

    // Nothing changed upstream: only the checkpoint photo is listed again.
    let downloads = h.bridge.downloads.load(Ordering::SeqCst);
    assert_eq!(manager.pull_remote().await.unwrap(), RemotePullStatus::Synced);
    assert_eq!(h.bridge.downloads.load(Ordering::SeqCst), downloads);
    assert_eq!(h.api.list_calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.checkpoints.last_pulled_date().unwrap(), newest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn skips_removed_and_device_resident_photos() {
    let h = Harness::new(0);
    let deleted = h.seed_remote_photo(0).await;
    let resident = h.seed_remote_photo(1).await;
    let cloud_only = h.seed_remote_photo(2).await;
    h.api.delete_photo(&deleted.id).await.unwrap();

    let remote = RemotePullManager::new(h.ctx.clone());
    remote.set_device_presence(Arc::new(OnDevice(
        [resident.name.clone()].into_iter().collect(),
    )));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let s = statuses.clone();
    remote.on_status_change(move |status| s.lock().push(status));

    assert_eq!(remote.pull().await.unwrap(), RemotePullStatus::Synced);
    assert_eq!(
        *statuses.lock(),
        vec![RemotePullStatus::Syncing, RemotePullStatus::Synced]
    );

    assert_eq!(preview_text(&h, &deleted.name), None);
    assert_eq!(preview_text(&h, &resident.name), None);
    assert_eq!(preview_text(&h, &cloud_only.name), Some("preview 2".to_string()));
    assert_eq!(h.bridge.downloads.load(Ordering::SeqCst), 1);

    assert_eq!(h.index.count().unwrap(), 3);
    let row = h.index.get_by_id(&deleted.id).unwrap().unwrap();
    assert_eq!(row.status, RemotePhotoStatus::Deleted);
    assert_eq!(
        h.checkpoints.last_pulled_date().unwrap(),
        Some(cloud_only.updated_at)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_download_holds_back_the_checkpoint() {
    let h = Harness::build(0, |c| c.max_preview_download_retries = 1);
    let first = h.seed_remote_photo(0).await;
    let broken = h.seed_remote_photo(1).await;
    let last = h.seed_remote_photo(2).await;
    h.bridge.remove(broken.preview_file_id());

    let remote = RemotePullManager::new(h.ctx.clone());
    assert_eq!(remote.pull().await.unwrap(), RemotePullStatus::Synced);

    assert!(preview_text(&h, &first.name).is_some());
    assert!(preview_text(&h, &broken.name).is_none());
    assert!(preview_text(&h, &last.name).is_some());
    assert_eq!(
        h.checkpoints.last_pulled_date().unwrap(),
        Some(broken.updated_at - ChronoDuration::milliseconds(1))
    );
    assert!(h
        .logger
        .lines()
        .iter()
        .any(|l| l.starts_with("ERROR preview_download")));

    // The next pull starts at the failed photo again.
    let names = Arc::new(Mutex::new(Vec::new()));
    let n = names.clone();
    remote.on_remote_page_synced(move |photos| {
        n.lock().extend(photos.iter().map(|p| p.name.clone()));
    });
    assert_eq!(remote.pull().await.unwrap(), RemotePullStatus::Synced);
    assert_eq!(*names.lock(), vec![broken.name.clone(), last.name.clone()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_preview_is_regenerated() {
    let h = Harness::new(0);
    let seeded = h.seed_remote_photo(0).await;
    let square = vec![PhotoPreview {
        width: 512,
        height: 512,
        size: 9,
        file_id: seeded.preview_id.clone(),
        format: "jpg".to_string(),
    }];
    h.api.update_previews(&seeded.id, &square).await.unwrap();

    let remote = RemotePullManager::new(h.ctx.clone());
    assert_eq!(remote.pull().await.unwrap(), RemotePullStatus::Synced);

    // One update to break it, one from the repair.
    assert_eq!(h.api.preview_updates.load(Ordering::SeqCst), 2);
    assert_eq!(h.previews.calls.load(Ordering::SeqCst), 1);
    let row = h.index.get_by_id(&seeded.id).unwrap().unwrap();
    assert_eq!((row.previews[0].width, row.previews[0].height), (512, 384));
    assert_ne!(row.previews[0].file_id, seeded.preview_id);

    let text = preview_text(&h, &seeded.name).unwrap();
    assert!(text.starts_with("preview 512x384"), "{text}");
    assert!(h.logger.lines().iter().any(|l| l.contains("PREVIEW_FIXED")));
    assert!(h.leftover_tmp_files().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_timestamps_survive_page_boundaries() {
    let h = Harness::build(0, |c| c.remote_photos_per_page = 2);
    let mut seeded = Vec::new();
    for n in 0..5 {
        seeded.push(h.seed_remote_photo(n).await);
    }
    let instant = seeded[0].updated_at;
    h.api.stamp_all(instant);

    let remote = RemotePullManager::new(h.ctx.clone());
    let pages = Arc::new(Mutex::new(Vec::new()));
    let p = pages.clone();
    remote.on_remote_page_synced(move |photos| p.lock().push(photos.len()));

    assert_eq!(remote.pull().await.unwrap(), RemotePullStatus::Synced);
    assert_eq!(*pages.lock(), vec![2, 2, 1]);
    assert_eq!(h.index.count().unwrap(), 5);
    for (n, photo) in seeded.iter().enumerate() {
        assert_eq!(preview_text(&h, &photo.name), Some(format!("preview {n}")));
    }
    assert_eq!(h.checkpoints.last_pulled_date().unwrap(), Some(instant));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resuming_at_the_checkpoint_instant_keeps_its_peers() {
    let h = Harness::build(0, |c| c.remote_photos_per_page = 2);
    let mut seeded = Vec::new();
    for n in 0..3 {
        seeded.push(h.seed_remote_photo(n).await);
    }
    let instant = seeded[2].updated_at;
    h.api.stamp_all(instant);
    // An earlier run settled one page at this instant and stopped.
    h.checkpoints.save_last_pulled_date(instant).unwrap();

    let remote = RemotePullManager::new(h.ctx.clone());
    assert_eq!(remote.pull().await.unwrap(), RemotePullStatus::Synced);
    assert_eq!(h.index.count().unwrap(), 3);
    assert_eq!(h.bridge.downloads.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scanner_matches_device_files_by_stem() {
    let dir = tempfile::tempdir().unwrap();
    let mut assets = make_assets(&dir.path().join("library"), 2);
    assets[0].filename = "IMG_0000.MOV.jpg".to_string();
    let taken = [assets[0].creation_time, assets[1].creation_time];
    let h = Harness::with_assets(dir, assets, |_| {});

    let scanner = DeviceScanner::new(&h.ctx);
    scanner.run();
    common::eventually("scan", || scanner.status() == ScannerStatus::Completed).await;

    assert!(scanner.has_photo_in_device("IMG_0000", taken[0]));
    assert!(scanner.has_photo_in_device("IMG_0001", taken[1]));
    assert!(!scanner.has_photo_in_device("IMG_0000", taken[1]));
    assert!(!scanner.has_photo_in_device("IMG_0002", taken[0]));

    scanner.destroy();
    assert!(!scanner.has_photo_in_device("IMG_0001", taken[1]));
}
