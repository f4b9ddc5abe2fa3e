#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use photosync::bridge::{BridgeApi, FileInfo, FinishedShard, ShardDescriptor, UploadSlot};
use photosync::checkpoint::MemoryCheckpointStore;
use photosync::checksum::ShardHasher;
use photosync::config::SyncConfig;
use photosync::context::SyncContext;
use photosync::crypto::Progress;
use photosync::fs_library::FileUriResolver;
use photosync::index::LocalSyncIndex;
use photosync::logger::{LogErrorReporter, MemoryLogger, SyncLogger};
use photosync::media::{
    AssetPage, CreatePhotoRequest, GeneratedPreview, MediaLibraryProvider, PhotosApi,
    PreviewGenerator,
};
use photosync::model::{
    DeviceAsset, MediaKind, PhotoPaths, PhotoPreview, RemotePhoto, RemotePhotoStatus,
};
use photosync::transfer::Transfer;
use photosync::SyncError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const BUCKET: &str = "0123456789abcdef01234567";
pub const USER: &str = "user-1";
pub const MNEMONIC: &str = "abandon ability able about above absent absorb abstract absurd abuse access accident";

struct StoredFile {
    index_hex: String,
    hash: String,
    data: Vec<u8>,
}

/// Bridge that keeps ciphertext in memory.
#[derive(Default)]
pub struct MemoryBridge {
    files: Mutex<HashMap<String, StoredFile>>,
    slots: Mutex<HashMap<String, Vec<u8>>>,
    pub finished: AtomicUsize,
    pub downloads: AtomicUsize,
    /// Serve two mirrors per file.
    pub legacy_mirrors: AtomicBool,
    /// Flip a byte of every downloaded shard.
    pub corrupt_downloads: AtomicBool,
    put_delay: Mutex<Option<Duration>>,
}

impl MemoryBridge {
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = Some(delay);
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    pub fn remove(&self, file_id: &str) {
        self.files.lock().remove(file_id);
    }
}

#[async_trait]
impl BridgeApi for MemoryBridge {
    async fn file_info(&self, bucket: &str, file_id: &str) -> Result<FileInfo> {
        let files = self.files.lock();
        let file = files
            .get(file_id)
            .ok_or_else(|| SyncError::Http {
                status: 404,
                body: format!("file {file_id} not found"),
            })?;
        Ok(FileInfo {
            bucket: bucket.to_string(),
            size: file.data.len() as u64,
            index: file.index_hex.clone(),
            mimetype: "application/octet-stream".to_string(),
            hash: None,
        })
    }

    async fn file_mirrors(&self, _bucket: &str, file_id: &str) -> Result<Vec<ShardDescriptor>> {
        let files = self.files.lock();
        let file = files
            .get(file_id)
            .ok_or_else(|| anyhow!("file {file_id} not found"))?;
        let shard = ShardDescriptor {
            hash: file.hash.clone(),
            url: format!("mem://{file_id}"),
            index: 0,
            size: Some(file.data.len() as u64),
        };
        if self.legacy_mirrors.load(Ordering::SeqCst) {
            let mut second = shard.clone();
            second.index = 1;
            return Ok(vec![shard, second]);
        }
        Ok(vec![shard])
    }

    async fn start_upload(&self, _bucket: &str, _size: u64) -> Result<UploadSlot> {
        let uuid = uuid::Uuid::new_v4().to_string();
        Ok(UploadSlot {
            index: 0,
            url: format!("mem://upload/{uuid}"),
            uuid,
        })
    }

    async fn put_shard(&self, slot: &UploadSlot, src: &Path, cancel: &CancellationToken) -> Result<()> {
        let delay = *self.put_delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(SyncError::Aborted.into()),
            }
        }
        let data = tokio::fs::read(src).await?;
        self.slots.lock().insert(slot.uuid.clone(), data);
        Ok(())
    }

    async fn get_shard(
        &self,
        shard: &ShardDescriptor,
        dest: &Path,
        _cancel: &CancellationToken,
        _progress: Option<Arc<Progress>>,
    ) -> Result<u64> {
        let file_id = shard.url.trim_start_matches("mem://").to_string();
        let mut data = self
            .files
            .lock()
            .get(&file_id)
            .map(|f| f.data.clone())
            .ok_or_else(|| anyhow!("file {file_id} not found"))?;
        if self.corrupt_downloads.load(Ordering::SeqCst) {
            if let Some(b) = data.first_mut() {
                *b ^= 0xff;
            }
        }
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }

    async fn finish_upload(&self, _bucket: &str, index_hex: &str, shard: FinishedShard) -> Result<String> {
        let data = self
            .slots
            .lock()
            .remove(&shard.uuid)
            .ok_or_else(|| anyhow!("no shard uploaded for {}", shard.uuid))?;
        let mut hasher = ShardHasher::new();
        hasher.update(&data);
        if hasher.finalize_hex() != shard.hash {
            return Err(anyhow!("shard hash does not match uploaded bytes"));
        }
        let file_id = uuid::Uuid::new_v4().simple().to_string();
        self.files.lock().insert(
            file_id.clone(),
            StoredFile {
                index_hex: index_hex.to_string(),
                hash: shard.hash,
                data,
            },
        );
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(file_id)
    }
}

/// Photos API keyed by `(userId, hash)` with failure injection.
pub struct FakePhotosApi {
    photos: Mutex<Vec<RemotePhoto>>,
    clock: Mutex<DateTime<Utc>>,
    pub creates: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub preview_updates: AtomicUsize,
    /// Fail this many upcoming `find_or_create_photo` calls.
    pub fail_creates: AtomicUsize,
    pub storage_full: AtomicBool,
}

impl Default for FakePhotosApi {
    fn default() -> Self {
        Self {
            photos: Mutex::new(Vec::new()),
            clock: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            creates: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            preview_updates: AtomicUsize::new(0),
            fail_creates: AtomicUsize::new(0),
            storage_full: AtomicBool::new(false),
        }
    }
}

impl FakePhotosApi {
    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock();
        *clock += ChronoDuration::seconds(1);
        *clock
    }

    /// Store a photo as-is, stamping a fresh `updatedAt`.
    pub fn insert(&self, mut photo: RemotePhoto) -> RemotePhoto {
        photo.updated_at = self.tick();
        self.photos.lock().push(photo.clone());
        photo
    }

    pub fn all(&self) -> Vec<RemotePhoto> {
        self.photos.lock().clone()
    }

    /// Give every stored photo the same `updatedAt`.
    pub fn stamp_all(&self, at: DateTime<Utc>) {
        for photo in self.photos.lock().iter_mut() {
            photo.updated_at = at;
        }
    }
}

#[async_trait]
impl PhotosApi for FakePhotosApi {
    async fn find_or_create_photo(&self, request: &CreatePhotoRequest) -> Result<RemotePhoto> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.storage_full.load(Ordering::SeqCst) {
            return Err(SyncError::StorageLimitReached.into());
        }
        let failing = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::Http {
                status: 503,
                body: "try again".into(),
            }
            .into());
        }
        let existing = self
            .photos
            .lock()
            .iter()
            .find(|p| p.user_id == request.user_id && p.hash == request.hash)
            .cloned();
        if let Some(photo) = existing {
            return Ok(photo);
        }
        let now = self.tick();
        let photo = RemotePhoto {
            id: format!("photo-{}", self.creates.fetch_add(1, Ordering::SeqCst) + 1),
            file_id: request.file_id.clone(),
            preview_id: request.preview_id.clone(),
            previews: request.previews.clone(),
            name: request.name.clone(),
            format: request.format.clone(),
            size: request.size,
            width: request.width,
            height: request.height,
            hash: request.hash.clone(),
            status: RemotePhotoStatus::Exists,
            taken_at: request.taken_at,
            created_at: now,
            updated_at: now,
            device_id: request.device_id.clone(),
            user_id: request.user_id.clone(),
            network_bucket_id: Some(request.network_bucket_id.clone()),
            item_type: request.item_type,
            duration: None,
        };
        self.photos.lock().push(photo.clone());
        Ok(photo)
    }

    async fn list_updated_since(
        &self,
        since: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RemotePhoto>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut page: Vec<RemotePhoto> = self
            .photos
            .lock()
            .iter()
            .filter(|p| match after_id {
                Some(id) => (p.updated_at, p.id.as_str()) > (since, id),
                None => p.updated_at >= since,
            })
            .cloned()
            .collect();
        page.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
        page.truncate(limit);
        Ok(page)
    }

    async fn get_photo(&self, photo_id: &str) -> Result<RemotePhoto> {
        self.photos
            .lock()
            .iter()
            .find(|p| p.id == photo_id)
            .cloned()
            .ok_or_else(|| anyhow!("photo {photo_id} not found"))
    }

    async fn update_previews(&self, photo_id: &str, previews: &[PhotoPreview]) -> Result<RemotePhoto> {
        self.preview_updates.fetch_add(1, Ordering::SeqCst);
        let now = self.tick();
        let mut photos = self.photos.lock();
        let photo = photos
            .iter_mut()
            .find(|p| p.id == photo_id)
            .ok_or_else(|| anyhow!("photo {photo_id} not found"))?;
        photo.previews = previews.to_vec();
        if let Some(first) = previews.first() {
            photo.preview_id = first.file_id.clone();
        }
        photo.updated_at = now;
        Ok(photo.clone())
    }

    async fn delete_photo(&self, photo_id: &str) -> Result<()> {
        let mut photos = self.photos.lock();
        if let Some(photo) = photos.iter_mut().find(|p| p.id == photo_id) {
            photo.status = RemotePhotoStatus::Deleted;
        }
        Ok(())
    }
}

/// Writes a small marker file instead of decoding images.
#[derive(Default)]
pub struct FakePreviews {
    pub calls: AtomicUsize,
    /// Crash inside `generate` instead of returning.
    pub panics: AtomicBool,
}

#[async_trait]
impl PreviewGenerator for FakePreviews {
    async fn generate(
        &self,
        source: &Path,
        target_width: u32,
        target_height: u32,
        dest: &Path,
    ) -> Result<GeneratedPreview> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics.load(Ordering::SeqCst) {
            panic!("preview decoder crashed on {}", source.display());
        }
        let data = format!("preview {target_width}x{target_height} of {}", source.display());
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, data.as_bytes()).await?;
        Ok(GeneratedPreview {
            path: dest.to_path_buf(),
            width: target_width,
            height: target_height,
            size: data.len() as u64,
            format: "jpg".to_string(),
        })
    }
}

/// Library backed by a fixed asset list with offset cursors.
#[derive(Default)]
pub struct VecLibrary {
    assets: Mutex<Vec<DeviceAsset>>,
    pub list_calls: AtomicUsize,
    pub page_sizes: Mutex<Vec<usize>>,
    pub fail: AtomicBool,
}

impl VecLibrary {
    pub fn new(assets: Vec<DeviceAsset>) -> Self {
        Self {
            assets: Mutex::new(assets),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaLibraryProvider for VecLibrary {
    async fn list_assets(&self, cursor: Option<&str>, page_size: usize) -> Result<AssetPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("media library permission denied"));
        }
        let assets = self.assets.lock().clone();
        let offset: usize = cursor.map(|c| c.parse()).transpose()?.unwrap_or(0);
        let end = (offset + page_size).min(assets.len());
        let page = assets[offset.min(end)..end].to_vec();
        self.page_sizes.lock().push(page.len());
        let has_next_page = end < assets.len();
        Ok(AssetPage {
            assets: page,
            next_cursor: has_next_page.then(|| end.to_string()),
            has_next_page,
            total_count: assets.len() as u64,
        })
    }
}

pub fn base_taken_at() -> i64 {
    Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap().timestamp_millis()
}

/// Write `count` distinct photo files and describe them as device assets.
pub fn make_assets(dir: &Path, count: usize) -> Vec<DeviceAsset> {
    std::fs::create_dir_all(dir).unwrap();
    (0..count)
        .map(|i| {
            let filename = format!("IMG_{i:04}.jpg");
            let path = dir.join(&filename);
            std::fs::write(&path, format!("photo bytes {i} {}", "x".repeat(200 + i))).unwrap();
            let taken_at = base_taken_at() + i as i64 * 1000;
            DeviceAsset {
                id: format!("asset-{i}"),
                uri: format!("file://{}", path.display()),
                filename,
                width: 400,
                height: 300,
                creation_time: taken_at,
                modification_time: taken_at,
                media_kind: MediaKind::Photo,
            }
        })
        .collect()
}

pub fn test_config(data_dir: &Path) -> SyncConfig {
    SyncConfig {
        min_upload_task_ms: 0,
        decrypt_chunk_size: 4096,
        data_dir: data_dir.to_path_buf(),
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub ctx: Arc<SyncContext>,
    pub bridge: Arc<MemoryBridge>,
    pub api: Arc<FakePhotosApi>,
    pub library: Arc<VecLibrary>,
    pub previews: Arc<FakePreviews>,
    pub logger: Arc<MemoryLogger>,
    pub index: Arc<LocalSyncIndex>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
}

impl Harness {
    /// `count` device photos and default tuning.
    pub fn new(count: usize) -> Self {
        Self::build(count, |_| {})
    }

    pub fn build(count: usize, tune: impl FnOnce(&mut SyncConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let assets = make_assets(&dir.path().join("library"), count);
        Self::with_assets(dir, assets, tune)
    }

    pub fn with_assets(
        dir: tempfile::TempDir,
        assets: Vec<DeviceAsset>,
        tune: impl FnOnce(&mut SyncConfig),
    ) -> Self {
        let mut config = test_config(&dir.path().join("data"));
        tune(&mut config);

        let bridge = Arc::new(MemoryBridge::default());
        let api = Arc::new(FakePhotosApi::default());
        let library = Arc::new(VecLibrary::new(assets));
        let previews = Arc::new(FakePreviews::default());
        let logger = Arc::new(MemoryLogger::default());
        let index = Arc::new(LocalSyncIndex::open_in_memory().unwrap());
        let checkpoints = Arc::new(MemoryCheckpointStore::default());
        let as_logger: Arc<dyn SyncLogger> = logger.clone();

        let transfer = Arc::new(Transfer::new(
            bridge.clone(),
            MNEMONIC,
            config.tmp_dir(),
            config.decrypt_chunk_size,
            as_logger.clone(),
        ));
        let ctx = Arc::new(SyncContext {
            user_id: USER.to_string(),
            device_id: "device-1".to_string(),
            bucket_id: BUCKET.to_string(),
            paths: PhotoPaths::under(&config.data_dir),
            index: index.clone(),
            checkpoints: checkpoints.clone(),
            library: library.clone(),
            resolver: Arc::new(FileUriResolver),
            previews: previews.clone(),
            photos_api: api.clone(),
            transfer,
            reporter: Arc::new(LogErrorReporter::new(as_logger.clone())),
            logger: as_logger,
            config,
        });
        Self {
            dir,
            ctx,
            bridge,
            api,
            library,
            previews,
            logger,
            index,
            checkpoints,
        }
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.ctx.tmp_dir().to_path_buf()
    }

    /// Files left behind in the transfer scratch directory.
    pub fn leftover_tmp_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.tmp_dir()) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Encrypt and store `data` in the bridge, returning its file id.
    pub async fn store_file(&self, label: &str, data: &[u8]) -> String {
        let src = self.dir.path().join(format!("{label}.src"));
        std::fs::write(&src, data).unwrap();
        self.ctx
            .transfer
            .upload_file(BUCKET, &src, &CancellationToken::new())
            .await
            .unwrap()
    }

    /// A remote photo whose preview is already stored in the bridge.
    pub async fn seed_remote_photo(&self, n: usize) -> RemotePhoto {
        let preview_id = self.store_file(&format!("preview-{n}"), format!("preview {n}").as_bytes()).await;
        let file_id = self.store_file(&format!("full-{n}"), format!("full size {n}").as_bytes()).await;
        let taken_at = Utc.timestamp_millis_opt(base_taken_at() + n as i64 * 1000).unwrap();
        self.api.insert(RemotePhoto {
            id: format!("remote-{n}"),
            file_id,
            preview_id: preview_id.clone(),
            previews: vec![PhotoPreview {
                width: 512,
                height: 384,
                size: 9,
                file_id: preview_id,
                format: "jpg".to_string(),
            }],
            name: format!("REMOTE_{n:04}"),
            format: "jpg".to_string(),
            size: 11,
            width: 4032,
            height: 3024,
            hash: format!("remote-hash-{n}"),
            status: RemotePhotoStatus::Exists,
            taken_at,
            created_at: taken_at,
            updated_at: taken_at,
            device_id: "other-device".to_string(),
            user_id: USER.to_string(),
            network_bucket_id: Some(BUCKET.to_string()),
            item_type: MediaKind::Photo,
            duration: None,
        })
    }
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
