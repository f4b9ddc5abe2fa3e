//! Sync Orchestrator: wires scanner, checker, uploader and remote pull into
//! one lifecycle and keeps the run counters.

use crate::checker::{CheckerStatus, SyncChecker};
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::logger::SYNC;
use crate::model::{OperationPriority, PhotosItem, SyncOperation, SyncStage};
use crate::remote_pull::RemotePullManager;
use crate::scanner::{DeviceScanner, DevicePresence, ScannerStatus};
use crate::uploader::{UploadManager, UploadResult, UploaderStatus};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncManagerStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
    NoPhotosToSync,
}

impl SyncManagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
            Self::NoPhotosToSync => "NO_PHOTOS_TO_SYNC",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub total_photos_in_device: u64,
    pub total_already_synced: u64,
    pub total_needing_sync: u64,
    pub total_synced: u64,
    pub total_failed: u64,
}

impl SyncCounters {
    pub fn synced_count(&self) -> u64 {
        self.total_synced + self.total_already_synced
    }

    pub fn pending_count(&self) -> u64 {
        self.total_needing_sync.saturating_sub(self.total_synced)
    }
}

type SyncedHook = Arc<dyn Fn(Option<&anyhow::Error>, Option<&PhotosItem>) + Send + Sync>;
type TotalHook = Arc<dyn Fn(u64) + Send + Sync>;
type ItemHook = Arc<dyn Fn(&PhotosItem) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;
type UnitHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    photo_synced: Option<SyncedHook>,
    total: Option<TotalHook>,
    upload_start: Option<ItemHook>,
    storage_limit: Option<UnitHook>,
    scan_error: Option<ErrorHook>,
}

struct Inner {
    ctx: Arc<SyncContext>,
    scanner: Arc<DeviceScanner>,
    checker: Arc<SyncChecker>,
    uploader: Arc<UploadManager>,
    remote: Arc<RemotePullManager>,
    status: watch::Sender<SyncManagerStatus>,
    counters: Mutex<SyncCounters>,
    hooks: Mutex<Hooks>,
    storage_limit_notified: Mutex<bool>,
    started_at: Mutex<Option<Instant>>,
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let scanner = DeviceScanner::new(&ctx);
        let checker = SyncChecker::new(&ctx);
        let uploader = UploadManager::new(ctx.clone());
        let remote = RemotePullManager::new(ctx.clone());
        remote.set_device_presence(scanner.clone() as Arc<dyn DevicePresence>);
        let (status, _) = watch::channel(SyncManagerStatus::Idle);

        let inner = Arc::new(Inner {
            ctx,
            scanner,
            checker,
            uploader,
            remote,
            status,
            counters: Mutex::new(SyncCounters::default()),
            hooks: Mutex::new(Hooks::default()),
            storage_limit_notified: Mutex::new(false),
            started_at: Mutex::new(None),
        });
        Inner::wire(&inner);
        Self { inner }
    }

    pub fn on_photo_sync_completed(
        &self,
        f: impl Fn(Option<&anyhow::Error>, Option<&PhotosItem>) + Send + Sync + 'static,
    ) {
        self.inner.hooks.lock().photo_synced = Some(Arc::new(f));
    }

    pub fn on_total_photos_calculated(&self, f: impl Fn(u64) + Send + Sync + 'static) {
        self.inner.hooks.lock().total = Some(Arc::new(f));
    }

    pub fn on_upload_start(&self, f: impl Fn(&PhotosItem) + Send + Sync + 'static) {
        self.inner.hooks.lock().upload_start = Some(Arc::new(f));
    }

    pub fn on_storage_limit_reached(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.hooks.lock().storage_limit = Some(Arc::new(f));
    }

    pub fn on_scan_error(&self, f: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
        self.inner.hooks.lock().scan_error = Some(Arc::new(f));
    }

    /// Every status change, including the ABORTED tick of `destroy`.
    pub fn subscribe(&self) -> watch::Receiver<SyncManagerStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> SyncManagerStatus {
        *self.inner.status.borrow()
    }

    pub fn counters(&self) -> SyncCounters {
        *self.inner.counters.lock()
    }

    pub fn scanner(&self) -> &Arc<DeviceScanner> {
        &self.inner.scanner
    }

    pub fn checker(&self) -> &Arc<SyncChecker> {
        &self.inner.checker
    }

    pub fn uploader(&self) -> &Arc<UploadManager> {
        &self.inner.uploader
    }

    pub fn remote(&self) -> &Arc<RemotePullManager> {
        &self.inner.remote
    }

    pub fn run(&self) {
        let inner = &self.inner;
        if matches!(
            self.status(),
            SyncManagerStatus::Running | SyncManagerStatus::Paused
        ) {
            return;
        }
        *inner.counters.lock() = SyncCounters::default();
        *inner.storage_limit_notified.lock() = false;
        *inner.started_at.lock() = Some(Instant::now());
        inner.update_status(SyncManagerStatus::Running);
        inner.scanner.run();
    }

    /// Only uploads stop; scanning and checking keep filling the queue.
    pub fn pause(&self) {
        if self.status() != SyncManagerStatus::Running {
            return;
        }
        self.inner.uploader.pause();
        self.inner.update_status(SyncManagerStatus::Paused);
    }

    pub fn resume(&self) {
        if self.status() != SyncManagerStatus::Paused {
            return;
        }
        self.inner.update_status(SyncManagerStatus::Running);
        self.inner.uploader.resume();
        self.inner.check_finished();
    }

    pub fn destroy(&self) {
        let inner = &self.inner;
        inner.checker.destroy();
        inner.scanner.destroy();
        inner.uploader.destroy();
        inner.remote.destroy();
        *inner.counters.lock() = SyncCounters::default();
        inner.update_status(SyncManagerStatus::Aborted);
        inner.update_status(SyncManagerStatus::Idle);
    }

    pub fn restart(&self) {
        self.destroy();
        self.run();
    }

    /// Wait until the run completes, is aborted or goes idle.
    pub async fn wait_until_settled(&self) -> SyncManagerStatus {
        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|s| {
                matches!(
                    s,
                    SyncManagerStatus::Completed
                        | SyncManagerStatus::Aborted
                        | SyncManagerStatus::Idle
                )
            })
            .await
            .map(|s| *s);
        settled.unwrap_or(SyncManagerStatus::Idle)
    }

    /// Pull remote changes in the foreground.
    pub async fn pull_remote(&self) -> Result<crate::remote_pull::RemotePullStatus> {
        self.inner.remote.pull().await
    }
}

impl Inner {
    fn wire(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);

        let w = weak.clone();
        this.scanner.on_total_photos_calculated(move |total| {
            if let Some(inner) = w.upgrade() {
                inner.counters.lock().total_photos_in_device = total;
                let hook = inner.hooks.lock().total.clone();
                if let Some(hook) = hook {
                    hook(total);
                }
            }
        });

        let w = weak.clone();
        this.scanner.on_group_of_photos_ready(move |items| {
            if let Some(inner) = w.upgrade() {
                inner.enqueue_checks(&w, items);
            }
        });

        let w = weak.clone();
        this.scanner.on_status_change(move |status| {
            if let Some(inner) = w.upgrade() {
                if status == ScannerStatus::NoPhotosInDevice {
                    inner.update_status(SyncManagerStatus::NoPhotosToSync);
                }
                if matches!(
                    status,
                    ScannerStatus::Completed | ScannerStatus::NoPhotosInDevice
                ) {
                    inner.check_finished();
                }
            }
        });

        let w = weak.clone();
        this.scanner.on_error(move |err| {
            if let Some(inner) = w.upgrade() {
                inner.ctx.logger.error("scan", &format!("{err:#}"));
                let hook = inner.hooks.lock().scan_error.clone();
                if let Some(hook) = hook {
                    hook(err);
                }
                inner.update_status(SyncManagerStatus::Aborted);
            }
        });

        let w = weak.clone();
        this.checker.on_status_change(move |status| {
            if status == CheckerStatus::Completed {
                if let Some(inner) = w.upgrade() {
                    inner.check_finished();
                }
            }
        });

        let w = weak.clone();
        this.uploader.on_status_change(move |status| {
            if status == UploaderStatus::Completed {
                if let Some(inner) = w.upgrade() {
                    inner.check_finished();
                }
            }
        });

        let w = weak;
        this.uploader.on_upload_start(move |item| {
            if let Some(inner) = w.upgrade() {
                let hook = inner.hooks.lock().upload_start.clone();
                if let Some(hook) = hook {
                    hook(item);
                }
            }
        });
    }

    fn enqueue_checks(&self, weak: &Weak<Self>, items: Vec<PhotosItem>) {
        for item in items {
            let w = weak.clone();
            self.checker
                .add_operation(item, OperationPriority::Normal, move |operation| {
                    if let Some(inner) = w.upgrade() {
                        inner.on_check_resolved(&w, operation);
                    }
                });
        }
        if self.checker.status() != CheckerStatus::Running {
            self.checker.run();
        }
    }

    fn on_check_resolved(&self, weak: &Weak<Self>, operation: SyncOperation) {
        match operation.sync_stage {
            SyncStage::InSync => {
                self.counters.lock().total_already_synced += 1;
            }
            SyncStage::NeedsRemoteCheck => {
                self.counters.lock().total_needing_sync += 1;
                let w = weak.clone();
                self.uploader
                    .add_operation(operation.photos_item, 0, move |result| {
                        if let Some(inner) = w.upgrade() {
                            inner.on_upload_finished(result);
                        }
                    });
                if matches!(
                    self.uploader.status(),
                    UploaderStatus::Idle | UploaderStatus::Aborted
                ) {
                    self.uploader.run();
                }
            }
            SyncStage::FailedToCheck | SyncStage::Unknown => {
                self.counters.lock().total_failed += 1;
                let err: anyhow::Error = SyncError::Check(
                    operation
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "unresolved sync stage".to_string()),
                )
                .into();
                self.ctx.reporter.report(&err, "check");
                self.emit_synced(Some(&err), Some(&operation.photos_item));
            }
        }
    }

    fn on_upload_finished(&self, result: Result<UploadResult>) {
        match result {
            Ok(upload) => {
                if self.status() == SyncManagerStatus::Idle {
                    return;
                }
                match self.ctx.index.save_photo(&upload.photo) {
                    Ok(_) => {
                        self.counters.lock().total_synced += 1;
                        self.emit_synced(None, Some(&upload.item));
                    }
                    Err(e) => {
                        self.counters.lock().total_failed += 1;
                        self.ctx.reporter.report(&e, "save_uploaded_photo");
                        self.emit_synced(Some(&e), Some(&upload.item));
                    }
                }
            }
            Err(e) if SyncError::is_aborted(&e) => {}
            Err(e) if SyncError::is_storage_limit(&e) => {
                self.counters.lock().total_failed += 1;
                let first = {
                    let mut notified = self.storage_limit_notified.lock();
                    !std::mem::replace(&mut *notified, true)
                };
                if first {
                    self.ctx.logger.error("upload", "storage limit reached");
                    let hook = self.hooks.lock().storage_limit.clone();
                    if let Some(hook) = hook {
                        hook();
                    }
                }
                self.emit_synced(Some(&e), None);
            }
            Err(e) => {
                self.counters.lock().total_failed += 1;
                self.ctx.reporter.report(&e, "upload");
                self.emit_synced(Some(&e), None);
            }
        }
    }

    fn emit_synced(&self, err: Option<&anyhow::Error>, item: Option<&PhotosItem>) {
        let hook = self.hooks.lock().photo_synced.clone();
        if let Some(hook) = hook {
            hook(err, item);
        }
    }

    fn status(&self) -> SyncManagerStatus {
        *self.status.borrow()
    }

    fn check_finished(&self) {
        if !matches!(
            self.status(),
            SyncManagerStatus::Running | SyncManagerStatus::NoPhotosToSync
        ) {
            return;
        }
        let scanner_done = self.scanner.has_finished();
        let nothing_to_check = self.scanner.status() == ScannerStatus::NoPhotosInDevice;
        if scanner_done
            && (nothing_to_check || self.checker.has_finished())
            && self.uploader.has_finished()
        {
            self.finish();
        }
    }

    fn finish(&self) {
        if let Err(e) = self
            .ctx
            .checkpoints
            .save_last_uploaded_page(self.scanner.pages_emitted())
        {
            self.ctx.reporter.report(&e, "save_last_uploaded_page");
        }
        let counters = *self.counters.lock();
        let seconds = self
            .started_at
            .lock()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.ctx
            .logger
            .done(counters.total_synced, counters.total_failed, seconds);
        self.update_status(SyncManagerStatus::Completed);
    }

    fn update_status(&self, status: SyncManagerStatus) {
        let mut previous = status;
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            previous = std::mem::replace(current, status);
            true
        });
        if changed {
            self.ctx
                .logger
                .status_change(SYNC, previous.as_str(), status.as_str());
        }
    }
}
