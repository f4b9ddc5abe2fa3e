//! Upload Manager: hashes, dedups, encrypts and registers device photos.

use crate::checksum::{photo_hash, sha256_file};
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::logger::UPLOADER;
use crate::media::CreatePhotoRequest;
use crate::model::{PhotoPreview, PhotosItem, RemotePhoto};
use crate::preview::preview_dimensions;
use crate::queue::{TaskOutcome, WorkQueue, Worker};
use crate::transfer::TempFile;
use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploaderStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl UploaderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub photo: RemotePhoto,
    pub item: PhotosItem,
    /// Found in the index by hash; nothing was sent.
    pub deduplicated: bool,
}

pub type UploadCompleted = Box<dyn FnOnce(Result<UploadResult>) + Send>;

pub struct UploadTask {
    item: PhotosItem,
    retries: u32,
    on_completed: UploadCompleted,
}

type StatusHook = Arc<dyn Fn(UploaderStatus) + Send + Sync>;
type StartHook = Arc<dyn Fn(&PhotosItem) + Send + Sync>;

pub struct UploadManager {
    ctx: Arc<SyncContext>,
    queue: WorkQueue<UploadTask>,
    status: Mutex<UploaderStatus>,
    cancel: Mutex<CancellationToken>,
    storage_full: AtomicBool,
    on_status: Mutex<Option<StatusHook>>,
    on_start: Mutex<Option<StartHook>>,
}

impl UploadManager {
    pub fn new(ctx: Arc<SyncContext>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let drain_weak = weak.clone();
            let weak = weak.clone();
            let worker: Worker<UploadTask> = Arc::new(move |task: UploadTask| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(manager) => manager.process(task).await,
                        None => TaskOutcome::Done,
                    }
                }
                .boxed()
            });
            let queue = WorkQueue::paused(ctx.config.upload_concurrency, worker);
            queue.on_drain(move || {
                if let Some(manager) = drain_weak.upgrade() {
                    manager.on_drain();
                }
            });
            Self {
                queue,
                status: Mutex::new(UploaderStatus::Idle),
                cancel: Mutex::new(CancellationToken::new()),
                storage_full: AtomicBool::new(false),
                on_status: Mutex::new(None),
                on_start: Mutex::new(None),
                ctx,
            }
        })
    }

    pub fn on_status_change(&self, f: impl Fn(UploaderStatus) + Send + Sync + 'static) {
        *self.on_status.lock() = Some(Arc::new(f));
    }

    pub fn on_upload_start(&self, f: impl Fn(&PhotosItem) + Send + Sync + 'static) {
        *self.on_start.lock() = Some(Arc::new(f));
    }

    pub fn status(&self) -> UploaderStatus {
        *self.status.lock()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.running()
    }

    pub fn has_finished(&self) -> bool {
        self.queue.is_idle()
    }

    pub fn add_operation(
        &self,
        item: PhotosItem,
        retries: u32,
        on_completed: impl FnOnce(Result<UploadResult>) + Send + 'static,
    ) {
        let task = UploadTask {
            item,
            retries,
            on_completed: Box::new(on_completed),
        };
        // Status and queue change together so a concurrent drain cannot
        // mark the run complete with this task still queued.
        let reopened = {
            let mut current = self.status.lock();
            let reopened = (*current == UploaderStatus::Completed && !self.queue.is_paused())
                .then(|| std::mem::replace(&mut *current, UploaderStatus::Running));
            self.queue.push(task);
            reopened
        };
        if let Some(previous) = reopened {
            self.announce(previous, UploaderStatus::Running);
        }
    }

    pub fn run(&self) {
        if matches!(self.status(), UploaderStatus::Idle | UploaderStatus::Aborted) {
            self.storage_full.store(false, Ordering::SeqCst);
        }
        self.update_status(UploaderStatus::Running);
        self.queue.resume();
        if self.queue.is_idle() {
            self.update_status(UploaderStatus::Completed);
        }
    }

    /// Stops new tasks from starting; in-flight uploads finish.
    pub fn pause(&self) {
        self.queue.pause();
        self.update_status(UploaderStatus::Paused);
    }

    pub fn resume(&self) {
        if self.status() == UploaderStatus::Paused {
            self.run();
        }
    }

    /// Abort in-flight uploads immediately and drop the queue.
    pub fn destroy(&self) {
        {
            let mut cancel = self.cancel.lock();
            cancel.cancel();
            *cancel = CancellationToken::new();
        }
        self.queue.kill();
        self.queue.pause();
        self.update_status(UploaderStatus::Aborted);
    }

    fn on_drain(&self) {
        let previous = {
            let mut current = self.status.lock();
            if self.queue.is_paused()
                || !self.queue.is_idle()
                || *current == UploaderStatus::Completed
            {
                return;
            }
            std::mem::replace(&mut *current, UploaderStatus::Completed)
        };
        self.announce(previous, UploaderStatus::Completed);
    }

    async fn process(&self, mut task: UploadTask) -> TaskOutcome<UploadTask> {
        if self.storage_full.load(Ordering::SeqCst) {
            (task.on_completed)(Err(SyncError::StorageLimitReached.into()));
            return TaskOutcome::Done;
        }
        let cancel = self.cancel.lock().clone();
        let hook = self.on_start.lock().clone();
        if let Some(hook) = hook {
            hook(&task.item);
        }

        let started = Instant::now();
        let attempt = AssertUnwindSafe(self.upload(&task.item, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("upload of {} panicked", task.item.display_name())));
        match attempt {
            Ok(result) => {
                self.ctx
                    .logger
                    .upload_done(&task.item.display_name(), started.elapsed());
                (task.on_completed)(Ok(result));
                TaskOutcome::Done
            }
            Err(e) if SyncError::is_aborted(&e) => {
                (task.on_completed)(Err(e));
                TaskOutcome::Done
            }
            Err(e) if SyncError::is_storage_limit(&e) => {
                self.storage_full.store(true, Ordering::SeqCst);
                self.ctx.logger.error("upload", "storage limit reached");
                (task.on_completed)(Err(e));
                TaskOutcome::Done
            }
            Err(e) => {
                let floor = Duration::from_millis(self.ctx.config.min_upload_task_ms);
                let elapsed = started.elapsed();
                if elapsed < floor {
                    tokio::time::sleep(floor - elapsed).await;
                }
                let name = task.item.display_name();
                if task.retries < self.ctx.config.max_upload_retries {
                    task.retries += 1;
                    self.ctx.logger.info(
                        UPLOADER,
                        &format!("RETRY name={} attempt={} err={:#}", name, task.retries + 1, e),
                    );
                    TaskOutcome::Retry(task)
                } else {
                    let err = SyncError::Upload {
                        name,
                        attempts: task.retries + 1,
                        reason: format!("{e:#}"),
                    };
                    (task.on_completed)(Err(err.into()));
                    TaskOutcome::Done
                }
            }
        }
    }

    async fn upload(&self, item: &PhotosItem, cancel: &CancellationToken) -> Result<UploadResult> {
        let ctx = &self.ctx;
        let tmp_dir = ctx.tmp_dir().to_path_buf();
        let resolved = ctx.resolver.resolve(item, &tmp_dir).await?;
        let _exported = resolved.temporary.then(|| TempFile::new(resolved.path.clone()));

        let path = resolved.path.clone();
        let (file_hash, size) = tokio::task::spawn_blocking(move || -> Result<([u8; 32], u64)> {
            Ok((sha256_file(&path)?, std::fs::metadata(&path)?.len()))
        })
        .await
        .context("hash task panicked")??;
        let hash = photo_hash(&ctx.user_id, &item.name, item.taken_at, &hex::encode(file_hash));

        if let Some(photo) = ctx.index.get_by_hash(&hash)? {
            return Ok(UploadResult {
                photo,
                item: item.clone(),
                deduplicated: true,
            });
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Aborted.into());
        }

        tokio::fs::create_dir_all(&tmp_dir).await?;
        let (width, height) = preview_dimensions(item.width, item.height, ctx.config.preview_width);
        let preview_file = TempFile::new(tmp_dir.join(format!(
            "{}-{}-preview.jpg",
            item.name,
            uuid::Uuid::new_v4().simple()
        )));
        let preview = ctx
            .previews
            .generate(&resolved.path, width, height, preview_file.path())
            .await
            .with_context(|| format!("generating preview for {}", item.display_name()))?;
        let preview_id = ctx
            .transfer
            .upload_file(&ctx.bucket_id, &preview.path, cancel)
            .await
            .context("uploading preview")?;
        let file_id = ctx
            .transfer
            .upload_file(&ctx.bucket_id, &resolved.path, cancel)
            .await
            .context("uploading photo")?;

        let taken_at = Utc
            .timestamp_millis_opt(item.taken_at)
            .single()
            .ok_or_else(|| anyhow!("invalid takenAt {}", item.taken_at))?;
        let request = CreatePhotoRequest {
            name: item.name.clone(),
            format: item.format.clone(),
            size,
            width: item.width,
            height: item.height,
            file_id,
            preview_id: preview_id.clone(),
            previews: vec![PhotoPreview {
                width: preview.width,
                height: preview.height,
                size: preview.size,
                file_id: preview_id,
                format: preview.format,
            }],
            device_id: ctx.device_id.clone(),
            user_id: ctx.user_id.clone(),
            hash,
            taken_at,
            network_bucket_id: ctx.bucket_id.clone(),
            item_type: item.kind,
        };
        let photo = ctx.photos_api.find_or_create_photo(&request).await?;
        Ok(UploadResult {
            photo,
            item: item.clone(),
            deduplicated: false,
        })
    }

    fn update_status(&self, status: UploaderStatus) {
        let previous = {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            std::mem::replace(&mut *current, status)
        };
        self.announce(previous, status);
    }

    fn announce(&self, previous: UploaderStatus, status: UploaderStatus) {
        self.ctx
            .logger
            .status_change(UPLOADER, previous.as_str(), status.as_str());
        let hook = self.on_status.lock().clone();
        if let Some(hook) = hook {
            hook(status);
        }
    }
}
