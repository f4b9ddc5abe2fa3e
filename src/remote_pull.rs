//! Remote Pull Manager: pages through photos updated on the server, records
//! them in the index and materializes their previews.

use crate::config::DEFAULT_PULL_START;
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::logger::REMOTE_PULL;
use crate::model::{PhotosItem, RemotePhoto, RemotePhotoStatus};
use crate::preview::{needs_preview_fix, repair_preview};
use crate::queue::{TaskOutcome, WorkQueue, Worker};
use crate::scanner::DevicePresence;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePullStatus {
    Idle,
    Syncing,
    Synced,
    Aborted,
}

impl RemotePullStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Syncing => "SYNCING",
            Self::Synced => "SYNCED",
            Self::Aborted => "ABORTED",
        }
    }
}

struct PreviewTask {
    photo: RemotePhoto,
    retries: u32,
}

/// Outcome bounds of the current pull, used to place the checkpoint.
#[derive(Default)]
struct PullProgress {
    latest_success: Option<DateTime<Utc>>,
    earliest_failure: Option<DateTime<Utc>>,
}

impl PullProgress {
    fn succeeded(&mut self, at: DateTime<Utc>) {
        self.latest_success = self.latest_success.max(Some(at));
    }

    fn failed(&mut self, at: DateTime<Utc>) {
        self.earliest_failure = Some(match self.earliest_failure {
            Some(f) => f.min(at),
            None => at,
        });
    }

    /// Newest date that is safe to resume after: never at or past a failure.
    fn checkpoint(&self) -> Option<DateTime<Utc>> {
        let best = self.latest_success?;
        match self.earliest_failure {
            Some(f) if best >= f => Some(f - Duration::milliseconds(1)),
            _ => Some(best),
        }
    }
}

type StatusHook = Arc<dyn Fn(RemotePullStatus) + Send + Sync>;
type PageHook = Arc<dyn Fn(&[RemotePhoto]) + Send + Sync>;

pub struct RemotePullManager {
    ctx: Arc<SyncContext>,
    queue: WorkQueue<PreviewTask>,
    status: Mutex<RemotePullStatus>,
    cancel: Mutex<CancellationToken>,
    epoch: AtomicU64,
    progress: Mutex<PullProgress>,
    presence: Mutex<Option<Arc<dyn DevicePresence>>>,
    on_status: Mutex<Option<StatusHook>>,
    on_page: Mutex<Option<PageHook>>,
}

pub fn default_pull_start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(DEFAULT_PULL_START)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

impl RemotePullManager {
    pub fn new(ctx: Arc<SyncContext>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let worker: Worker<PreviewTask> = Arc::new(move |task: PreviewTask| {
                let weak = weak.clone();
                async move {
                    let Some(manager) = weak.upgrade() else {
                        return TaskOutcome::Done;
                    };
                    let photo = task.photo.clone();
                    match AssertUnwindSafe(manager.process(task)).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            let err = anyhow!("preview task for {} panicked", photo.name);
                            manager.ctx.reporter.report(&err, "preview_download");
                            manager.progress.lock().failed(photo.updated_at);
                            TaskOutcome::Done
                        }
                    }
                }
                .boxed()
            });
            Self {
                queue: WorkQueue::new(ctx.config.preview_concurrency, worker),
                status: Mutex::new(RemotePullStatus::Idle),
                cancel: Mutex::new(CancellationToken::new()),
                epoch: AtomicU64::new(0),
                progress: Mutex::new(PullProgress::default()),
                presence: Mutex::new(None),
                on_status: Mutex::new(None),
                on_page: Mutex::new(None),
                ctx,
            }
        })
    }

    pub fn set_device_presence(&self, presence: Arc<dyn DevicePresence>) {
        *self.presence.lock() = Some(presence);
    }

    pub fn on_status_change(&self, f: impl Fn(RemotePullStatus) + Send + Sync + 'static) {
        *self.on_status.lock() = Some(Arc::new(f));
    }

    pub fn on_remote_page_synced(&self, f: impl Fn(&[RemotePhoto]) + Send + Sync + 'static) {
        *self.on_page.lock() = Some(Arc::new(f));
    }

    pub fn status(&self) -> RemotePullStatus {
        *self.status.lock()
    }

    pub fn pending_previews(&self) -> usize {
        self.queue.len()
    }

    /// Start pulling in the background.
    pub fn run(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.pull().await {
                this.ctx.reporter.report(&e, "remote_pull");
            }
        });
    }

    /// Gates preview materialization only; metadata paging continues.
    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume();
    }

    pub fn destroy(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut cancel = self.cancel.lock();
            cancel.cancel();
            *cancel = CancellationToken::new();
        }
        self.queue.kill();
        self.update_status(RemotePullStatus::Aborted);
    }

    /// Pull every page updated since the checkpoint. Returns the final status.
    pub async fn pull(&self) -> Result<RemotePullStatus> {
        if self.status() == RemotePullStatus::Syncing {
            return Ok(RemotePullStatus::Syncing);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.progress.lock() = PullProgress::default();
        self.update_status(RemotePullStatus::Syncing);

        let per_page = self.ctx.config.remote_photos_per_page.max(1);
        // Resume at the checkpoint instant itself: photos sharing it may not
        // all have been seen.
        let mut from = self
            .ctx
            .checkpoints
            .last_pulled_date()?
            .unwrap_or_else(default_pull_start);
        let mut after_id: Option<String> = None;

        loop {
            let listed = self
                .ctx
                .photos_api
                .list_updated_since(from, after_id.as_deref(), per_page)
                .await;
            let page = match listed {
                Ok(page) => page,
                Err(e) => {
                    if self.is_current(epoch) {
                        self.update_status(RemotePullStatus::Idle);
                    }
                    return Err(e);
                }
            };
            if !self.is_current(epoch) {
                return Ok(RemotePullStatus::Aborted);
            }
            self.ctx.logger.info(
                REMOTE_PULL,
                &format!(
                    "PAGE since={} after={} photos={}",
                    from.to_rfc3339(),
                    after_id.as_deref().unwrap_or("-"),
                    page.len()
                ),
            );

            for photo in &page {
                if let Err(e) = self.ctx.index.save_photo(photo) {
                    self.ctx.reporter.report(&e, "save_remote_photo");
                }
                self.queue.push(PreviewTask {
                    photo: photo.clone(),
                    retries: 0,
                });
            }
            let hook = self.on_page.lock().clone();
            if let Some(hook) = hook {
                hook(&page);
            }

            self.queue.wait_idle().await;
            if !self.is_current(epoch) {
                return Ok(RemotePullStatus::Aborted);
            }
            self.save_checkpoint()?;

            match page.last() {
                Some(last) if page.len() >= per_page => {
                    from = last.updated_at;
                    after_id = Some(last.id.clone());
                }
                _ => break,
            }
        }

        self.update_status(RemotePullStatus::Synced);
        Ok(RemotePullStatus::Synced)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn save_checkpoint(&self) -> Result<()> {
        let Some(date) = self.progress.lock().checkpoint() else {
            return Ok(());
        };
        let stored = self.ctx.checkpoints.last_pulled_date()?;
        if stored.map_or(true, |s| date > s) {
            self.ctx.checkpoints.save_last_pulled_date(date)?;
        }
        Ok(())
    }

    async fn process(&self, mut task: PreviewTask) -> TaskOutcome<PreviewTask> {
        let cancel = self.cancel.lock().clone();
        let ctx = &self.ctx;

        if task.retries == 0 && needs_preview_fix(&task.photo) {
            match repair_preview(ctx, &task.photo, &cancel).await {
                Ok(updated) => {
                    if let Err(e) = ctx.index.save_photo(&updated) {
                        ctx.reporter.report(&e, "save_repaired_photo");
                    }
                    task.photo = updated;
                }
                Err(e) if SyncError::is_aborted(&e) => return TaskOutcome::Done,
                Err(e) => ctx.reporter.report(&e, "preview_repair"),
            }
        }

        let photo = &task.photo;
        if photo.status != RemotePhotoStatus::Exists {
            self.progress.lock().succeeded(photo.updated_at);
            return TaskOutcome::Done;
        }
        let on_device = self
            .presence
            .lock()
            .as_ref()
            .map(|p| p.has_photo_in_device(&photo.name, photo.taken_at_ms()))
            .unwrap_or(false);
        if on_device {
            self.progress.lock().succeeded(photo.updated_at);
            return TaskOutcome::Done;
        }

        let item = PhotosItem::from_remote(photo, &ctx.paths);
        let Some(dest) = item.local_preview_path.clone() else {
            return TaskOutcome::Done;
        };
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            self.progress.lock().succeeded(photo.updated_at);
            return TaskOutcome::Done;
        }

        let bucket = item.bucket_id.clone().unwrap_or_else(|| ctx.bucket_id.clone());
        let file_id = photo.preview_file_id().to_string();
        match ctx
            .transfer
            .download_file(&bucket, &file_id, &dest, &cancel, None)
            .await
        {
            Ok(()) => {
                self.progress.lock().succeeded(photo.updated_at);
                TaskOutcome::Done
            }
            Err(e) if SyncError::is_aborted(&e) => TaskOutcome::Done,
            Err(e) => {
                if task.retries < ctx.config.max_preview_download_retries {
                    task.retries += 1;
                    TaskOutcome::Retry(task)
                } else {
                    ctx.reporter.report(&e, "preview_download");
                    self.progress.lock().failed(photo.updated_at);
                    TaskOutcome::Done
                }
            }
        }
    }

    fn update_status(&self, status: RemotePullStatus) {
        let previous = {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            std::mem::replace(&mut *current, status)
        };
        self.ctx
            .logger
            .status_change(REMOTE_PULL, previous.as_str(), status.as_str());
        let hook = self.on_status.lock().clone();
        if let Some(hook) = hook {
            hook(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn checkpoint_stops_short_of_failures() {
        let mut p = PullProgress::default();
        assert_eq!(p.checkpoint(), None);
        p.succeeded(at(10));
        p.succeeded(at(30));
        p.succeeded(at(20));
        assert_eq!(p.checkpoint(), Some(at(30)));
        p.failed(at(25));
        assert_eq!(p.checkpoint(), Some(at(24)));
        p.failed(at(40));
        assert_eq!(p.checkpoint(), Some(at(24)));
    }

    #[test]
    fn default_start_is_2000() {
        assert_eq!(default_pull_start(), Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
    }
}
