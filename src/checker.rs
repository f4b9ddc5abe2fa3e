//! Sync Stage Checker: classifies each device item against the Local Sync Index.

use crate::context::SyncContext;
use crate::index::LocalSyncIndex;
use crate::logger::{SyncLogger, CHECKER};
use crate::model::{OperationPriority, PhotosItem, SyncOperation, SyncStage};
use crate::queue::{TaskOutcome, WorkQueue, Worker};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerStatus {
    Idle,
    Running,
    Paused,
    Completed,
}

impl CheckerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
        }
    }
}

pub type OperationCompleted = Box<dyn FnOnce(SyncOperation) + Send>;

pub struct CheckTask {
    operation: SyncOperation,
    on_completed: OperationCompleted,
}

type StatusHook = Arc<dyn Fn(CheckerStatus) + Send + Sync>;

pub struct SyncChecker {
    queue: WorkQueue<CheckTask>,
    status: Mutex<CheckerStatus>,
    started: AtomicBool,
    logger: Arc<dyn SyncLogger>,
    on_status: Mutex<Option<StatusHook>>,
}

/// Resolve an operation's stage from the index. Lookup failures are
/// recorded on the operation and never retried here.
pub fn check_operation(index: &LocalSyncIndex, mut operation: SyncOperation) -> SyncOperation {
    let item = &operation.photos_item;
    operation.last_try = Some(Utc::now());
    match index.get_by_name_and_taken_at(&item.name, item.taken_at) {
        Ok(Some(photo)) => {
            operation.sync_stage = SyncStage::InSync;
            operation.synced_photo = Some(photo);
        }
        Ok(None) => operation.sync_stage = SyncStage::NeedsRemoteCheck,
        Err(e) => {
            operation.sync_stage = SyncStage::FailedToCheck;
            operation.last_error = Some(format!("{e:#}"));
        }
    }
    operation
}

/// An operation whose lookup never ran to completion.
fn check_failed(mut operation: SyncOperation, reason: String) -> SyncOperation {
    operation.last_try = Some(Utc::now());
    operation.sync_stage = SyncStage::FailedToCheck;
    operation.last_error = Some(reason);
    operation
}

impl SyncChecker {
    pub fn new(ctx: &SyncContext) -> Arc<Self> {
        let index = ctx.index.clone();
        let logger = ctx.logger.clone();
        let worker: Worker<CheckTask> = Arc::new(move |task: CheckTask| {
            let index = index.clone();
            let logger = logger.clone();
            async move {
                let name = task.operation.photos_item.display_name();
                let fallback = task.operation.clone();
                let operation = match tokio::task::spawn_blocking(move || {
                    check_operation(&index, task.operation)
                })
                .await
                {
                    Ok(operation) => operation,
                    Err(e) => check_failed(fallback, format!("check task failed: {e}")),
                };
                if let Some(err) = &operation.last_error {
                    logger.error("check", &format!("{name}: {err}"));
                }
                (task.on_completed)(operation);
                TaskOutcome::Done
            }
            .boxed()
        });

        let checker = Arc::new(Self {
            queue: WorkQueue::paused(ctx.config.checker_concurrency(), worker),
            status: Mutex::new(CheckerStatus::Idle),
            started: AtomicBool::new(false),
            logger: ctx.logger.clone(),
            on_status: Mutex::new(None),
        });
        let weak: Weak<Self> = Arc::downgrade(&checker);
        checker.queue.on_drain(move || {
            if let Some(checker) = weak.upgrade() {
                checker.on_drain();
            }
        });
        checker
    }

    pub fn on_status_change(&self, f: impl Fn(CheckerStatus) + Send + Sync + 'static) {
        *self.on_status.lock() = Some(Arc::new(f));
    }

    pub fn status(&self) -> CheckerStatus {
        *self.status.lock()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn add_operation(
        &self,
        item: PhotosItem,
        priority: OperationPriority,
        on_completed: impl FnOnce(SyncOperation) + Send + 'static,
    ) {
        let task = CheckTask {
            operation: SyncOperation::new(item, priority),
            on_completed: Box::new(on_completed),
        };
        let reopened = {
            let mut current = self.status.lock();
            let reopened = (*current != CheckerStatus::Running
                && self.started.load(Ordering::SeqCst)
                && !self.queue.is_paused())
            .then(|| std::mem::replace(&mut *current, CheckerStatus::Running));
            match priority {
                OperationPriority::High => self.queue.push_middle(task),
                OperationPriority::Normal => self.queue.push(task),
            }
            reopened
        };
        if let Some(previous) = reopened {
            self.announce(previous, CheckerStatus::Running);
        }
    }

    pub fn run(&self) {
        self.started.store(true, Ordering::SeqCst);
        if self.queue.is_idle() {
            self.update_status(CheckerStatus::Completed);
        } else {
            self.update_status(CheckerStatus::Running);
        }
        self.queue.resume();
    }

    pub fn pause(&self) {
        self.queue.pause();
        self.update_status(CheckerStatus::Paused);
    }

    pub fn resume(&self) {
        if self.status() == CheckerStatus::Paused {
            self.run();
        }
    }

    pub fn destroy(&self) {
        self.queue.kill();
        self.queue.pause();
        self.started.store(false, Ordering::SeqCst);
        self.update_status(CheckerStatus::Idle);
    }

    pub fn has_finished(&self) -> bool {
        self.status() == CheckerStatus::Completed && self.queue.is_idle()
    }

    /// Completes only if nothing was queued since the drain was observed.
    fn on_drain(&self) {
        let previous = {
            let mut current = self.status.lock();
            if !self.started.load(Ordering::SeqCst)
                || self.queue.is_paused()
                || !self.queue.is_idle()
                || *current == CheckerStatus::Completed
            {
                return;
            }
            std::mem::replace(&mut *current, CheckerStatus::Completed)
        };
        self.announce(previous, CheckerStatus::Completed);
    }

    fn update_status(&self, status: CheckerStatus) {
        let previous = {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            std::mem::replace(&mut *current, status)
        };
        self.announce(previous, status);
    }

    fn announce(&self, previous: CheckerStatus, status: CheckerStatus) {
        self.logger
            .status_change(CHECKER, previous.as_str(), status.as_str());
        let hook = self.on_status.lock().clone();
        if let Some(hook) = hook {
            hook(status);
        }
    }
}
