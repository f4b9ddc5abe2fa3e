//! Device Library Scanner: pages through the media library and emits
//! groups of `PhotosItem`s.

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::logger::{ErrorReporter, SyncLogger, SCANNER};
use crate::media::{MediaAssetResolver, MediaLibraryProvider};
use crate::model::PhotosItem;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerStatus {
    Idle,
    Running,
    Paused,
    Completed,
    NoPhotosInDevice,
}

impl ScannerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::NoPhotosInDevice => "NO_PHOTOS_IN_DEVICE",
        }
    }
}

/// Answers whether the device already holds a photo.
pub trait DevicePresence: Send + Sync {
    fn has_photo_in_device(&self, name: &str, taken_at: i64) -> bool;
}

type GroupHook = Arc<dyn Fn(Vec<PhotosItem>) + Send + Sync>;
type TotalHook = Arc<dyn Fn(u64) + Send + Sync>;
type StatusHook = Arc<dyn Fn(ScannerStatus) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    group_ready: Option<GroupHook>,
    total: Option<TotalHook>,
    status: Option<StatusHook>,
    error: Option<ErrorHook>,
}

struct ScanState {
    status: ScannerStatus,
    cursor: Option<String>,
    /// Bumped on every run/destroy so a stale pagination loop stops itself.
    epoch: u64,
    pages_emitted: u64,
}

pub struct DeviceScanner {
    library: Arc<dyn MediaLibraryProvider>,
    resolver: Arc<dyn MediaAssetResolver>,
    page_size: usize,
    logger: Arc<dyn SyncLogger>,
    reporter: Arc<dyn ErrorReporter>,
    state: Mutex<ScanState>,
    /// Filenames of every emitted asset, by creation time.
    seen: Mutex<HashMap<i64, Vec<String>>>,
    hooks: Mutex<Hooks>,
}

impl DeviceScanner {
    pub fn new(ctx: &SyncContext) -> Arc<Self> {
        Arc::new(Self {
            library: ctx.library.clone(),
            resolver: ctx.resolver.clone(),
            page_size: ctx.config.photos_per_group.max(1),
            logger: ctx.logger.clone(),
            reporter: ctx.reporter.clone(),
            state: Mutex::new(ScanState {
                status: ScannerStatus::Idle,
                cursor: None,
                epoch: 0,
                pages_emitted: 0,
            }),
            seen: Mutex::new(HashMap::new()),
            hooks: Mutex::new(Hooks::default()),
        })
    }

    pub fn on_group_of_photos_ready(&self, f: impl Fn(Vec<PhotosItem>) + Send + Sync + 'static) {
        self.hooks.lock().group_ready = Some(Arc::new(f));
    }

    pub fn on_total_photos_calculated(&self, f: impl Fn(u64) + Send + Sync + 'static) {
        self.hooks.lock().total = Some(Arc::new(f));
    }

    pub fn on_status_change(&self, f: impl Fn(ScannerStatus) + Send + Sync + 'static) {
        self.hooks.lock().status = Some(Arc::new(f));
    }

    pub fn on_error(&self, f: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
        self.hooks.lock().error = Some(Arc::new(f));
    }

    pub fn status(&self) -> ScannerStatus {
        self.state.lock().status
    }

    pub fn has_finished(&self) -> bool {
        matches!(
            self.status(),
            ScannerStatus::Completed | ScannerStatus::NoPhotosInDevice
        )
    }

    pub fn pages_emitted(&self) -> u64 {
        self.state.lock().pages_emitted
    }

    /// Start, or continue from the saved cursor after a pause.
    pub fn run(self: &Arc<Self>) {
        let epoch = {
            let mut st = self.state.lock();
            match st.status {
                ScannerStatus::Running => return,
                ScannerStatus::Completed | ScannerStatus::NoPhotosInDevice => {
                    st.cursor = None;
                    st.pages_emitted = 0;
                }
                ScannerStatus::Idle | ScannerStatus::Paused => {}
            }
            st.epoch += 1;
            st.epoch
        };
        self.update_status(ScannerStatus::Running);
        let this = self.clone();
        tokio::spawn(async move { this.scan(epoch).await });
    }

    /// Stops after the page in flight; the cursor is kept.
    pub fn pause(&self) {
        if self.status() == ScannerStatus::Running {
            self.update_status(ScannerStatus::Paused);
        }
    }

    pub fn resume(self: &Arc<Self>) {
        if self.status() == ScannerStatus::Paused {
            self.run();
        }
    }

    pub fn destroy(&self) {
        {
            let mut st = self.state.lock();
            st.epoch += 1;
            st.cursor = None;
            st.pages_emitted = 0;
        }
        self.seen.lock().clear();
        self.update_status(ScannerStatus::Idle);
    }

    pub fn restart(self: &Arc<Self>) {
        self.destroy();
        self.run();
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().epoch == epoch
    }

    async fn scan(&self, epoch: u64) {
        loop {
            let cursor = {
                let st = self.state.lock();
                if st.epoch != epoch || st.status != ScannerStatus::Running {
                    return;
                }
                st.cursor.clone()
            };
            let first_page = cursor.is_none();

            let page = match self.library.list_assets(cursor.as_deref(), self.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    if self.is_current(epoch) {
                        self.fail(SyncError::Scan(format!("{e:#}")).into());
                    }
                    return;
                }
            };
            if !self.is_current(epoch) {
                return;
            }

            if first_page {
                let hook = self.hooks.lock().total.clone();
                if let Some(hook) = hook {
                    hook(page.total_count);
                }
                if page.assets.is_empty() && !page.has_next_page {
                    self.update_status(ScannerStatus::NoPhotosInDevice);
                    return;
                }
            }

            let items: Vec<PhotosItem> = page
                .assets
                .iter()
                .map(|asset| {
                    let mut item = PhotosItem::from_device_asset(asset);
                    item.local_uri = Some(self.resolver.normalize_uri(asset));
                    item
                })
                .collect();
            {
                let mut seen = self.seen.lock();
                for asset in &page.assets {
                    seen.entry(asset.creation_time)
                        .or_default()
                        .push(asset.filename.clone());
                }
            }
            let pages = {
                let mut st = self.state.lock();
                st.cursor = page.next_cursor.clone();
                st.pages_emitted += 1;
                st.pages_emitted
            };
            self.logger
                .info(SCANNER, &format!("PAGE {} items={}", pages, items.len()));

            if !items.is_empty() {
                let hook = self.hooks.lock().group_ready.clone();
                if let Some(hook) = hook {
                    hook(items);
                }
            }

            if !page.has_next_page || page.next_cursor.is_none() {
                if self.is_current(epoch) {
                    self.update_status(ScannerStatus::Completed);
                }
                return;
            }
        }
    }

    /// Goes idle before notifying, so a listener may run the scanner again.
    fn fail(&self, err: anyhow::Error) {
        self.update_status(ScannerStatus::Idle);
        self.reporter.report(&err, "scan");
        let hook = self.hooks.lock().error.clone();
        if let Some(hook) = hook {
            hook(&err);
        }
    }

    fn update_status(&self, status: ScannerStatus) {
        let previous = {
            let mut st = self.state.lock();
            if st.status == status {
                return;
            }
            std::mem::replace(&mut st.status, status)
        };
        self.logger
            .status_change(SCANNER, previous.as_str(), status.as_str());
        let hook = self.hooks.lock().status.clone();
        if let Some(hook) = hook {
            hook(status);
        }
    }
}

impl DevicePresence for DeviceScanner {
    /// Matches when the filename up to its first dot starts with `name`.
    fn has_photo_in_device(&self, name: &str, taken_at: i64) -> bool {
        self.seen
            .lock()
            .get(&taken_at)
            .is_some_and(|filenames| filenames.iter().any(|f| filename_stem(f).starts_with(name)))
    }
}

fn filename_stem(filename: &str) -> &str {
    filename.split('.').next().unwrap_or(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_stops_at_first_dot() {
        assert_eq!(filename_stem("IMG_0000.MOV.jpg"), "IMG_0000");
        assert_eq!(filename_stem("IMG_0001.jpg"), "IMG_0001");
        assert_eq!(filename_stem("README"), "README");
        assert_eq!(filename_stem(".hidden"), "");
    }
}
