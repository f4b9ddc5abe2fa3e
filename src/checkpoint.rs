//! Persisted resume points for pulls and uploads.

use crate::config::write_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub trait CheckpointStore: Send + Sync {
    fn last_pulled_date(&self) -> Result<Option<DateTime<Utc>>>;
    fn save_last_pulled_date(&self, date: DateTime<Utc>) -> Result<()>;
    fn last_uploaded_page(&self) -> Result<Option<u64>>;
    fn save_last_uploaded_page(&self, page: u64) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Checkpoints {
    #[serde(default)]
    last_pulled_date: Option<DateTime<Utc>>,
    #[serde(default)]
    last_uploaded_page: Option<u64>,
}

/// JSON file, rewritten atomically on every save.
pub struct FileCheckpointStore {
    path: PathBuf,
    state: Mutex<Checkpoints>,
}

impl FileCheckpointStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("parsing checkpoints {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Checkpoints::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading checkpoints {}", path.display()))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn update(&self, f: impl FnOnce(&mut Checkpoints)) -> Result<()> {
        let mut state = self.state.lock();
        f(&mut state);
        let data = serde_json::to_vec_pretty(&*state)?;
        write_atomic(&self.path, &data)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn last_pulled_date(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().last_pulled_date)
    }

    fn save_last_pulled_date(&self, date: DateTime<Utc>) -> Result<()> {
        self.update(|s| s.last_pulled_date = Some(date))
    }

    fn last_uploaded_page(&self) -> Result<Option<u64>> {
        Ok(self.state.lock().last_uploaded_page)
    }

    fn save_last_uploaded_page(&self, page: u64) -> Result<()> {
        self.update(|s| s.last_uploaded_page = Some(page))
    }

    fn clear(&self) -> Result<()> {
        self.update(|s| *s = Checkpoints::default())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<Checkpoints>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn last_pulled_date(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().last_pulled_date)
    }

    fn save_last_pulled_date(&self, date: DateTime<Utc>) -> Result<()> {
        self.state.lock().last_pulled_date = Some(date);
        Ok(())
    }

    fn last_uploaded_page(&self) -> Result<Option<u64>> {
        Ok(self.state.lock().last_uploaded_page)
    }

    fn save_last_uploaded_page(&self, page: u64) -> Result<()> {
        self.state.lock().last_uploaded_page = Some(page);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.state.lock() = Checkpoints::default();
        Ok(())
    }
}
