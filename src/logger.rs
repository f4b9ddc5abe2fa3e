use crate::error::SyncError;
use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SCANNER: &str = "SCANNER";
pub const CHECKER: &str = "CHECKER";
pub const UPLOADER: &str = "UPLOADER";
pub const REMOTE_PULL: &str = "REMOTE_PULL";
pub const SYNC: &str = "SYNC";

pub trait SyncLogger: Send + Sync {
    fn info(&self, _tag: &str, _msg: &str) {}
    fn status_change(&self, _tag: &str, _from: &str, _to: &str) {}
    fn upload_done(&self, _name: &str, _elapsed: Duration) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _synced: u64, _failed: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl SyncLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, tag: &str, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {} {}", Utc::now().to_rfc3339(), tag, s);
        }
    }
}

impl SyncLogger for TextLogger {
    fn info(&self, tag: &str, msg: &str) {
        self.line(tag, msg);
    }
    fn status_change(&self, tag: &str, from: &str, to: &str) {
        self.line(tag, &format!("STATUS {from} -> {to}"));
    }
    fn upload_done(&self, name: &str, elapsed: Duration) {
        self.line(
            UPLOADER,
            &format!("UPLOADED name={} seconds={:.3}", name, elapsed.as_secs_f64()),
        );
    }
    fn error(&self, context: &str, msg: &str) {
        self.line("ERROR", &format!("ctx={context} msg={msg}"));
    }
    fn done(&self, synced: u64, failed: u64, seconds: f64) {
        self.line(SYNC, &format!("DONE synced={synced} failed={failed} seconds={seconds:.3}"));
    }
}

/// Keeps lines in memory; handy for asserting on what a component logged.
#[derive(Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn push(&self, s: String) {
        if let Ok(mut l) = self.lines.lock() {
            l.push(s);
        }
    }
}

impl SyncLogger for MemoryLogger {
    fn info(&self, tag: &str, msg: &str) {
        self.push(format!("{tag} {msg}"));
    }
    fn status_change(&self, tag: &str, from: &str, to: &str) {
        self.push(format!("{tag} STATUS {from} -> {to}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.push(format!("ERROR {context} {msg}"));
    }
}

/// Error tracker seam.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, err: &anyhow::Error, step: &str);
}

pub struct LogErrorReporter {
    logger: Arc<dyn SyncLogger>,
}

impl LogErrorReporter {
    pub fn new(logger: Arc<dyn SyncLogger>) -> Self {
        Self { logger }
    }
}

impl ErrorReporter for LogErrorReporter {
    fn report(&self, err: &anyhow::Error, step: &str) {
        if SyncError::is_aborted(err) {
            return;
        }
        self.logger.error(step, &format!("{err:#}"));
    }
}
