//! Photosync Library
//!
//! Device-to-cloud photo synchronization: library scanning, dedup against a
//! local index, encrypted content-addressed uploads and remote pulls

pub mod bridge;
pub mod checker;
pub mod checkpoint;
pub mod checksum;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod fs_library;
pub mod index;
pub mod logger;
pub mod media;
pub mod model;
pub mod orchestrator;
pub mod photos_api;
pub mod preview;
pub mod progress;
pub mod queue;
pub mod remote_pull;
pub mod scanner;
pub mod transfer;
pub mod uploader;

pub use error::SyncError;
pub use orchestrator::{SyncCounters, SyncManager, SyncManagerStatus};
