use thiserror::Error;

/// Failure kinds the sync pipeline applies policy to.
///
/// Everything is carried inside `anyhow::Error`; components downcast to
/// decide whether to retry, count, report or stay silent.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("media library enumeration failed: {0}")]
    Scan(String),

    #[error("sync stage check failed: {0}")]
    Check(String),

    #[error("upload of {name} failed after {attempts} attempts: {reason}")]
    Upload {
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error("shard hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("operation aborted")]
    Aborted,

    #[error("storage limit reached")]
    StorageLimitReached,

    #[error("file uses the legacy multi-mirror format ({mirrors} mirrors)")]
    LegacyFormat { mirrors: usize },

    #[error("no mirror available for file")]
    MissingMirror,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

impl SyncError {
    pub fn is_aborted(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Aborted))
    }

    pub fn is_storage_limit(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::StorageLimitReached)
        )
    }

    pub fn is_hash_mismatch(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::HashMismatch { .. })
        )
    }
}
