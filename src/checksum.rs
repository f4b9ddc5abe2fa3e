//! Content hashes: file digests, the photo dedup hash and shard hashes.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, TimeZone, Utc};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// SHA-256 of a file, read in 64KB chunks.
pub fn sha256_file(path: &Path) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut file =
        File::open(path).with_context(|| format!("opening {} for hashing", path.display()))?;

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}

/// Millisecond-precision ISO-8601 in UTC, e.g. `2021-03-04T05:06:07.089Z`.
pub fn iso_millis(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

/// Dedup hash of a photo: sha256(userId ‖ name ‖ ISO(takenAt) ‖ hex(sha256(file))).
pub fn photo_hash(user_id: &str, name: &str, taken_at_ms: i64, file_hash_hex: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(iso_millis(taken_at_ms).as_bytes());
    hasher.update(file_hash_hex.as_bytes());
    hex::encode(hasher.finalize())
}

/// Streaming `ripemd160(sha256(data))`, the hash shards are addressed by.
#[derive(Default)]
pub struct ShardHasher {
    inner: Sha256,
}

impl ShardHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize_hex(self) -> String {
        let sha = self.inner.finalize();
        hex::encode(Ripemd160::digest(sha))
    }
}

pub fn shard_hash_file(path: &Path) -> Result<String> {
    let mut hasher = ShardHasher::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut file =
        File::open(path).with_context(|| format!("opening {} for hashing", path.display()))?;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize_hex())
}
