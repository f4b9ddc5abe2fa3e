//! Per-file key derivation and the AES-256-CTR stream cipher used for shards.

use crate::checksum::ShardHasher;
use crate::error::SyncError;
use aes::Aes256;
use anyhow::{anyhow, Context, Result};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use sha2::{Digest, Sha512};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const INDEX_LEN: usize = 32;

pub type Progress = dyn Fn(u64, u64) + Send + Sync;

/// 64-byte seed from a mnemonic (PBKDF2-HMAC-SHA512, 2048 rounds, salt "mnemonic").
pub fn mnemonic_seed(mnemonic: &str) -> [u8; 64] {
    let mut seed = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha512>(mnemonic.as_bytes(), b"mnemonic", 2048, &mut seed);
    seed
}

pub fn deterministic_key(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(key);
    hasher.update(data);
    hasher.finalize().into()
}

pub fn bucket_key(seed: &[u8; 64], bucket_id: &str) -> Result<[u8; 64]> {
    let bucket = hex::decode(bucket_id)
        .with_context(|| format!("bucket id {bucket_id} is not hex"))?;
    Ok(deterministic_key(seed, &bucket))
}

pub fn file_key(seed: &[u8; 64], bucket_id: &str, index: &[u8]) -> Result<[u8; 32]> {
    let bucket = bucket_key(seed, bucket_id)?;
    let full = deterministic_key(&bucket[..32], index);
    let mut key = [0u8; 32];
    key.copy_from_slice(&full[..32]);
    Ok(key)
}

pub fn file_iv(index: &[u8]) -> Result<[u8; 16]> {
    if index.len() < 16 {
        return Err(anyhow!("file index too short: {} bytes", index.len()));
    }
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&index[..16]);
    Ok(iv)
}

pub fn generate_index() -> [u8; INDEX_LEN] {
    let mut index = [0u8; INDEX_LEN];
    rand::thread_rng().fill_bytes(&mut index);
    index
}

pub struct EncryptedFile {
    pub size: u64,
    pub shard_hash: String,
}

/// Encrypt `src` into `dest`, hashing the ciphertext on the way.
pub async fn encrypt_file(
    src: &Path,
    dest: &Path,
    key: &[u8; 32],
    iv: &[u8; 16],
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<EncryptedFile> {
    let mut hasher = ShardHasher::new();
    let mut size = 0u64;
    let res = apply_cipher(src, dest, key, iv, chunk_size, cancel, |chunk, _, _| {
        hasher.update(chunk);
        size += chunk.len() as u64;
    })
    .await;
    match res {
        Ok(()) => Ok(EncryptedFile {
            size,
            shard_hash: hasher.finalize_hex(),
        }),
        Err(e) => {
            let _ = tokio::fs::remove_file(dest).await;
            Err(e)
        }
    }
}

/// Decrypt `src` into `dest` chunk by chunk, reporting `(done, total)`.
pub async fn decrypt_file(
    src: &Path,
    dest: &Path,
    key: &[u8; 32],
    iv: &[u8; 16],
    chunk_size: usize,
    cancel: &CancellationToken,
    progress: Option<&Progress>,
) -> Result<()> {
    let res = apply_cipher(src, dest, key, iv, chunk_size, cancel, |_, done, total| {
        if let Some(p) = progress {
            p(done, total);
        }
    })
    .await;
    if res.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    res
}

async fn apply_cipher<F>(
    src: &Path,
    dest: &Path,
    key: &[u8; 32],
    iv: &[u8; 16],
    chunk_size: usize,
    cancel: &CancellationToken,
    mut on_chunk: F,
) -> Result<()>
where
    F: FnMut(&[u8], u64, u64),
{
    let mut cipher = Aes256Ctr::new_from_slices(key, iv)
        .map_err(|e| anyhow!("invalid cipher parameters: {e}"))?;
    let mut input = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("opening {}", src.display()))?;
    let total = input.metadata().await?.len();
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut output = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut done = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Aborted.into());
        }
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &mut buf[..n];
        cipher.apply_keystream(chunk);
        output.write_all(chunk).await?;
        done += n as u64;
        on_chunk(chunk, done, total);
    }
    output.flush().await?;
    Ok(())
}
