//! Encrypted upload and verified download of single-shard files.

use crate::bridge::{BridgeApi, FinishedShard, ShardDescriptor};
use crate::checksum::shard_hash_file;
use crate::crypto::{self, Progress};
use crate::error::SyncError;
use crate::logger::SyncLogger;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Removes its file when dropped, so every exit path cleans up,
/// including a task being aborted mid-await.
pub(crate) struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Transfer {
    bridge: Arc<dyn BridgeApi>,
    seed: [u8; 64],
    tmp_dir: PathBuf,
    chunk_size: usize,
    logger: Arc<dyn SyncLogger>,
}

impl Transfer {
    pub fn new(
        bridge: Arc<dyn BridgeApi>,
        mnemonic: &str,
        tmp_dir: PathBuf,
        chunk_size: usize,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            bridge,
            seed: crypto::mnemonic_seed(mnemonic),
            tmp_dir,
            chunk_size,
            logger,
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    fn temp_path(&self, stem: &str) -> PathBuf {
        self.tmp_dir
            .join(format!("{}-{}.enc", stem, uuid::Uuid::new_v4().simple()))
    }

    /// Encrypt `path` with a fresh file index and store it in `bucket`.
    pub async fn upload_file(
        &self,
        bucket: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(SyncError::Aborted.into());
        }
        tokio::fs::create_dir_all(&self.tmp_dir).await?;

        let index = crypto::generate_index();
        let key = crypto::file_key(&self.seed, bucket, &index)?;
        let iv = crypto::file_iv(&index)?;
        let index_hex = hex::encode(index);

        let encrypted_path = TempFile::new(self.temp_path(&index_hex[..16]));
        let encrypted = crypto::encrypt_file(
            path,
            encrypted_path.path(),
            &key,
            &iv,
            self.chunk_size,
            cancel,
        )
        .await
        .with_context(|| format!("encrypting {}", path.display()))?;

        let slot = self.bridge.start_upload(bucket, encrypted.size).await?;
        self.bridge
            .put_shard(&slot, encrypted_path.path(), cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Aborted.into());
        }
        let file_id = self
            .bridge
            .finish_upload(
                bucket,
                &index_hex,
                FinishedShard {
                    hash: encrypted.shard_hash,
                    uuid: slot.uuid,
                },
            )
            .await?;
        self.logger.info(
            "TRANSFER",
            &format!("UPLOAD file={} bytes={} id={}", path.display(), encrypted.size, file_id),
        );
        Ok(file_id)
    }

    /// Download, verify and decrypt `file_id` into `dest`.
    ///
    /// `dest` only appears once the ciphertext has been verified and fully
    /// decrypted; the ciphertext temp file never outlives this call.
    pub async fn download_file(
        &self,
        bucket: &str,
        file_id: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: Option<Arc<Progress>>,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SyncError::Aborted.into());
        }
        let info = self.bridge.file_info(bucket, file_id).await?;
        let shard = single_mirror(self.bridge.file_mirrors(bucket, file_id).await?)?;

        tokio::fs::create_dir_all(&self.tmp_dir).await?;
        let encrypted_path = TempFile::new(self.temp_path(&shard.hash));
        self.bridge
            .get_shard(&shard, encrypted_path.path(), cancel, None)
            .await
            .with_context(|| format!("downloading shard of {file_id}"))?;
        if cancel.is_cancelled() {
            return Err(SyncError::Aborted.into());
        }

        let shard_path = encrypted_path.path().to_path_buf();
        let actual = tokio::task::spawn_blocking(move || shard_hash_file(&shard_path))
            .await
            .context("shard hash task failed")??;
        if actual != shard.hash {
            let err = SyncError::HashMismatch {
                expected: shard.hash.clone(),
                actual,
            };
            self.logger.error("download", &format!("file={file_id} {err}"));
            return Err(err.into());
        }

        let index = hex::decode(&info.index).context("file index is not hex")?;
        let key = crypto::file_key(&self.seed, bucket, &index)?;
        let iv = crypto::file_iv(&index)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = TempFile::new(partial_path(dest));
        crypto::decrypt_file(
            encrypted_path.path(),
            partial.path(),
            &key,
            &iv,
            self.chunk_size,
            cancel,
            progress.as_deref(),
        )
        .await?;
        tokio::fs::rename(partial.path(), dest)
            .await
            .with_context(|| format!("moving decrypted file to {}", dest.display()))?;
        Ok(())
    }
}

fn single_mirror(mut mirrors: Vec<ShardDescriptor>) -> Result<ShardDescriptor> {
    match mirrors.len() {
        0 => Err(SyncError::MissingMirror.into()),
        1 => Ok(mirrors.remove(0)),
        n => Err(SyncError::LegacyFormat { mirrors: n }.into()),
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
