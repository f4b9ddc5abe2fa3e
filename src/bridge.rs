//! Storage coordinator ("bridge") wire contract.

use crate::crypto::Progress;
use crate::error::SyncError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub bucket: String,
    pub size: u64,
    /// Hex-encoded 32-byte file index.
    pub index: String,
    #[serde(default)]
    pub mimetype: String,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub hash: String,
    pub url: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSlot {
    pub index: u32,
    pub uuid: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedShard {
    pub hash: String,
    pub uuid: String,
}

#[async_trait]
pub trait BridgeApi: Send + Sync {
    async fn file_info(&self, bucket: &str, file_id: &str) -> Result<FileInfo>;

    /// Mirror descriptors for a file (`limit=3&skip=0`).
    async fn file_mirrors(&self, bucket: &str, file_id: &str) -> Result<Vec<ShardDescriptor>>;

    async fn start_upload(&self, bucket: &str, size: u64) -> Result<UploadSlot>;

    async fn put_shard(&self, slot: &UploadSlot, src: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Stream a shard into `dest`, returning bytes written.
    async fn get_shard(
        &self,
        shard: &ShardDescriptor,
        dest: &Path,
        cancel: &CancellationToken,
        progress: Option<Arc<Progress>>,
    ) -> Result<u64>;

    /// Commit an uploaded shard; returns the new file id.
    async fn finish_upload(&self, bucket: &str, index_hex: &str, shard: FinishedShard) -> Result<String>;
}

pub struct HttpBridge {
    client: reqwest::Client,
    base_url: String,
    user: String,
    pass_hash: String,
}

impl HttpBridge {
    /// Basic auth uses the hex SHA-256 of the password.
    pub fn new(base_url: &str, user: &str, pass: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            pass_hash: hex::encode(Sha256::digest(pass.as_bytes())),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .basic_auth(&self.user, Some(&self.pass_hash))
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .basic_auth(&self.user, Some(&self.pass_hash))
    }
}

/// Turn a non-success response into `SyncError::Http`.
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SyncError::Http {
        status: status.as_u16(),
        body,
    }
    .into())
}

#[derive(Serialize)]
struct StartUploadBody {
    uploads: Vec<StartUploadEntry>,
}

#[derive(Serialize)]
struct StartUploadEntry {
    index: u32,
    size: u64,
}

#[derive(Deserialize)]
struct StartUploadResponse {
    uploads: Vec<UploadSlot>,
}

#[derive(Serialize)]
struct FinishUploadBody<'a> {
    index: &'a str,
    shards: Vec<FinishedShard>,
}

#[derive(Deserialize)]
struct FinishUploadResponse {
    id: String,
}

#[async_trait]
impl BridgeApi for HttpBridge {
    async fn file_info(&self, bucket: &str, file_id: &str) -> Result<FileInfo> {
        let url = self.url(&format!("/buckets/{bucket}/files/{file_id}/info"));
        let resp = check_status(self.get(&url).send().await?).await?;
        resp.json().await.context("decoding file info")
    }

    async fn file_mirrors(&self, bucket: &str, file_id: &str) -> Result<Vec<ShardDescriptor>> {
        let url = self.url(&format!("/buckets/{bucket}/files/{file_id}?limit=3&skip=0"));
        let resp = check_status(self.get(&url).send().await?).await?;
        resp.json().await.context("decoding mirrors")
    }

    async fn start_upload(&self, bucket: &str, size: u64) -> Result<UploadSlot> {
        let url = self.url(&format!("/v2/buckets/{bucket}/files/start?multiparts=1"));
        let body = StartUploadBody {
            uploads: vec![StartUploadEntry { index: 0, size }],
        };
        let resp = check_status(self.post(&url).json(&body).send().await?).await?;
        let parsed: StartUploadResponse = resp.json().await.context("decoding upload slot")?;
        parsed
            .uploads
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("bridge returned no upload slot"))
    }

    async fn put_shard(&self, slot: &UploadSlot, src: &Path, cancel: &CancellationToken) -> Result<()> {
        let file = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("opening {}", src.display()))?;
        let len = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));
        let send = self
            .client
            .put(&slot.url)
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send();
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Aborted.into()),
            r = send => r?,
        };
        check_status(resp).await?;
        Ok(())
    }

    async fn get_shard(
        &self,
        shard: &ShardDescriptor,
        dest: &Path,
        cancel: &CancellationToken,
        progress: Option<Arc<Progress>>,
    ) -> Result<u64> {
        let resp = check_status(self.client.get(&shard.url).send().await?).await?;
        let total = resp.content_length().or(shard.size).unwrap_or(0);
        let mut out = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(SyncError::Aborted.into());
            }
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(p) = &progress {
                p(written, total);
            }
        }
        out.flush().await?;
        Ok(written)
    }

    async fn finish_upload(&self, bucket: &str, index_hex: &str, shard: FinishedShard) -> Result<String> {
        let url = self.url(&format!("/v2/buckets/{bucket}/files/finish"));
        let body = FinishUploadBody {
            index: index_hex,
            shards: vec![shard],
        };
        let resp = check_status(self.post(&url).json(&body).send().await?).await?;
        let parsed: FinishUploadResponse = resp.json().await.context("decoding finished file")?;
        Ok(parsed.id)
    }
}
