//! Contracts for the collaborators the pipeline consumes.

use crate::model::{DeviceAsset, MediaKind, PhotoPreview, PhotosItem, RemotePhoto};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct AssetPage {
    pub assets: Vec<DeviceAsset>,
    pub next_cursor: Option<String>,
    pub has_next_page: bool,
    pub total_count: u64,
}

#[async_trait]
pub trait MediaLibraryProvider: Send + Sync {
    async fn list_assets(&self, cursor: Option<&str>, page_size: usize) -> Result<AssetPage>;
}

pub struct ResolvedAsset {
    pub path: PathBuf,
    /// The path is a copy owned by the caller and must be removed after use.
    pub temporary: bool,
}

/// Maps platform URIs to stable ones and real files.
#[async_trait]
pub trait MediaAssetResolver: Send + Sync {
    fn normalize_uri(&self, asset: &DeviceAsset) -> String {
        asset.uri.clone()
    }

    async fn resolve(&self, item: &PhotosItem, tmp_dir: &Path) -> Result<ResolvedAsset>;
}

/// Copies an asset out of a platform store into a plain file.
#[async_trait]
pub trait AssetExporter: Send + Sync {
    async fn export(&self, uri: &str, dest: &Path) -> Result<()>;
}

/// iOS photo library: `ph://ID` becomes
/// `assets-library://asset/asset.EXT?id=ID&ext=EXT` and files are exported
/// into the temp directory before upload.
pub struct IosAssetResolver {
    exporter: Arc<dyn AssetExporter>,
}

impl IosAssetResolver {
    pub fn new(exporter: Arc<dyn AssetExporter>) -> Self {
        Self { exporter }
    }
}

pub fn ios_assets_library_uri(uri: &str, filename: &str) -> String {
    let Some(id) = uri.strip_prefix("ph://") else {
        return uri.to_string();
    };
    let id = id.split('/').next().unwrap_or(id);
    let ext = crate::model::photo_format(filename).to_uppercase();
    format!("assets-library://asset/asset.{ext}?id={id}&ext={ext}")
}

#[async_trait]
impl MediaAssetResolver for IosAssetResolver {
    fn normalize_uri(&self, asset: &DeviceAsset) -> String {
        ios_assets_library_uri(&asset.uri, &asset.filename)
    }

    async fn resolve(&self, item: &PhotosItem, tmp_dir: &Path) -> Result<ResolvedAsset> {
        let uri = item
            .local_uri
            .as_deref()
            .ok_or_else(|| anyhow!("{} has no local uri", item.display_name()))?;
        tokio::fs::create_dir_all(tmp_dir).await?;
        let dest = tmp_dir.join(format!(
            "{}-{}.{}",
            item.name,
            uuid::Uuid::new_v4().simple(),
            item.format
        ));
        self.exporter.export(uri, &dest).await?;
        Ok(ResolvedAsset {
            path: dest,
            temporary: true,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedPreview {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub format: String,
}

#[async_trait]
pub trait PreviewGenerator: Send + Sync {
    async fn generate(
        &self,
        source: &Path,
        target_width: u32,
        target_height: u32,
        dest: &Path,
    ) -> Result<GeneratedPreview>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePhotoRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub format: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub file_id: String,
    pub preview_id: String,
    pub previews: Vec<PhotoPreview>,
    pub device_id: String,
    pub user_id: String,
    pub hash: String,
    pub taken_at: DateTime<Utc>,
    pub network_bucket_id: String,
    pub item_type: MediaKind,
}

/// Photos metadata API.
#[async_trait]
pub trait PhotosApi: Send + Sync {
    /// Idempotent on `(userId, hash)`.
    async fn find_or_create_photo(&self, request: &CreatePhotoRequest) -> Result<RemotePhoto>;

    /// Photos ordered by `(updatedAt, id)`. Without `after_id` the page starts
    /// at `since` inclusive; with it, strictly after the `(since, after_id)` key.
    async fn list_updated_since(
        &self,
        since: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RemotePhoto>>;

    async fn get_photo(&self, photo_id: &str) -> Result<RemotePhoto>;

    async fn update_previews(&self, photo_id: &str, previews: &[PhotoPreview]) -> Result<RemotePhoto>;

    async fn delete_photo(&self, photo_id: &str) -> Result<()>;
}
