//! Data model shared by every stage of the sync pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

/// A photo as reported by the device media library. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAsset {
    pub id: String,
    pub uri: String,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    /// Milliseconds since the Unix epoch.
    pub creation_time: i64,
    pub modification_time: i64,
    pub media_kind: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhotoSyncStatus {
    InDeviceOnly,
    InSyncOnly,
    DeviceAndInSync,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemotePhotoStatus {
    Exists,
    Trashed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoPreview {
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub file_id: String,
    #[serde(rename = "type")]
    pub format: String,
}

/// Server-side photo record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePhoto {
    pub id: String,
    pub file_id: String,
    pub preview_id: String,
    #[serde(default)]
    pub previews: Vec<PhotoPreview>,
    pub name: String,
    #[serde(rename = "type")]
    pub format: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub hash: String,
    pub status: RemotePhotoStatus,
    pub taken_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub device_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_bucket_id: Option<String>,
    #[serde(default = "default_item_type")]
    pub item_type: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

fn default_item_type() -> MediaKind {
    MediaKind::Photo
}

impl RemotePhoto {
    pub fn taken_at_ms(&self) -> i64 {
        self.taken_at.timestamp_millis()
    }

    /// Preview file id, preferring the first preview variant.
    pub fn preview_file_id(&self) -> &str {
        self.previews
            .first()
            .map(|p| p.file_id.as_str())
            .unwrap_or(self.preview_id.as_str())
    }
}

/// Where full-size files and previews are materialized locally.
#[derive(Debug, Clone)]
pub struct PhotoPaths {
    pub full_size_dir: PathBuf,
    pub previews_dir: PathBuf,
}

impl PhotoPaths {
    pub fn under(root: &Path) -> Self {
        Self {
            full_size_dir: root.join("full_size"),
            previews_dir: root.join("previews"),
        }
    }

    pub fn full_size_path(&self, name: &str, format: &str) -> PathBuf {
        self.full_size_dir.join(format!("{name}.{format}"))
    }

    pub fn preview_path(&self, name: &str, format: &str) -> PathBuf {
        self.previews_dir.join(format!("{name}.{format}"))
    }
}

/// Canonical sync unit, built from a device asset or a remote photo.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotosItem {
    pub name: String,
    pub format: String,
    pub kind: MediaKind,
    pub taken_at: i64,
    pub updated_at: i64,
    pub width: u32,
    pub height: u32,
    pub local_uri: Option<String>,
    pub local_full_size_path: Option<PathBuf>,
    pub local_preview_path: Option<PathBuf>,
    pub status: PhotoSyncStatus,
    pub photo_id: Option<String>,
    pub photo_file_id: Option<String>,
    pub preview_file_id: Option<String>,
    pub bucket_id: Option<String>,
}

impl PhotosItem {
    pub fn from_device_asset(asset: &DeviceAsset) -> Self {
        Self {
            name: photo_name(&asset.filename).to_string(),
            format: photo_format(&asset.filename),
            kind: asset.media_kind,
            taken_at: asset.creation_time,
            updated_at: asset.modification_time,
            width: asset.width,
            height: asset.height,
            local_uri: Some(asset.uri.clone()),
            local_full_size_path: None,
            local_preview_path: None,
            status: PhotoSyncStatus::InDeviceOnly,
            photo_id: None,
            photo_file_id: None,
            preview_file_id: None,
            bucket_id: None,
        }
    }

    pub fn from_remote(photo: &RemotePhoto, paths: &PhotoPaths) -> Self {
        let status = if photo.status == RemotePhotoStatus::Exists {
            PhotoSyncStatus::InSyncOnly
        } else {
            PhotoSyncStatus::Deleted
        };
        Self {
            name: photo.name.clone(),
            format: photo.format.clone(),
            kind: photo.item_type,
            taken_at: photo.taken_at_ms(),
            updated_at: photo.updated_at.timestamp_millis(),
            width: photo.width,
            height: photo.height,
            local_uri: None,
            local_full_size_path: Some(paths.full_size_path(&photo.name, &photo.format)),
            local_preview_path: Some(paths.preview_path(&photo.name, &photo.format)),
            status,
            photo_id: Some(photo.id.clone()),
            photo_file_id: Some(photo.file_id.clone()),
            preview_file_id: Some(photo.preview_file_id().to_string()),
            bucket_id: photo.network_bucket_id.clone(),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{}.{}", self.name, self.format)
    }

    pub fn key(&self) -> String {
        format!("{}-{}", self.name, self.taken_at)
    }
}

/// Filename without its last extension.
pub fn photo_name(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => &filename[..idx],
        _ => filename,
    }
}

/// Lowercase extension, or `unknown`.
pub fn photo_format(filename: &str) -> String {
    match filename.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < filename.len() => filename[idx + 1..].to_lowercase(),
        _ => "unknown".to_string(),
    }
}

/// Merge device and remote views keyed by `name-takenAt`.
///
/// DELETED collapses the pair and is dropped. A device-only item paired with
/// a sync-only item becomes DEVICE_AND_IN_SYNC. Output is newest first.
pub fn merge_photos_items(items: impl IntoIterator<Item = PhotosItem>) -> Vec<PhotosItem> {
    let mut merged: HashMap<String, PhotosItem> = HashMap::new();
    let mut deleted: std::collections::HashSet<String> = std::collections::HashSet::new();

    for item in items {
        let key = item.key();
        if deleted.contains(&key) {
            continue;
        }
        if item.status == PhotoSyncStatus::Deleted {
            merged.remove(&key);
            deleted.insert(key);
            continue;
        }
        match merged.remove(&key) {
            None => {
                merged.insert(key, item);
            }
            Some(existing) => {
                merged.insert(key, combine(existing, item));
            }
        }
    }

    let mut out: Vec<PhotosItem> = merged.into_values().collect();
    out.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
    out
}

fn combine(a: PhotosItem, b: PhotosItem) -> PhotosItem {
    use PhotoSyncStatus::*;
    let (device, remote) = match (a.status, b.status) {
        (InDeviceOnly, InSyncOnly) => (a, b),
        (InSyncOnly, InDeviceOnly) => (b, a),
        // Same side twice or already merged: the newer record wins.
        _ => return if b.updated_at >= a.updated_at { b } else { a },
    };
    PhotosItem {
        local_uri: device.local_uri,
        status: DeviceAndInSync,
        ..remote
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStage {
    Unknown,
    NeedsRemoteCheck,
    InSync,
    FailedToCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationPriority {
    #[default]
    Normal,
    High,
}

/// Unit of work resolved by the checker.
#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub photos_item: PhotosItem,
    pub priority: OperationPriority,
    pub sync_stage: SyncStage,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_try: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub synced_photo: Option<RemotePhoto>,
}

impl SyncOperation {
    pub fn new(photos_item: PhotosItem, priority: OperationPriority) -> Self {
        Self {
            photos_item,
            priority,
            sync_stage: SyncStage::Unknown,
            retries: 0,
            created_at: Utc::now(),
            last_try: None,
            last_error: None,
            synced_photo: None,
        }
    }
}
