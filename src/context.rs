//! Everything a sync component needs, built once and shared by `Arc`.

use crate::bridge::HttpBridge;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::SyncConfig;
use crate::index::LocalSyncIndex;
use crate::logger::{ErrorReporter, LogErrorReporter, SyncLogger};
use crate::media::{MediaAssetResolver, MediaLibraryProvider, PhotosApi, PreviewGenerator};
use crate::model::PhotoPaths;
use crate::photos_api::HttpPhotosApi;
use crate::preview::ImagePreviewGenerator;
use crate::transfer::Transfer;
use anyhow::{anyhow, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct NetworkCredentials {
    pub bucket_id: String,
    pub encryption_key: String,
    pub user: String,
    pub pass: String,
}

impl std::fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("bucket_id", &self.bucket_id)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl NetworkCredentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bucket_id: env_var("PHOTOSYNC_BUCKET")?,
            encryption_key: env_var("PHOTOSYNC_ENCRYPTION_KEY")?,
            user: env_var("PHOTOSYNC_BRIDGE_USER")?,
            pass: env_var("PHOTOSYNC_BRIDGE_PASS")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncIdentity {
    pub user_id: String,
    pub device_id: String,
    pub api_token: String,
}

impl SyncIdentity {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            user_id: env_var("PHOTOSYNC_USER_ID")?,
            device_id: env_var("PHOTOSYNC_DEVICE_ID")?,
            api_token: env_var("PHOTOSYNC_TOKEN")?,
        })
    }
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow!("{name} is not set"))
}

pub struct SyncContext {
    pub user_id: String,
    pub device_id: String,
    pub bucket_id: String,
    pub config: SyncConfig,
    pub paths: PhotoPaths,
    pub index: Arc<LocalSyncIndex>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub library: Arc<dyn MediaLibraryProvider>,
    pub resolver: Arc<dyn MediaAssetResolver>,
    pub previews: Arc<dyn PreviewGenerator>,
    pub photos_api: Arc<dyn PhotosApi>,
    pub transfer: Arc<Transfer>,
    pub logger: Arc<dyn SyncLogger>,
    pub reporter: Arc<dyn ErrorReporter>,
}

impl SyncContext {
    /// Wire the HTTP clients and on-disk stores under `config.data_dir`.
    pub fn connect(
        config: SyncConfig,
        identity: SyncIdentity,
        credentials: NetworkCredentials,
        library: Arc<dyn MediaLibraryProvider>,
        resolver: Arc<dyn MediaAssetResolver>,
        logger: Arc<dyn SyncLogger>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let bridge = Arc::new(HttpBridge::new(
            &config.bridge_url,
            &credentials.user,
            &credentials.pass,
        )?);
        let transfer = Arc::new(Transfer::new(
            bridge,
            &credentials.encryption_key,
            config.tmp_dir(),
            config.decrypt_chunk_size,
            logger.clone(),
        ));
        let photos_api = Arc::new(HttpPhotosApi::new(&config.photos_api_url, &identity.api_token)?);
        Ok(Self {
            user_id: identity.user_id,
            device_id: identity.device_id,
            bucket_id: credentials.bucket_id,
            paths: PhotoPaths::under(&config.data_dir),
            index: Arc::new(LocalSyncIndex::open(&config.index_path())?),
            checkpoints: Arc::new(FileCheckpointStore::open(config.checkpoint_path())?),
            library,
            resolver,
            previews: Arc::new(ImagePreviewGenerator::default()),
            photos_api,
            transfer,
            reporter: Arc::new(LogErrorReporter::new(logger.clone())),
            logger,
            config,
        })
    }

    pub fn tmp_dir(&self) -> &std::path::Path {
        self.transfer.tmp_dir()
    }
}
