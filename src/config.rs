use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_PULL_START: &str = "2000-01-01T00:00:00Z";

/// Tuning knobs and endpoints. Credentials are never stored here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub photos_per_group: usize,  // scanner page size
    pub checker_concurrency: usize, // clamped to 1..=3
    pub upload_concurrency: usize,
    pub max_upload_retries: u32,
    pub min_upload_task_ms: u64,
    pub remote_photos_per_page: usize,
    pub preview_concurrency: usize,
    pub max_preview_download_retries: u32,
    pub preview_width: u32,
    pub decrypt_chunk_size: usize,

    pub bridge_url: String,
    pub photos_api_url: String,
    pub data_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            photos_per_group: 50,
            checker_concurrency: 2,
            upload_concurrency: 1,
            max_upload_retries: 2,
            min_upload_task_ms: 1000,
            remote_photos_per_page: 50,
            preview_concurrency: 3,
            max_preview_download_retries: 2,
            preview_width: 512,
            decrypt_chunk_size: 2 * 1024 * 1024,
            bridge_url: "https://api.internxt.com".to_string(),
            photos_api_url: "https://photos.internxt.com/api".to_string(),
            data_dir: config_dir().join("data"),
        }
    }
}

impl SyncConfig {
    /// Missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => toml::from_str(&data)
                .with_context(|| format!("parsing config {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading config {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = toml::to_string(self)?;
        write_atomic(path, data.as_bytes())
    }

    pub fn checker_concurrency(&self) -> usize {
        self.checker_concurrency.clamp(1, 3)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("photos.sqlite")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("checkpoints.json")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Photosync");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("photosync");
    }
    PathBuf::from(".photosync")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("photosync.toml")
}

/// Write through a sibling temp file and rename over the target.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    use std::io::Write as _;
    tmp.write_all(data)?;
    tmp.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
    }
    tmp.persist(path)
        .with_context(|| format!("persisting {}", path.display()))?;
    Ok(())
}
