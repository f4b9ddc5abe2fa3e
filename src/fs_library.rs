use crate::media::{AssetPage, MediaAssetResolver, MediaLibraryProvider, ResolvedAsset};
use crate::model::{DeviceAsset, MediaKind, PhotosItem};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
// Directory-backed media library for desktop use and tests

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "heic", "heif", "gif", "webp", "tif", "tiff", "bmp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v"];

/// Which files count as library assets
#[derive(Debug, Clone, Default)]
pub struct LibraryFilter {
    pub exclude_dirs: Vec<String>,
    pub include_videos: bool,
}

impl LibraryFilter {
    fn media_kind(&self, path: &Path) -> Option<MediaKind> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Photo)
        } else if self.include_videos && VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    fn should_include_dir(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return true;
        };
        !self.exclude_dirs.iter().any(|p| glob_match(p, name))
    }
}

/// Simple glob matching (supports * wildcards)
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.contains('*') {
        if pattern.starts_with('*') && pattern.ends_with('*') {
            return text.contains(&pattern[1..pattern.len() - 1]);
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            return text.ends_with(suffix);
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            return text.starts_with(prefix);
        }
    }
    pattern == text
}

fn millis(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Walk `root` and describe every media file, oldest first.
pub fn enumerate_assets(root: &Path, filter: &LibraryFilter) -> Result<Vec<DeviceAsset>> {
    use walkdir::WalkDir;

    let mut assets = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_type().is_dir() || filter.should_include_dir(e.path()))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(kind) = filter.media_kind(path) else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let modified = metadata.modified().map(millis).unwrap_or(0);
        let created = metadata.created().map(millis).unwrap_or(modified);
        let (width, height) = match kind {
            MediaKind::Photo => image::image_dimensions(path).unwrap_or((0, 0)),
            MediaKind::Video => (0, 0),
        };
        let rel = path.strip_prefix(root).unwrap_or(path);
        assets.push(DeviceAsset {
            id: rel.to_string_lossy().into_owned(),
            uri: format!("file://{}", path.display()),
            filename: entry.file_name().to_string_lossy().into_owned(),
            width,
            height,
            creation_time: created,
            modification_time: modified,
            media_kind: kind,
        });
    }
    assets.sort_by(|a, b| a.creation_time.cmp(&b.creation_time).then_with(|| a.id.cmp(&b.id)));
    Ok(assets)
}

/// A directory tree exposed as a paged media library. The tree is walked
/// once and paged from that snapshot so cursors stay stable.
pub struct DirectoryLibrary {
    root: PathBuf,
    filter: LibraryFilter,
    snapshot: Mutex<Option<Arc<Vec<DeviceAsset>>>>,
}

impl DirectoryLibrary {
    pub fn new(root: PathBuf, filter: LibraryFilter) -> Self {
        Self {
            root,
            filter,
            snapshot: Mutex::new(None),
        }
    }

    /// Forget the snapshot; the next page request walks the tree again.
    pub fn refresh(&self) {
        *self.snapshot.lock() = None;
    }

    async fn assets(&self) -> Result<Arc<Vec<DeviceAsset>>> {
        let cached = self.snapshot.lock().clone();
        if let Some(s) = cached {
            return Ok(s);
        }
        let root = self.root.clone();
        let filter = self.filter.clone();
        let assets = tokio::task::spawn_blocking(move || enumerate_assets(&root, &filter))
            .await
            .context("library walk panicked")??;
        let assets = Arc::new(assets);
        *self.snapshot.lock() = Some(assets.clone());
        Ok(assets)
    }
}

#[async_trait]
impl MediaLibraryProvider for DirectoryLibrary {
    async fn list_assets(&self, cursor: Option<&str>, page_size: usize) -> Result<AssetPage> {
        if !self.root.is_dir() {
            return Err(anyhow!("library root {} is not a directory", self.root.display()));
        }
        let offset: usize = match cursor {
            Some(c) => c.parse().with_context(|| format!("bad cursor {c}"))?,
            None => 0,
        };
        let assets = self.assets().await?;
        let end = (offset + page_size.max(1)).min(assets.len());
        let page = assets.get(offset..end).map(|s| s.to_vec()).unwrap_or_default();
        let has_next_page = end < assets.len();
        Ok(AssetPage {
            assets: page,
            next_cursor: has_next_page.then(|| end.to_string()),
            has_next_page,
            total_count: assets.len() as u64,
        })
    }
}

/// `file://` URIs already name real files.
pub struct FileUriResolver;

#[async_trait]
impl MediaAssetResolver for FileUriResolver {
    async fn resolve(&self, item: &PhotosItem, _tmp_dir: &Path) -> Result<ResolvedAsset> {
        let uri = item
            .local_uri
            .as_deref()
            .ok_or_else(|| anyhow!("{} has no local uri", item.display_name()))?;
        let path = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        if !path.is_file() {
            return Err(anyhow!("{} does not exist", path.display()));
        }
        Ok(ResolvedAsset {
            path,
            temporary: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"not really an image").unwrap();
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*", "x"));
        assert!(glob_match(".thumb*", ".thumbnails"));
        assert!(glob_match("*cache", "imgcache"));
        assert!(glob_match("*tmp*", "a_tmp_b"));
        assert!(!glob_match("trash", "Trash"));
    }

    #[tokio::test]
    async fn pages_through_media_files_only() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            touch(&dir.path().join(format!("DCIM/IMG_{i}.JPG")));
        }
        touch(&dir.path().join("DCIM/notes.txt"));
        touch(&dir.path().join("DCIM/clip.mp4"));
        touch(&dir.path().join(".thumbnails/IMG_9.jpg"));

        let library = DirectoryLibrary::new(
            dir.path().to_path_buf(),
            LibraryFilter {
                exclude_dirs: vec![".thumb*".into()],
                include_videos: false,
            },
        );

        let first = library.list_assets(None, 2).await.unwrap();
        assert_eq!(first.total_count, 5);
        assert_eq!(first.assets.len(), 2);
        assert!(first.has_next_page);

        let mut seen: Vec<String> = first.assets.iter().map(|a| a.filename.clone()).collect();
        let mut cursor = first.next_cursor;
        while let Some(c) = cursor {
            let page = library.list_assets(Some(&c), 2).await.unwrap();
            seen.extend(page.assets.iter().map(|a| a.filename.clone()));
            cursor = page.next_cursor;
        }
        seen.sort();
        assert_eq!(seen, ["IMG_0.JPG", "IMG_1.JPG", "IMG_2.JPG", "IMG_3.JPG", "IMG_4.JPG"]);
    }

    #[tokio::test]
    async fn file_uri_resolves_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        touch(&path);
        let assets = enumerate_assets(dir.path(), &LibraryFilter::default()).unwrap();
        let item = PhotosItem::from_device_asset(&assets[0]);
        let resolved = FileUriResolver.resolve(&item, dir.path()).await.unwrap();
        assert_eq!(resolved.path, path);
        assert!(!resolved.temporary);
    }
}
