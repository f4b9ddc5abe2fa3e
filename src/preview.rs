//! Preview generation and the aspect-ratio repair applied during pulls.

use crate::context::SyncContext;
use crate::media::{GeneratedPreview, PreviewGenerator};
use crate::model::{PhotoPreview, RemotePhoto};
use crate::transfer::TempFile;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Aspect ratios closer than this are considered equal.
const ASPECT_TOLERANCE: f64 = 0.02;

/// JPEG previews through the `image` crate.
pub struct ImagePreviewGenerator {
    pub quality: u8,
}

impl Default for ImagePreviewGenerator {
    fn default() -> Self {
        Self { quality: 70 }
    }
}

fn render_preview(source: &Path, width: u32, height: u32, dest: &Path, quality: u8) -> Result<GeneratedPreview> {
    let img = image::open(source).with_context(|| format!("decoding {}", source.display()))?;
    let resized = img.resize_exact(width.max(1), height.max(1), FilterType::Triangle);
    let rgb = image::DynamicImage::ImageRgb8(resized.to_rgb8());

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut writer = BufWriter::new(file);
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut writer, quality))
        .with_context(|| format!("encoding preview {}", dest.display()))?;
    writer.flush()?;

    Ok(GeneratedPreview {
        path: dest.to_path_buf(),
        width: rgb.width(),
        height: rgb.height(),
        size: std::fs::metadata(dest)?.len(),
        format: "jpg".to_string(),
    })
}

#[async_trait]
impl PreviewGenerator for ImagePreviewGenerator {
    async fn generate(
        &self,
        source: &Path,
        target_width: u32,
        target_height: u32,
        dest: &Path,
    ) -> Result<GeneratedPreview> {
        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        let quality = self.quality;
        tokio::task::spawn_blocking(move || {
            render_preview(&source, target_width, target_height, &dest, quality)
        })
        .await
        .context("preview task panicked")?
    }
}

/// Preview size for a photo: `target_width` wide, height by aspect ratio.
pub fn preview_dimensions(width: u32, height: u32, target_width: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (target_width, target_width);
    }
    let h = (target_width as f64 * height as f64 / width as f64).round() as u32;
    (target_width, h.max(1))
}

/// A stored preview whose aspect ratio disagrees with the full photo.
pub fn needs_preview_fix(photo: &RemotePhoto) -> bool {
    let Some(preview) = photo.previews.first() else {
        return false;
    };
    if photo.width == 0 || photo.height == 0 || preview.width == 0 || preview.height == 0 {
        return false;
    }
    let photo_ratio = photo.width as f64 / photo.height as f64;
    let preview_ratio = preview.width as f64 / preview.height as f64;
    ((photo_ratio - preview_ratio) / photo_ratio).abs() > ASPECT_TOLERANCE
}

fn scratch_path(tmp_dir: &Path, label: &str, format: &str) -> PathBuf {
    tmp_dir.join(format!("{}-{}.{}", label, uuid::Uuid::new_v4().simple(), format))
}

/// Regenerate a photo's preview from the full-size file and patch the record.
pub async fn repair_preview(
    ctx: &SyncContext,
    photo: &RemotePhoto,
    cancel: &CancellationToken,
) -> Result<RemotePhoto> {
    let bucket = photo
        .network_bucket_id
        .clone()
        .unwrap_or_else(|| ctx.bucket_id.clone());
    let tmp_dir = ctx.tmp_dir();
    tokio::fs::create_dir_all(tmp_dir).await?;

    let full = TempFile::new(scratch_path(tmp_dir, &photo.id, &photo.format));
    ctx.transfer
        .download_file(&bucket, &photo.file_id, full.path(), cancel, None)
        .await
        .with_context(|| format!("downloading {} for preview repair", photo.name))?;

    let (width, height) = preview_dimensions(photo.width, photo.height, ctx.config.preview_width);
    let preview_file = TempFile::new(scratch_path(tmp_dir, &format!("{}-preview", photo.id), "jpg"));
    let generated = ctx
        .previews
        .generate(full.path(), width, height, preview_file.path())
        .await?;

    let file_id = ctx
        .transfer
        .upload_file(&bucket, &generated.path, cancel)
        .await?;
    let previews = vec![PhotoPreview {
        width: generated.width,
        height: generated.height,
        size: generated.size,
        file_id,
        format: generated.format,
    }];
    ctx.photos_api.update_previews(&photo.id, &previews).await?;

    let updated = ctx.photos_api.get_photo(&photo.id).await?;
    if needs_preview_fix(&updated) {
        return Err(anyhow!("preview of {} still mismatched after repair", photo.name));
    }
    ctx.logger.info(
        crate::logger::REMOTE_PULL,
        &format!("PREVIEW_FIXED photo={} {}x{}", photo.id, width, height),
    );
    Ok(updated)
}
