//! Image preprocessing ahead of OCR.

use async_trait::async_trait;
use image::imageops::FilterType;
use image::GenericImageView;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::traits::{PipelineError, Preprocessor};

/// Marker inserted into the file stem of every derived artifact.
pub const PROCESSED_SUFFIX: &str = "_processed";

/// Images narrower or shorter than this are upscaled 2x.
const MIN_DIMENSION: u32 = 300;
const CONTRAST_BOOST: f32 = 10.0;
const SHARPEN_SIGMA: f32 = 1.1;

/// Grayscale, contrast and sharpening pass writing `<stem>_processed.<ext>`
/// next to the source image.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageEnhancer;

impl ImageEnhancer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Preprocessor for ImageEnhancer {
    #[instrument(skip(self))]
    async fn enhance(&self, item: &Path) -> Result<PathBuf, PipelineError> {
        let source = item.to_path_buf();
        tokio::task::spawn_blocking(move || enhance_image(&source))
            .await
            .map_err(|e| PipelineError::Preprocess(format!("Task join error: {}", e)))?
    }

    async fn cleanup(&self, artifact: &Path) -> Result<(), PipelineError> {
        tokio::fs::remove_file(artifact).await.map_err(|e| {
            PipelineError::Cleanup(format!("removing {}: {}", artifact.display(), e))
        })?;
        debug!(path = %artifact.display(), "artifact removed");
        Ok(())
    }
}

/// Path of the artifact derived from `source`.
pub fn processed_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match source.extension() {
        Some(ext) => format!("{}{}.{}", stem, PROCESSED_SUFFIX, ext.to_string_lossy()),
        None => format!("{}{}", stem, PROCESSED_SUFFIX),
    };
    source.with_file_name(name)
}

fn enhance_image(source: &Path) -> Result<PathBuf, PipelineError> {
    let img = image::open(source).map_err(|e| {
        PipelineError::Preprocess(format!("opening image {}: {}", source.display(), e))
    })?;

    let (width, height) = img.dimensions();
    let img = if width < MIN_DIMENSION || height < MIN_DIMENSION {
        img.resize_exact(width * 2, height * 2, FilterType::Lanczos3)
    } else {
        img
    };

    let enhanced = img
        .grayscale()
        .adjust_contrast(CONTRAST_BOOST)
        .unsharpen(SHARPEN_SIGMA, 0);

    let target = processed_path(source);
    enhanced.save(&target).map_err(|e| {
        PipelineError::Preprocess(format!("saving processed image {}: {}", target.display(), e))
    })?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(dir: &Path, name: &str, size: u32) -> PathBuf {
        let path = dir.join(name);
        image::RgbImage::from_pixel(size, size, image::Rgb([120u8, 140, 160]))
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_processed_path() {
        assert_eq!(
            processed_path(Path::new("images/card.JPG")),
            PathBuf::from("images/card_processed.JPG")
        );
        assert_eq!(processed_path(Path::new("scan")), PathBuf::from("scan_processed"));
    }

    #[tokio::test]
    async fn test_small_image_is_upscaled() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_png(dir.path(), "card.png", 32);

        let artifact = ImageEnhancer::new().enhance(&source).await.unwrap();
        assert_eq!(artifact, dir.path().join("card_processed.png"));

        let processed = image::open(&artifact).unwrap();
        assert_eq!(processed.dimensions(), (64, 64));
    }

    #[tokio::test]
    async fn test_large_image_keeps_size() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_png(dir.path(), "big.png", 320);

        let artifact = ImageEnhancer::new().enhance(&source).await.unwrap();
        assert_eq!(image::open(&artifact).unwrap().dimensions(), (320, 320));
    }

    #[tokio::test]
    async fn test_unreadable_image_is_preprocess_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.png");
        std::fs::write(&bogus, b"not an image").unwrap();

        let err = ImageEnhancer::new().enhance(&bogus).await.unwrap_err();
        assert!(matches!(err, PipelineError::Preprocess(_)));
    }

    #[tokio::test]
    async fn test_cleanup_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_png(dir.path(), "card.png", 16);
        let enhancer = ImageEnhancer::new();

        let artifact = enhancer.enhance(&source).await.unwrap();
        enhancer.cleanup(&artifact).await.unwrap();
        assert!(!artifact.exists());
        assert!(source.exists());

        let err = enhancer.cleanup(&artifact).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cleanup(_)));
    }
}
