use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::enhance::PROCESSED_SUFFIX;
use crate::model::ItemId;
use crate::traits::{PipelineError, SourceEnumerator};

/// Image extensions accepted by [`DirectorySource`] (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tiff", "bmp"];

/// Enumerates the image files directly inside one directory, sorted by name.
///
/// Sub-directories and artifacts left by a previous run (`*_processed*`)
/// are skipped.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SourceEnumerator for DirectorySource {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn enumerate(&self) -> Result<Vec<ItemId>, PipelineError> {
        let unreadable = |e: std::io::Error| {
            PipelineError::SourceEnumeration(format!(
                "reading directory {}: {}",
                self.root.display(),
                e
            ))
        };

        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(unreadable)?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if is_dir || is_processed_file(&name) || !is_image_file(&name) {
                debug!(file = %name, "skipping");
                continue;
            }
            files.push(entry.path());
        }

        files.sort();
        debug!(count = files.len(), "images found");
        Ok(files.into_iter().map(ItemId::from).collect())
    }
}

/// Whether `name` is an artifact derived by preprocessing.
pub fn is_processed_file(name: &str) -> bool {
    name.contains(PROCESSED_SUFFIX)
}

/// Whether `name` carries an allowed image extension.
pub fn is_image_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
