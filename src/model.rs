use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::throttle::ReleaseHandle;
use crate::traits::PipelineError;
use crate::writer::CsvRow;

/// Opaque handle naming one unit of work, unique per run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<PathBuf> for ItemId {
    fn from(path: PathBuf) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

impl From<&Path> for ItemId {
    fn from(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

/// An item whose temporary artifact exists and still holds a throttle permit.
///
/// The permit is bound to the artifact's lifetime in the pipeline, not to
/// the preprocessing call that created it.
#[derive(Debug)]
pub struct PreprocessedItem {
    /// Identifier produced by the enumerator
    pub source: ItemId,

    /// Temporary artifact created by preprocessing
    pub artifact: PathBuf,

    /// Frees the throttle permit; released on drop if never called
    pub release: ReleaseHandle,
}

/// Output of one text-extraction call.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub source: ItemId,
    pub artifact: PathBuf,
    pub outcome: Result<Value, PipelineError>,
}

impl ExtractionResult {
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

/// Structured contact fields harvested from one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContactRecord {
    pub filename: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub tags: Vec<String>,
    pub text: String,
}

impl CsvRow for ContactRecord {
    fn header() -> &'static [&'static str] {
        &["Filename", "Name", "Email", "Phone", "Tags", "Text"]
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.filename.clone(),
            self.name.clone(),
            self.email.clone(),
            self.phone.clone(),
            self.tags.join("; "),
            self.text.clone(),
        ]
    }
}

/// Terminal outcome of field extraction for one item.
#[derive(Debug, Clone)]
pub struct Record {
    pub source: ItemId,
    pub outcome: Result<ContactRecord, PipelineError>,
}
