//! Capability traits and the pipeline error taxonomy.
//!
//! The pipeline core never talks to an OCR engine, an image library or the
//! filesystem layout directly. It depends on the capabilities below, which
//! are supplied once by the orchestrator and passed into every stage:
//! - [`SourceEnumerator`]: yields the item identifiers of a run
//! - [`Preprocessor`]: produces (and later removes) temporary artifacts
//! - [`TextEngine`]: turns an artifact into a raw structured payload
//! - [`FieldExtractor`]: maps a payload onto a [`ContactRecord`]

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::EngineKind;
use crate::model::{ContactRecord, ItemId};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur anywhere in a pipeline run.
///
/// Payloads are plain strings so an error can travel through the splitter
/// to both downstream branches (`Clone`) and be stored in the result set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The source could not be read or listed
    #[error("Source enumeration failed: {0}")]
    SourceEnumeration(String),

    /// Preprocessing of a single item failed
    #[error("Preprocessing failed: {0}")]
    Preprocess(String),

    /// The text-extraction engine failed for an item, or could not be built
    #[error("Extraction engine error: {0}")]
    ExtractionEngine(String),

    /// Structured fields could not be extracted from an engine payload
    #[error("Field extraction failed: {0}")]
    FieldExtraction(String),

    /// A temporary artifact could not be removed
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// Persisting records to the destination failed
    #[error("Write failed: {0}")]
    Write(String),

    /// The writer no longer accepts requests
    #[error("{0}")]
    Shutdown(String),

    /// A required collaborator was not supplied to the pipeline
    #[error("Pipeline wiring error: {0}")]
    Wiring(String),

    /// Invalid configuration, including unknown engine kinds
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An external call exceeded the configured stage timeout
    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },

    /// A stage task panicked or was aborted before it finished
    #[error("Stage aborted: {0}")]
    StageAborted(String),
}

impl PipelineError {
    pub(crate) fn writer_shutting_down() -> Self {
        PipelineError::Shutdown("writer shutting down".to_string())
    }

    pub(crate) fn no_extractor_result(source: &ItemId) -> Self {
        PipelineError::FieldExtraction(format!("extractor returned no result for {}", source))
    }
}

// ============================================================================
// Capability Traits
// ============================================================================

/// Produces the finite, ordered list of items a run processes.
#[async_trait]
pub trait SourceEnumerator: Send + Sync {
    /// Lists every item of the source.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SourceEnumeration`] if the source is unreadable.
    async fn enumerate(&self) -> Result<Vec<ItemId>, PipelineError>;
}

/// Preprocessing capability: creates a temporary artifact per item.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Transforms `item` and returns the path of the produced artifact.
    async fn enhance(&self, item: &Path) -> Result<PathBuf, PipelineError>;

    /// Removes an artifact previously returned by [`Preprocessor::enhance`].
    async fn cleanup(&self, artifact: &Path) -> Result<(), PipelineError>;
}

/// Text-extraction capability.
///
/// Implementations are interchangeable: a local binary engine and a remote
/// vision model both satisfy it. One call processes one artifact with no
/// internal fan-out.
#[async_trait]
pub trait TextEngine: Send + Sync {
    /// The engine kind this implementation was built for.
    fn kind(&self) -> EngineKind;

    /// Extracts a raw payload from the artifact at `artifact`.
    async fn process(&self, artifact: &Path) -> Result<Value, PipelineError>;

    /// Releases engine resources. Calling it more than once is a no-op.
    async fn close(&self) -> Result<(), PipelineError>;
}

/// Maps a raw engine payload to a structured record.
pub trait FieldExtractor: Send + Sync {
    /// Returns `None` when nothing usable could be extracted.
    fn extract(&self, payload: &Value, source: &ItemId) -> Option<ContactRecord>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_error_message() {
        let err = PipelineError::writer_shutting_down();
        assert_eq!(err.to_string(), "writer shutting down");
    }

    #[test]
    fn test_timeout_error_message() {
        let err = PipelineError::StageTimeout {
            stage: "extract".to_string(),
            timeout_secs: 30,
        };
        assert_eq!(err.to_string(), "Stage 'extract' timed out after 30s");
    }

    #[test]
    fn test_no_result_error_names_item() {
        let err = PipelineError::no_extractor_result(&ItemId::from("scans/a.png"));
        assert!(matches!(err, PipelineError::FieldExtraction(_)));
        assert!(err.to_string().contains("scans/a.png"));
    }
}
