//! Text-extraction engines.
//!
//! - [`TesseractEngine`]: local `tesseract` binary
//! - [`OllamaEngine`]: remote vision model over HTTP
//!
//! [`build_engine`] resolves an [`EngineKind`] to one of them.

pub mod json;
pub mod ollama;
pub mod tesseract;

use std::sync::Arc;
use tracing::info;

use crate::config::{EngineConfig, EngineKind};
use crate::traits::{PipelineError, TextEngine};

pub use json::extract_json;
pub use ollama::OllamaEngine;
pub use tesseract::TesseractEngine;

/// Builds the engine selected by `config.kind`.
///
/// # Errors
///
/// [`PipelineError::ExtractionEngine`] if the engine cannot be constructed.
pub fn build_engine(config: &EngineConfig) -> Result<Arc<dyn TextEngine>, PipelineError> {
    let engine: Arc<dyn TextEngine> = match config.kind {
        EngineKind::Tesseract => Arc::new(TesseractEngine::new(config.tesseract_bin.clone())),
        EngineKind::Ollama => Arc::new(OllamaEngine::new(
            &config.ollama_url,
            &config.ollama_model,
        )?),
    };
    info!(engine = %config.kind, "Text engine ready");
    Ok(engine)
}
