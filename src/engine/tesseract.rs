use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::EngineKind;
use crate::traits::{PipelineError, TextEngine};

/// Characters tesseract is allowed to emit.
const CHAR_WHITELIST: &str =
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz@+-.() ";

/// Fully automatic page segmentation.
const PAGE_SEG_MODE: &str = "3";

/// Local OCR through the `tesseract` executable.
///
/// The recognized text is whitespace-normalized and returned as
/// `{"text": "..."}`.
#[derive(Debug)]
pub struct TesseractEngine {
    binary: PathBuf,
    closed: AtomicBool,
}

impl TesseractEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl TextEngine for TesseractEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Tesseract
    }

    #[instrument(skip(self), fields(binary = %self.binary.display()))]
    async fn process(&self, artifact: &Path) -> Result<Value, PipelineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::ExtractionEngine("engine is closed".to_string()));
        }

        let output = Command::new(&self.binary)
            .arg(artifact)
            .arg("stdout")
            .args(["--psm", PAGE_SEG_MODE])
            .arg("-c")
            .arg(format!("tessedit_char_whitelist={}", CHAR_WHITELIST))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                PipelineError::ExtractionEngine(format!(
                    "failed to run {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::ExtractionEngine(format!(
                "failed to extract text from image {} ({}): {}",
                artifact.display(),
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        debug!(chars = text.len(), "tesseract finished");
        Ok(text_payload(&text))
    }

    async fn close(&self) -> Result<(), PipelineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Wraps recognized text as the engine payload, collapsing all whitespace.
pub fn text_payload(text: &str) -> Value {
    let clean = text.split_whitespace().collect::<Vec<_>>().join(" ");
    json!({ "text": clean })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_payload_collapses_whitespace() {
        let payload = text_payload("  John Doe\n\tjohn@example.com\r\n  0791234567  ");
        assert_eq!(payload, json!({"text": "John Doe john@example.com 0791234567"}));
    }

    #[tokio::test]
    async fn test_missing_binary_is_engine_error() {
        let engine = TesseractEngine::new("/nonexistent/bin/tesseract-ocr");
        let err = engine.process(Path::new("card.png")).await.unwrap_err();
        assert!(matches!(err, PipelineError::ExtractionEngine(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_binary_is_engine_error() {
        let engine = TesseractEngine::new("false");
        let err = engine.process(Path::new("card.png")).await.unwrap_err();
        assert!(err.to_string().contains("card.png"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_becomes_text_payload() {
        // `echo` prints its arguments, standing in for recognized text.
        let engine = TesseractEngine::new("echo");
        let payload = engine.process(Path::new("card.png")).await.unwrap();
        let text = payload["text"].as_str().unwrap();
        assert!(text.starts_with("card.png stdout --psm 3"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let engine = TesseractEngine::new("tesseract");
        engine.close().await.unwrap();
        engine.close().await.unwrap();
        assert_eq!(engine.kind(), EngineKind::Tesseract);
        assert!(engine.process(Path::new("a.png")).await.is_err());
    }
}
