use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, instrument};

use super::json::extract_json;
use crate::config::EngineKind;
use crate::traits::{PipelineError, TextEngine};

const EXTRACTION_PROMPT: &str = "\
You are an OCR assistant. The image shows a contact card with these fields:
Name, Email, Phone, Tags.

1. Read the text of every field.
2. For Tags, list every label you can see. If there are none, use [\"MISS\"].
3. Answer with a single JSON object and nothing else:

{\"Name\": \"<value or empty string>\", \"Email\": \"<value or empty string>\", \
\"Phone\": \"<value or empty string>\", \"Tags\": [\"<tag>\", ...]}

Use empty strings for unreadable fields. Use double quotes, no trailing commas, no comments.";

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Remote vision-model OCR through an Ollama server.
pub struct OllamaEngine {
    base_url: String,
    model: String,
    client: reqwest::Client,
    closed: AtomicBool,
}

impl OllamaEngine {
    /// # Errors
    ///
    /// [`PipelineError::ExtractionEngine`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, model: &str) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder().build().map_err(|e| {
            PipelineError::ExtractionEngine(format!("failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            closed: AtomicBool::new(false),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, image: &[u8]) -> Result<String, PipelineError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt: EXTRACTION_PROMPT,
            images: vec![base64::engine::general_purpose::STANDARD.encode(image)],
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    PipelineError::ExtractionEngine(format!(
                        "cannot connect to Ollama at {}",
                        self.base_url
                    ))
                } else {
                    PipelineError::ExtractionEngine(format!("failed to send request: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ExtractionEngine(format!(
                "ollama request failed with status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            PipelineError::ExtractionEngine(format!("failed to parse response: {}", e))
        })?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl TextEngine for OllamaEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Ollama
    }

    #[instrument(skip(self), fields(model = %self.model))]
    async fn process(&self, artifact: &Path) -> Result<Value, PipelineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::ExtractionEngine("engine is closed".to_string()));
        }

        let image = tokio::fs::read(artifact).await.map_err(|e| {
            PipelineError::ExtractionEngine(format!(
                "failed to read image {}: {}",
                artifact.display(),
                e
            ))
        })?;

        let start = Instant::now();
        let answer = self.generate(&image).await?;
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            chars = answer.len(),
            "ollama answered"
        );

        extract_json(&answer)
    }

    async fn close(&self) -> Result<(), PipelineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
