//! Run configuration.
//!
//! [`PipelineConfig`] sizes the pipeline (workers, throttle, queues) and
//! names the destination; [`EngineConfig`] selects and parameterizes the
//! text-extraction engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::traits::PipelineError;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2-vision";
pub const DEFAULT_TESSERACT_BIN: &str = "tesseract";

const ENV_OLLAMA_URL: &str = "OCR_HARVESTER_OLLAMA_URL";
const ENV_OLLAMA_MODEL: &str = "OCR_HARVESTER_OLLAMA_MODEL";
const ENV_TESSERACT_BIN: &str = "OCR_HARVESTER_TESSERACT_BIN";

/// Closed set of text-extraction engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Local `tesseract` binary
    Tesseract,

    /// Remote Ollama vision model over HTTP
    Ollama,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Tesseract => "tesseract",
            EngineKind::Ollama => "ollama",
        }
    }

    /// Destination derived from the engine kind: `<dir>/<kind>_extracted_data.csv`.
    pub fn output_file(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}_extracted_data.csv", self.as_str()))
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tesseract" => Ok(EngineKind::Tesseract),
            "ollama" => Ok(EngineKind::Ollama),
            other => Err(PipelineError::Config(format!(
                "unknown engine type: '{}' (expected 'tesseract' or 'ollama')",
                other
            ))),
        }
    }
}

/// Engine selection and engine-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub kind: EngineKind,

    /// Base URL of the Ollama server
    pub ollama_url: String,

    /// Vision model requested from Ollama
    pub ollama_model: String,

    /// Path or name of the tesseract executable
    pub tesseract_bin: PathBuf,
}

impl EngineConfig {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
            tesseract_bin: PathBuf::from(DEFAULT_TESSERACT_BIN),
        }
    }

    /// Defaults overridden by `OCR_HARVESTER_*` environment variables.
    pub fn from_env(kind: EngineKind) -> Self {
        let mut config = Self::new(kind);
        if let Ok(url) = std::env::var(ENV_OLLAMA_URL) {
            config.ollama_url = url;
        }
        if let Ok(model) = std::env::var(ENV_OLLAMA_MODEL) {
            config.ollama_model = model;
        }
        if let Ok(bin) = std::env::var(ENV_TESSERACT_BIN) {
            config.tesseract_bin = PathBuf::from(bin);
        }
        config
    }

    pub fn with_ollama_url(mut self, url: impl Into<String>) -> Self {
        self.ollama_url = url.into();
        self
    }

    pub fn with_ollama_model(mut self, model: impl Into<String>) -> Self {
        self.ollama_model = model.into();
        self
    }

    pub fn with_tesseract_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.tesseract_bin = bin.into();
        self
    }
}

/// Sizing and destination of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of extraction workers (N)
    pub workers: usize,

    /// Maximum number of preprocessed artifacts alive at once (K)
    pub throttle: usize,

    /// Capacity of every bounded inter-stage queue
    pub queue_capacity: usize,

    /// Upper bound for one external `enhance`/`process` call; unbounded when `None`
    pub stage_timeout: Option<Duration>,

    /// CSV destination for successful records
    pub output_path: PathBuf,
}

impl PipelineConfig {
    /// Creates a configuration writing to `output_path`.
    ///
    /// Default sizing: 2 workers, 2 permits, queues of 10.
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            workers: 2,
            throttle: 2,
            queue_capacity: 10,
            stage_timeout: None,
            output_path: output_path.into(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_throttle(mut self, permits: usize) -> Self {
        self.throttle = permits;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    /// Rejects sizes the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be at least 1".to_string()));
        }
        if self.throttle == 0 {
            return Err(PipelineError::Config("throttle must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::Config(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.stage_timeout == Some(Duration::ZERO) {
            return Err(PipelineError::Config(
                "stage timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
