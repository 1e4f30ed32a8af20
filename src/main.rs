use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ocr_harvester::logging::init_tracing;
use ocr_harvester::{run_directory, EngineConfig, EngineKind, PipelineConfig, PipelineError};

/// Extracts contact details from a directory of images into a CSV file
#[derive(Parser)]
#[command(name = "ocr-harvester", version)]
struct Args {
    /// Directory containing the input images
    #[arg(long, default_value = "images")]
    images: PathBuf,

    /// Directory receiving `<engine>_extracted_data.csv`
    #[arg(long, default_value = "output")]
    output: PathBuf,

    /// Text engine: tesseract or ollama
    #[arg(long, default_value = "tesseract")]
    engine: String,

    /// Number of extraction workers
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Maximum number of preprocessed images alive at once
    #[arg(long, default_value = "2")]
    throttle: usize,

    /// Capacity of each inter-stage queue
    #[arg(long, default_value = "10")]
    queue_capacity: usize,

    /// Upper bound in seconds for one preprocessing or extraction call
    #[arg(long)]
    stage_timeout_secs: Option<u64>,

    /// Ollama base URL (overrides OCR_HARVESTER_OLLAMA_URL)
    #[arg(long)]
    ollama_url: Option<String>,

    /// Ollama vision model (overrides OCR_HARVESTER_OLLAMA_MODEL)
    #[arg(long)]
    ollama_model: Option<String>,

    /// Tesseract executable (overrides OCR_HARVESTER_TESSERACT_BIN)
    #[arg(long)]
    tesseract_bin: Option<PathBuf>,
}

impl Args {
    fn configs(&self) -> Result<(PipelineConfig, EngineConfig), PipelineError> {
        let kind: EngineKind = self.engine.parse()?;

        let mut engine = EngineConfig::from_env(kind);
        if let Some(url) = &self.ollama_url {
            engine = engine.with_ollama_url(url.clone());
        }
        if let Some(model) = &self.ollama_model {
            engine = engine.with_ollama_model(model.clone());
        }
        if let Some(bin) = &self.tesseract_bin {
            engine = engine.with_tesseract_bin(bin.clone());
        }

        let mut pipeline = PipelineConfig::new(kind.output_file(&self.output))
            .with_workers(self.workers)
            .with_throttle(self.throttle)
            .with_queue_capacity(self.queue_capacity);
        if let Some(secs) = self.stage_timeout_secs {
            pipeline = pipeline.with_stage_timeout(Duration::from_secs(secs));
        }
        pipeline.validate()?;

        Ok((pipeline, engine))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let (pipeline_config, engine_config) = match args.configs() {
        Ok(configs) => configs,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let output_path = pipeline_config.output_path.clone();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    info!(
        images = %args.images.display(),
        engine = %engine_config.kind,
        "Starting OCR harvest"
    );
    let results = match run_directory(&args.images, pipeline_config, engine_config, cancel).await
    {
        Ok(results) => results,
        Err(e) => {
            error!(error = %e, "pipeline setup failed");
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut failures: Vec<_> = results.failures.iter().collect();
    failures.sort_by(|a, b| a.0.cmp(b.0));
    for (item, err) in failures {
        println!("Error processing {}: {}", item, err);
    }

    let mut successes: Vec<_> = results.successes.iter().collect();
    successes.sort_by(|a, b| a.0.cmp(b.0));
    for (item, record) in successes {
        println!(
            "Processed {}: name={:?} email={:?} phone={:?} tags={:?}",
            item, record.name, record.email, record.phone, record.tags
        );
    }

    for err in &results.cleanup_errors {
        println!("Cleanup warning: {}", err);
    }
    if results.cancelled {
        println!("Run cancelled before all images were processed");
    }

    println!("Results written to {}", output_path.display());
    println!("Processed {} records", results.successes.len());
    ExitCode::SUCCESS
}
