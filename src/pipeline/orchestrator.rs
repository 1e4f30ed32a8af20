//! Pipeline coordinator.
//!
//! [`Pipeline`] wires the stages together for one run:
//! enumerate → preprocess (throttled) → extract (N workers) → split →
//! {fields → write; cleanup}. Stage failures travel to the orchestrator as
//! reports and are folded into the [`ResultSet`] once every stage joined.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::results::{Aggregator, ResultSet, ENGINE_ERROR_KEY, PIPELINE_ERROR_KEY};
use super::stages::{self, StageContext, StageReport};
use crate::config::{EngineConfig, PipelineConfig};
use crate::engine::build_engine;
use crate::enhance::ImageEnhancer;
use crate::fields::ContactFieldExtractor;
use crate::model::ContactRecord;
use crate::source::DirectorySource;
use crate::throttle::{Throttle, ThrottleSnapshot};
use crate::traits::{FieldExtractor, PipelineError, Preprocessor, SourceEnumerator, TextEngine};
use crate::writer::CsvWriter;

// ============================================================================
// Builder
// ============================================================================

/// Collects the capabilities of a [`Pipeline`].
///
/// # Example
///
/// ```ignore
/// let pipeline = Pipeline::builder(PipelineConfig::new("output/tesseract_extracted_data.csv"))
///     .with_source(Arc::new(DirectorySource::new("images")))
///     .with_preprocessor(Arc::new(ImageEnhancer::new()))
///     .with_engine(engine)
///     .with_extractor(Arc::new(ContactFieldExtractor::new()))
///     .build()?;
/// let results = pipeline.run().await;
/// ```
pub struct PipelineBuilder {
    config: PipelineConfig,
    source: Option<Arc<dyn SourceEnumerator>>,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    engine: Option<Arc<dyn TextEngine>>,
    extractor: Option<Arc<dyn FieldExtractor>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            source: None,
            preprocessor: None,
            engine: None,
            extractor: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SourceEnumerator>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn TextEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FieldExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Validates the configuration and checks that every capability is set.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Config`] if the configuration is invalid
    /// - [`PipelineError::Wiring`] if a capability was never supplied
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;

        let missing = |what: &str| PipelineError::Wiring(format!("no {} supplied", what));
        let source = self.source.ok_or_else(|| missing("source enumerator"))?;
        let preprocessor = self.preprocessor.ok_or_else(|| missing("preprocessor"))?;
        let engine = self.engine.ok_or_else(|| missing("text engine"))?;
        let extractor = self.extractor.ok_or_else(|| missing("field extractor"))?;

        Ok(Pipeline {
            throttle: Throttle::new(self.config.throttle),
            config: self.config,
            source,
            preprocessor,
            engine,
            extractor,
        })
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// A fully wired, reusable pipeline.
///
/// Each call to [`Pipeline::run`] uses fresh queues and a fresh writer; the
/// throttle is shared across runs so its counters accumulate.
pub struct Pipeline {
    source: Arc<dyn SourceEnumerator>,
    preprocessor: Arc<dyn Preprocessor>,
    engine: Arc<dyn TextEngine>,
    extractor: Arc<dyn FieldExtractor>,
    config: PipelineConfig,
    throttle: Throttle,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn throttle_stats(&self) -> ThrottleSnapshot {
        self.throttle.stats()
    }

    /// Runs every enumerated item to completion.
    pub async fn run(&self) -> ResultSet {
        self.run_until_cancelled(CancellationToken::new()).await
    }

    /// Runs until every item is classified or `cancel` fires.
    ///
    /// Always returns a [`ResultSet`]. Per-item failures are keyed by item;
    /// run-level failures are stored under [`PIPELINE_ERROR_KEY`]. After a
    /// cancellation the result holds whatever was classified so far and
    /// `cancelled` is set.
    #[instrument(skip_all, fields(
        workers = self.config.workers,
        throttle = self.config.throttle,
        engine = %self.engine.kind(),
    ))]
    pub async fn run_until_cancelled(&self, cancel: CancellationToken) -> ResultSet {
        let start = Instant::now();
        let cancel = cancel.child_token();
        let capacity = self.config.queue_capacity;

        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let ctx = StageContext {
            cancel: cancel.clone(),
            reports: reports_tx,
            stage_timeout: self.config.stage_timeout,
        };

        let (items_tx, items_rx) = mpsc::channel(capacity);
        let (prepared_tx, prepared_rx) = mpsc::channel(capacity);
        let (extracted_tx, extracted_rx) = mpsc::channel(capacity);
        let (fields_tx, fields_rx) = mpsc::channel(capacity);
        let (cleanup_tx, cleanup_rx) = mpsc::channel(capacity);
        let (records_tx, records_rx) = mpsc::channel(capacity);

        let results = Arc::new(Aggregator::default());
        let writer = Arc::new(CsvWriter::<ContactRecord>::new());

        info!("Starting pipeline run");
        let mut stages = JoinSet::new();
        stages.spawn(stages::enumerate_source(
            ctx.clone(),
            Arc::clone(&self.source),
            items_tx,
        ));
        stages.spawn(stages::preprocess(
            ctx.clone(),
            Arc::clone(&self.preprocessor),
            self.throttle.clone(),
            items_rx,
            prepared_tx,
        ));
        stages.spawn(stages::extraction_pool(
            ctx.clone(),
            Arc::clone(&self.engine),
            self.config.workers,
            prepared_rx,
            extracted_tx,
        ));
        stages.spawn(stages::split(
            cancel.clone(),
            extracted_rx,
            fields_tx,
            cleanup_tx,
        ));
        stages.spawn(stages::extract_fields(
            ctx.clone(),
            Arc::clone(&self.extractor),
            fields_rx,
            records_tx,
        ));
        stages.spawn(stages::cleanup_artifacts(
            ctx.clone(),
            Arc::clone(&self.preprocessor),
            cleanup_rx,
        ));
        stages.spawn(stages::write_records(
            ctx.clone(),
            Arc::clone(&writer),
            self.config.output_path.clone(),
            Arc::clone(&results),
            records_rx,
        ));
        // The stages hold the only remaining report senders.
        drop(ctx);

        while let Some(joined) = stages.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "stage task aborted");
                results.record_failure(
                    PIPELINE_ERROR_KEY.into(),
                    PipelineError::StageAborted(e.to_string()),
                );
            }
        }
        // A panicked write stage never reached its own close.
        writer.close().await;

        while let Ok(report) = reports_rx.try_recv() {
            match report {
                StageReport::ItemFailed { item, error } => results.record_failure(item, error),
                StageReport::CleanupFailed { artifact, error } => {
                    warn!(artifact = %artifact.display(), %error, "artifact left behind");
                    results.record_cleanup_error(error);
                }
                StageReport::RunFailed(error) => {
                    results.record_failure(PIPELINE_ERROR_KEY.into(), error)
                }
            }
        }

        let mut set = results.finish();
        set.cancelled = cancel.is_cancelled();

        let stats = self.throttle.stats();
        info!(
            successes = set.successes.len(),
            failures = set.failures.len(),
            cleanup_errors = set.cleanup_errors.len(),
            cancelled = set.cancelled,
            peak_permits = stats.peak,
            duration_ms = start.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );
        set
    }
}

// ============================================================================
// Directory runs
// ============================================================================

/// Runs the standard image pipeline over every image in `images_dir`.
///
/// Records go to `pipeline_config.output_path`. The engine is built from
/// `engine_config` and closed after the run.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if `pipeline_config` is invalid. An
/// engine that cannot be built is not an error here: the returned result
/// set carries it under [`ENGINE_ERROR_KEY`].
pub async fn run_directory(
    images_dir: &Path,
    pipeline_config: PipelineConfig,
    engine_config: EngineConfig,
    cancel: CancellationToken,
) -> Result<ResultSet, PipelineError> {
    pipeline_config.validate()?;

    let engine = match build_engine(&engine_config) {
        Ok(engine) => engine,
        Err(e) => {
            warn!(engine = %engine_config.kind, error = %e, "engine unavailable");
            return Ok(ResultSet::failed(ENGINE_ERROR_KEY, e));
        }
    };

    let pipeline = Pipeline::builder(pipeline_config)
        .with_source(Arc::new(DirectorySource::new(images_dir)))
        .with_preprocessor(Arc::new(ImageEnhancer::new()))
        .with_engine(Arc::clone(&engine))
        .with_extractor(Arc::new(ContactFieldExtractor::new()))
        .build()?;

    let results = pipeline.run_until_cancelled(cancel).await;

    if let Err(e) = engine.close().await {
        warn!(error = %e, "engine did not close cleanly");
    }
    Ok(results)
}

// ============================================================================
// Tests
// ============================================================================
