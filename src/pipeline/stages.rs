//! Pipeline stages.
//!
//! Every stage owns the sender of exactly one output queue and drops it on
//! return, so closing happens once per queue on every exit path. Every
//! blocking send, receive and permit acquisition races the run's
//! cancellation token.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::results::Aggregator;
use crate::model::{ContactRecord, ExtractionResult, ItemId, PreprocessedItem, Record};
use crate::throttle::Throttle;
use crate::traits::{FieldExtractor, PipelineError, Preprocessor, SourceEnumerator, TextEngine};
use crate::writer::CsvWriter;

/// Out-of-band report drained by the orchestrator after all stages join.
#[derive(Debug)]
pub(crate) enum StageReport {
    /// An item failed before reaching the write stage
    ItemFailed { item: ItemId, error: PipelineError },

    /// A temporary artifact could not be removed
    CleanupFailed { artifact: PathBuf, error: PipelineError },

    /// Infrastructure failure not tied to one item
    RunFailed(PipelineError),
}

/// Collaborators shared by every stage of one run.
#[derive(Clone)]
pub(crate) struct StageContext {
    pub cancel: CancellationToken,
    pub reports: mpsc::UnboundedSender<StageReport>,
    pub stage_timeout: Option<Duration>,
}

impl StageContext {
    fn report(&self, report: StageReport) {
        // The receiver lives in the orchestrator until every stage has joined.
        let _ = self.reports.send(report);
    }
}

async fn recv_or_cancel<T>(cancel: &CancellationToken, rx: &mut mpsc::Receiver<T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Returns `false` when the run was cancelled or the receiver is gone; the
/// value is dropped in both cases.
async fn send_or_cancel<T>(cancel: &CancellationToken, tx: &mpsc::Sender<T>, value: T) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(value) => sent.is_ok(),
    }
}

async fn bounded<T, F>(stage: &str, limit: Option<Duration>, call: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match limit {
        None => call.await,
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            PipelineError::StageTimeout {
                stage: stage.to_string(),
                timeout_secs: limit.as_secs(),
            }
        })?,
    }
}

// ============================================================================
// Stage 0: Enumeration
// ============================================================================

pub(crate) async fn enumerate_source(
    ctx: StageContext,
    source: Arc<dyn SourceEnumerator>,
    out: mpsc::Sender<ItemId>,
) {
    let listed = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return,
        listed = source.enumerate() => listed,
    };

    let items = match listed {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "[enumerate] source unreadable");
            ctx.report(StageReport::RunFailed(e));
            return;
        }
    };

    info!(items = items.len(), "[enumerate] dispatching items");
    for item in items {
        debug!(%item, "[enumerate] sending item");
        if !send_or_cancel(&ctx.cancel, &out, item).await {
            debug!("[enumerate] stopped");
            return;
        }
    }
}

// ============================================================================
// Stage 1: Throttled preprocessing
// ============================================================================

pub(crate) async fn preprocess(
    ctx: StageContext,
    preprocessor: Arc<dyn Preprocessor>,
    throttle: Throttle,
    mut input: mpsc::Receiver<ItemId>,
    out: mpsc::Sender<PreprocessedItem>,
) {
    while let Some(item) = recv_or_cancel(&ctx.cancel, &mut input).await {
        let acquired = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!(%item, "[preprocess] cancelled while waiting for a permit");
                return;
            }
            acquired = throttle.acquire() => acquired,
        };
        let permit = match acquired {
            Ok(permit) => permit,
            Err(e) => {
                ctx.report(StageReport::RunFailed(e));
                return;
            }
        };

        debug!(%item, "[preprocess] enhancing");
        let enhanced = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            enhanced = bounded("preprocess", ctx.stage_timeout, preprocessor.enhance(item.as_path())) => enhanced,
        };

        match enhanced {
            Ok(artifact) => {
                let next = PreprocessedItem {
                    source: item,
                    artifact,
                    release: permit,
                };
                if !send_or_cancel(&ctx.cancel, &out, next).await {
                    debug!("[preprocess] stopped");
                    return;
                }
            }
            Err(error) => {
                permit.release();
                warn!(%item, %error, "[preprocess] failed");
                ctx.report(StageReport::ItemFailed { item, error });
            }
        }
    }
}

// ============================================================================
// Stage 2: Extraction worker pool
// ============================================================================

/// Runs `workers` extraction workers and returns once all of them exited.
///
/// Each worker holds a clone of `out`; the queue closes when the last one
/// is dropped.
pub(crate) async fn extraction_pool(
    ctx: StageContext,
    engine: Arc<dyn TextEngine>,
    workers: usize,
    input: mpsc::Receiver<PreprocessedItem>,
    out: mpsc::Sender<ExtractionResult>,
) {
    let input = Arc::new(Mutex::new(input));
    let mut pool = JoinSet::new();

    for worker in 0..workers {
        pool.spawn(extraction_worker(
            worker + 1,
            ctx.clone(),
            Arc::clone(&engine),
            Arc::clone(&input),
            out.clone(),
        ));
    }
    drop(out);

    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            ctx.report(StageReport::RunFailed(PipelineError::StageAborted(format!(
                "extraction worker: {}",
                e
            ))));
        }
    }
    debug!("[extract] all workers finished");
}

async fn extraction_worker(
    worker: usize,
    ctx: StageContext,
    engine: Arc<dyn TextEngine>,
    input: Arc<Mutex<mpsc::Receiver<PreprocessedItem>>>,
    out: mpsc::Sender<ExtractionResult>,
) {
    debug!(worker, "[extract] worker started");
    loop {
        let next = {
            let mut rx = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                rx = input.lock() => rx,
            };
            recv_or_cancel(&ctx.cancel, &mut rx).await
        };
        let Some(PreprocessedItem {
            source,
            artifact,
            release,
        }) = next
        else {
            break;
        };

        debug!(worker, %source, "[extract] processing");
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                release.release();
                break;
            }
            outcome = bounded("extract", ctx.stage_timeout, engine.process(&artifact)) => outcome,
        };

        if let Err(e) = &outcome {
            warn!(worker, %source, error = %e, "[extract] engine failed");
        }
        let result = ExtractionResult {
            source,
            artifact,
            outcome,
        };
        let delivered = send_or_cancel(&ctx.cancel, &out, result).await;
        release.release();
        if !delivered {
            break;
        }
    }
    debug!(worker, "[extract] worker finished");
}

// ============================================================================
// Stage 3: Splitter
// ============================================================================

/// Forwards every item to both outputs, in order for each of them.
///
/// A slow consumer blocks the splitter rather than being skipped.
pub(crate) async fn split<T: Clone>(
    cancel: CancellationToken,
    mut input: mpsc::Receiver<T>,
    first: mpsc::Sender<T>,
    second: mpsc::Sender<T>,
) {
    while let Some(item) = recv_or_cancel(&cancel, &mut input).await {
        if !send_or_cancel(&cancel, &first, item.clone()).await {
            break;
        }
        if !send_or_cancel(&cancel, &second, item).await {
            break;
        }
    }
    debug!("[split] finished");
}

// ============================================================================
// Stage 4: Field extraction
// ============================================================================

pub(crate) async fn extract_fields(
    ctx: StageContext,
    extractor: Arc<dyn FieldExtractor>,
    mut input: mpsc::Receiver<ExtractionResult>,
    out: mpsc::Sender<Record>,
) {
    while let Some(result) = recv_or_cancel(&ctx.cancel, &mut input).await {
        let ExtractionResult { source, outcome, .. } = result;

        let outcome = match outcome {
            Err(upstream) => Err(upstream),
            Ok(payload) => extractor
                .extract(&payload, &source)
                .ok_or_else(|| PipelineError::no_extractor_result(&source)),
        };
        if let Err(e) = &outcome {
            debug!(%source, error = %e, "[fields] no record");
        }

        if !send_or_cancel(&ctx.cancel, &out, Record { source, outcome }).await {
            break;
        }
    }
}

// ============================================================================
// Stage 5: Cleanup
// ============================================================================

pub(crate) async fn cleanup_artifacts(
    ctx: StageContext,
    preprocessor: Arc<dyn Preprocessor>,
    mut input: mpsc::Receiver<ExtractionResult>,
) {
    while let Some(result) = recv_or_cancel(&ctx.cancel, &mut input).await {
        if result.is_error() {
            debug!(source = %result.source, "[cleanup] skipping failed extraction");
            continue;
        }

        let cleaned = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            cleaned = preprocessor.cleanup(&result.artifact) => cleaned,
        };
        if let Err(error) = cleaned {
            warn!(artifact = %result.artifact.display(), %error, "[cleanup] failed");
            ctx.report(StageReport::CleanupFailed {
                artifact: result.artifact,
                error,
            });
        }
    }
}

// ============================================================================
// Stage 6: Persistence
// ============================================================================

pub(crate) async fn write_records(
    ctx: StageContext,
    writer: Arc<CsvWriter<ContactRecord>>,
    destination: PathBuf,
    results: Arc<Aggregator>,
    mut input: mpsc::Receiver<Record>,
) {
    while let Some(Record { source, outcome }) = recv_or_cancel(&ctx.cancel, &mut input).await {
        let contact = match outcome {
            Ok(contact) => contact,
            Err(error) => {
                info!(%source, %error, "[write] item failed");
                results.record_failure(source, error);
                continue;
            }
        };

        match writer.append(vec![contact.clone()], &destination).await {
            Ok(()) => {
                info!(%source, "[write] record saved");
                results.record_success(source, contact);
            }
            Err(error) => {
                warn!(%source, %error, "[write] record not saved");
                results.record_failure(source, error);
            }
        }
    }

    writer.close().await;
    debug!("[write] writer closed");
}
