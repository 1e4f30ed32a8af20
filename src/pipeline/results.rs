use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::model::{ContactRecord, ItemId};
use crate::traits::PipelineError;

/// Synthetic key for run-level failures (unreadable source, aborted stage).
pub const PIPELINE_ERROR_KEY: &str = "pipeline_error";

/// Synthetic key for a text engine that could not be constructed.
pub const ENGINE_ERROR_KEY: &str = "engine";

/// Final artifact of a run.
///
/// `successes` and `failures` never share a key.
#[derive(Debug, Default, Clone)]
pub struct ResultSet {
    pub successes: HashMap<ItemId, ContactRecord>,
    pub failures: HashMap<ItemId, PipelineError>,

    /// Artifacts that could not be removed; never reclassifies an item
    pub cleanup_errors: Vec<PipelineError>,

    /// Whether the run stopped because it was cancelled
    pub cancelled: bool,
}

impl ResultSet {
    /// A result set holding a single run-level failure under `key`.
    pub fn failed(key: &str, error: PipelineError) -> Self {
        let mut set = Self::default();
        set.failures.insert(ItemId::from(key), error);
        set
    }

    /// Number of classified items (successes + failures).
    pub fn total(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    /// The run-level failure, if any.
    pub fn run_error(&self) -> Option<&PipelineError> {
        self.failures.get(&ItemId::from(PIPELINE_ERROR_KEY))
    }
}

/// Lock-guarded accumulator behind [`ResultSet`].
///
/// Only the write stage and the orchestrator's final error drain touch it.
#[derive(Debug, Default)]
pub struct Aggregator {
    inner: Mutex<ResultSet>,
}

impl Aggregator {
    pub fn record_success(&self, id: ItemId, record: ContactRecord) {
        let mut set = self.lock();
        set.failures.remove(&id);
        set.successes.insert(id, record);
    }

    pub fn record_failure(&self, id: ItemId, error: PipelineError) {
        let mut set = self.lock();
        set.successes.remove(&id);
        set.failures.insert(id, error);
    }

    pub fn record_cleanup_error(&self, error: PipelineError) {
        self.lock().cleanup_errors.push(error);
    }

    /// Consumes the aggregator, cloning only if another handle is still alive.
    pub fn finish(self: Arc<Self>) -> ResultSet {
        match Arc::try_unwrap(self) {
            Ok(aggregator) => aggregator
                .inner
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            Err(shared) => shared.lock().clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResultSet> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
