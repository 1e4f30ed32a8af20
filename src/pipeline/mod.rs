//! Bounded concurrent extraction pipeline.
//!
//! This module provides the [`Pipeline`] coordinator, its stages and the
//! [`ResultSet`] every run produces.

pub mod orchestrator;
pub mod results;
mod stages;

pub use orchestrator::{run_directory, Pipeline, PipelineBuilder};
pub use results::{Aggregator, ResultSet, ENGINE_ERROR_KEY, PIPELINE_ERROR_KEY};
