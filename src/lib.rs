pub mod config;
pub mod engine;
pub mod enhance;
pub mod fields;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod source;
pub mod throttle;
pub mod traits;
pub mod writer;

// Re-export common types for convenience
pub use config::*;
pub use model::*;
pub use pipeline::{run_directory, Pipeline, PipelineBuilder, ResultSet};
pub use throttle::{ReleaseHandle, Throttle, ThrottleSnapshot};
pub use traits::*;
pub use writer::{CsvRow, CsvWriter, WriteMode};
