//! Token-level saliency generation for NLI classifiers.
//!
//! Loads CNN checkpoints, attributes every class logit back to the input
//! tokens with gradient or occlusion methods, and writes one JSON line of
//! per-token scores per evaluation instance.

pub mod cli;
pub mod core;
pub mod error;

// Re-export main types
pub use crate::core::{
    Aggregation, AttributionMethod, SaliencyConfig, SaliencyConfigBuilder, SaliencyGenerator,
    SaliencySweep, ThroughputSummary,
};
pub use error::{Result, SaliencyError};

// Re-export modules for downstream analysis code
pub use crate::core::aggregation;
pub use crate::core::attribution;
pub use crate::core::checkpoint;
pub use crate::core::dataset;
pub use crate::core::predictions;
pub use crate::core::serialize;
