pub mod aggregation;
mod api;
pub mod attribution;
pub mod checkpoint;
mod config;
pub mod dataset;
mod model;
mod pipeline;
pub mod predictions;
pub mod serialize;
mod tokenizer;

pub use aggregation::Aggregation;
pub use attribution::{AttributionMethod, Attributor};
pub use checkpoint::{Checkpoint, TrainingArgs};
pub use config::{ModelGroup, SaliencyConfig, SaliencyConfigBuilder, Split, TokenizerSource};
pub use dataset::{Batch, NliDataset, NliInstance};
pub use model::{CnnClassifier, InputMode, InterpretableEmbedding};
pub use pipeline::{SaliencyGenerator, SaliencySweep, ThroughputSummary};
pub use predictions::{CacheStatus, PredictionCache, Predictions};
pub use serialize::{AttributionRecord, AttributionWriter, TokenAttribution};
pub use tokenizer::{resolve_vocab, NliTokenizer};
