//! Command-line interface for saliency-gen.
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::core::{Aggregation, AttributionMethod, Split};

#[derive(Parser)]
#[command(name = "saliency-gen", about = "Token attributions for NLI classifiers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliMethod {
    Sal,
    Inputx,
    Guided,
    Deeplift,
    Occlusion,
}

impl From<CliMethod> for AttributionMethod {
    fn from(method: CliMethod) -> Self {
        match method {
            CliMethod::Sal => AttributionMethod::Saliency,
            CliMethod::Inputx => AttributionMethod::InputXGradient,
            CliMethod::Guided => AttributionMethod::GuidedBackprop,
            CliMethod::Deeplift => AttributionMethod::DeepLift,
            CliMethod::Occlusion => AttributionMethod::Occlusion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliAggregation {
    None,
    Dot,
    Mean,
    L2,
}

impl From<CliAggregation> for Aggregation {
    fn from(aggregation: CliAggregation) -> Self {
        match aggregation {
            CliAggregation::None => Aggregation::None,
            CliAggregation::Dot => Aggregation::Dot,
            CliAggregation::Mean => Aggregation::Mean,
            CliAggregation::L2 => Aggregation::L2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliSplit {
    Train,
    Dev,
    Test,
}

impl From<CliSplit> for Split {
    fn from(split: CliSplit) -> Self {
        match split {
            CliSplit::Train => Split::Train,
            CliSplit::Dev => Split::Dev,
            CliSplit::Test => Split::Test,
        }
    }
}

#[derive(Args)]
pub struct SweepArgs {
    /// JSON run configuration
    #[arg(short, long)]
    pub config: PathBuf,

    /// Run on CUDA when available
    #[arg(long)]
    pub gpu: bool,

    /// Override the configured seed
    #[arg(long)]
    pub seed: Option<i64>,
}

#[derive(Args)]
pub struct AttributeArgs {
    /// Checkpoint directory (args.json + model.ot)
    #[arg(long)]
    pub checkpoint: PathBuf,

    /// Attribution file to write
    #[arg(short, long)]
    pub output: PathBuf,

    #[arg(short, long)]
    pub method: CliMethod,

    #[arg(short, long)]
    pub aggregation: CliAggregation,

    /// Directory holding the e-SNLI CSV files
    #[arg(long)]
    pub dataset_dir: PathBuf,

    #[arg(long, default_value = "test")]
    pub split: CliSplit,

    #[clap(flatten)]
    pub tokenizer: TokenizerSpec,

    /// Batch size; the checkpoint's training batch size otherwise
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Occlusion window width in tokens
    #[arg(long, default_value_t = 1)]
    pub sliding_window: i64,

    /// Run on CUDA when available
    #[arg(long)]
    pub gpu: bool,

    #[arg(long, default_value_t = 73)]
    pub seed: i64,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false, args = ["pretrained", "vocab"])]
pub struct TokenizerSpec {
    /// HF name of the pretrained tokenizer (e.g., "bert-base-uncased")
    #[arg(long)]
    pub pretrained: Option<String>,

    /// Path to vocabulary file
    #[arg(long)]
    pub vocab: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run every configured method, aggregation and replicate
    Sweep(SweepArgs),

    /// Attribute one checkpoint with one method and aggregation
    Attribute(AttributeArgs),
}
