//! Run configuration for saliency generation.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::Device;

use super::aggregation::Aggregation;
use super::attribution::AttributionMethod;
use crate::{Result, SaliencyError};

/// Evaluation split of the NLI dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    /// CSV files making up the split, relative to the dataset directory.
    pub fn files(&self) -> &'static [&'static str] {
        match self {
            Split::Train => &["esnli_train_1.csv", "esnli_train_2.csv"],
            Split::Dev => &["esnli_dev.csv"],
            Split::Test => &["esnli_test.csv"],
        }
    }
}

impl FromStr for Split {
    type Err = SaliencyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "dev" => Ok(Split::Dev),
            "test" => Ok(Split::Test),
            other => Err(SaliencyError::Config(format!("unknown split '{}'", other))),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Dev => "dev",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

/// Where the WordPiece vocabulary comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerSource {
    /// HF name of the pretrained tokenizer (e.g., "bert-base-uncased")
    pub pretrained: Option<String>,
    /// Path to a local vocabulary file, takes precedence over `pretrained`
    pub vocab: Option<PathBuf>,
}

impl Default for TokenizerSource {
    fn default() -> Self {
        Self {
            pretrained: Some("bert-base-uncased".into()),
            vocab: None,
        }
    }
}

/// A family of model replicates and the directory their saliencies go to.
///
/// Replicate `i` is read from `<models_dir>_<i>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelGroup {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl ModelGroup {
    pub fn new(models_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Last path component of `models_dir`, used to name output files.
    pub fn base_model_name(&self) -> String {
        self.models_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Checkpoint path of replicate `replicate` (1-based).
    pub fn checkpoint_path(&self, replicate: usize) -> PathBuf {
        let mut path = self.models_dir.clone().into_os_string();
        path.push(format!("_{}", replicate));
        PathBuf::from(path)
    }

    /// Attribution file of one (replicate, method, aggregation) combination.
    pub fn output_path(
        &self,
        replicate: usize,
        method: AttributionMethod,
        aggregation: Aggregation,
    ) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}_{}_{}",
            self.base_model_name(),
            replicate,
            method,
            aggregation
        ))
    }
}

/// Configuration for a saliency sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    /// Dataset name, informational only
    pub dataset: String,
    /// Directory containing the e-SNLI CSV files
    pub dataset_dir: PathBuf,
    /// Split to attribute
    pub split: Split,
    /// Model family name, informational only
    pub model: String,
    /// Model families and their output directories
    pub models: Vec<ModelGroup>,
    /// Number of replicates per model family (`_1` .. `_N`)
    pub replicates: usize,
    /// Run on CUDA when available
    pub gpu: bool,
    /// Random seed applied once at startup
    pub seed: i64,
    /// Occlusion window width in tokens
    #[serde(alias = "sw")]
    pub sliding_window: i64,
    /// Attribution methods to run, in order
    #[serde(alias = "saliency")]
    pub methods: Vec<AttributionMethod>,
    /// Aggregations applied to gradient methods (occlusion always uses `none`)
    pub gradient_aggregations: Vec<Aggregation>,
    /// Batch size override; the checkpoint's training batch size otherwise
    pub batch_size: Option<usize>,
    /// Vocabulary source
    pub tokenizer: TokenizerSource,
    /// Whether to lowercase input text
    pub lower_case: bool,
    /// Maximum encoded pair length
    pub max_length: usize,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            dataset: "snli".into(),
            dataset_dir: PathBuf::from("data/e-SNLI/dataset/"),
            split: Split::Test,
            model: "cnn".into(),
            models: vec![
                ModelGroup::new("data/models/snli/cnn/cnn", "data/saliency/snli/cnn/"),
                ModelGroup::new(
                    "data/models/snli/random_cnn/cnn",
                    "data/saliency/snli/random_cnn/",
                ),
            ],
            replicates: 5,
            gpu: false,
            seed: 73,
            sliding_window: 1,
            methods: vec![
                AttributionMethod::GuidedBackprop,
                AttributionMethod::Saliency,
                AttributionMethod::InputXGradient,
                AttributionMethod::Occlusion,
            ],
            gradient_aggregations: vec![Aggregation::Mean, Aggregation::L2],
            batch_size: None,
            tokenizer: TokenizerSource::default(),
            lower_case: true,
            max_length: 512,
        }
    }
}

impl SaliencyConfig {
    /// Loads a configuration from a JSON file; missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SaliencyError::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        let config: SaliencyConfig = serde_json::from_str(&content)
            .map_err(|e| SaliencyError::Config(format!("invalid '{}': {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.methods.is_empty() {
            return Err(SaliencyError::Config("no attribution methods given".into()));
        }
        if self.models.is_empty() {
            return Err(SaliencyError::Config("no model directories given".into()));
        }
        if self.replicates == 0 {
            return Err(SaliencyError::Config("replicates must be at least 1".into()));
        }
        if self.sliding_window < 1 {
            return Err(SaliencyError::Config(format!(
                "sliding window must be at least 1, got {}",
                self.sliding_window
            )));
        }
        if self.batch_size == Some(0) {
            return Err(SaliencyError::Config("batch size must be at least 1".into()));
        }
        if self.max_length < 3 {
            return Err(SaliencyError::Config(format!(
                "max length {} cannot hold a sentence pair",
                self.max_length
            )));
        }
        let uses_gradients = self.methods.iter().any(|m| m.is_gradient_based());
        if uses_gradients && self.gradient_aggregations.is_empty() {
            return Err(SaliencyError::Config(
                "gradient methods need at least one aggregation".into(),
            ));
        }
        if let Some(aggregation) = self
            .gradient_aggregations
            .iter()
            .find(|a| !a.accepts_embedding_attributions())
        {
            return Err(SaliencyError::Config(format!(
                "aggregation '{}' cannot reduce gradient attributions",
                aggregation
            )));
        }
        if self.tokenizer.pretrained.is_none() && self.tokenizer.vocab.is_none() {
            return Err(SaliencyError::Config(
                "Either a pretrained tokenizer or a vocabulary file must be specified".into(),
            ));
        }
        Ok(())
    }

    /// Aggregations run for `method`.
    pub fn aggregations_for(&self, method: AttributionMethod) -> Vec<Aggregation> {
        if method.is_gradient_based() {
            self.gradient_aggregations.clone()
        } else {
            vec![Aggregation::None]
        }
    }

    /// Device selected by the `gpu` flag.
    pub fn device(&self) -> Device {
        if self.gpu {
            Device::cuda_if_available()
        } else {
            Device::Cpu
        }
    }
}

/// Builder for creating a SaliencyConfig with custom values.
pub struct SaliencyConfigBuilder {
    pub config: SaliencyConfig,
}

impl SaliencyConfigBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: SaliencyConfig::default(),
        }
    }

    /// Sets the dataset directory and split.
    pub fn dataset(mut self, dataset_dir: impl Into<PathBuf>, split: Split) -> Self {
        self.config.dataset_dir = dataset_dir.into();
        self.config.split = split;
        self
    }

    /// Replaces the model families.
    pub fn models(mut self, models: Vec<ModelGroup>) -> Self {
        self.config.models = models;
        self
    }

    /// Sets the number of replicates per family.
    pub fn replicates(mut self, replicates: usize) -> Self {
        self.config.replicates = replicates;
        self
    }

    /// Sets the attribution methods.
    pub fn methods(mut self, methods: Vec<AttributionMethod>) -> Self {
        self.config.methods = methods;
        self
    }

    /// Sets the aggregations used for gradient methods.
    pub fn gradient_aggregations(mut self, aggregations: Vec<Aggregation>) -> Self {
        self.config.gradient_aggregations = aggregations;
        self
    }

    /// Sets the occlusion window width.
    pub fn sliding_window(mut self, width: i64) -> Self {
        self.config.sliding_window = width;
        self
    }

    /// Overrides the checkpoint batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = Some(size);
        self
    }

    /// Uses a local vocabulary file.
    pub fn vocab_path(mut self, vocab: impl Into<PathBuf>) -> Self {
        self.config.tokenizer = TokenizerSource {
            pretrained: None,
            vocab: Some(vocab.into()),
        };
        self
    }

    /// Uses a pretrained vocabulary from the Hugging Face hub.
    pub fn pretrained_tokenizer(mut self, name: &str) -> Self {
        self.config.tokenizer = TokenizerSource {
            pretrained: Some(name.to_string()),
            vocab: None,
        };
        self
    }

    /// Sets the random seed.
    pub fn seed(mut self, seed: i64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Enables CUDA when available.
    pub fn gpu(mut self, gpu: bool) -> Self {
        self.config.gpu = gpu;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<SaliencyConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SaliencyConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
