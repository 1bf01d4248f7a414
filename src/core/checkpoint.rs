//! Checkpoint loading: training arguments plus model weights.
//!
//! A checkpoint is a directory holding:
//!   args.json  - training configuration (architecture, labels, batch size)
//!   model.ot   - weights in the tch VarStore format

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::Device;
use tracing::{debug, info};

use super::model::CnnClassifier;
use crate::{Result, SaliencyError};

const ARGS_FILE: &str = "args.json";
const WEIGHTS_FILE: &str = "model.ot";

/// Training configuration stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArgs {
    /// Number of output classes
    pub labels: i64,
    /// Batch size used at training time, default for attribution
    pub batch_size: usize,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: i64,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: i64,
    #[serde(default = "default_out_channels")]
    pub out_channels: i64,
    #[serde(default = "default_kernel_heights")]
    pub kernel_heights: Vec<i64>,
    #[serde(default)]
    pub padding: i64,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
}

fn default_vocab_size() -> i64 {
    30522
}

fn default_embedding_dim() -> i64 {
    300
}

fn default_out_channels() -> i64 {
    50
}

fn default_kernel_heights() -> Vec<i64> {
    vec![4, 5, 6]
}

fn default_dropout() -> f64 {
    0.05
}

impl TrainingArgs {
    /// Rejects arguments no model can be built from.
    pub fn validate(&self) -> Result<()> {
        let incompatible = |msg: String| Err(SaliencyError::Checkpoint(msg));
        if self.labels < 1 {
            return incompatible(format!("labels must be positive, got {}", self.labels));
        }
        if self.batch_size == 0 {
            return incompatible("batch size must be positive".into());
        }
        if self.vocab_size < 1 || self.embedding_dim < 1 || self.out_channels < 1 {
            return incompatible(format!(
                "vocab size, embedding dim and channels must be positive, got {}, {}, {}",
                self.vocab_size, self.embedding_dim, self.out_channels
            ));
        }
        if self.kernel_heights.is_empty() || self.kernel_heights.iter().any(|&k| k < 1) {
            return incompatible(format!(
                "invalid kernel heights {:?}",
                self.kernel_heights
            ));
        }
        if self.padding < 0 || !(0.0..1.0).contains(&self.dropout) {
            return incompatible(format!(
                "invalid padding {} or dropout {}",
                self.padding, self.dropout
            ));
        }
        Ok(())
    }
}

/// A trained classifier reconstructed from disk.
pub struct Checkpoint {
    pub path: PathBuf,
    pub model: CnnClassifier,
}

impl Checkpoint {
    /// Loads the arguments and weights under `path` onto `device`.
    pub fn load(path: impl AsRef<Path>, pad_id: i64, device: Device) -> Result<Self> {
        let path = path.as_ref();
        let args = Self::load_args(path)?;

        let mut model = CnnClassifier::new(&args, pad_id, device)?;
        let weights = path.join(WEIGHTS_FILE);
        if !weights.exists() {
            return Err(SaliencyError::Checkpoint(format!(
                "missing weights '{}'",
                weights.display()
            )));
        }
        model.var_store_mut().load(&weights).map_err(|e| {
            SaliencyError::Checkpoint(format!(
                "weights '{}' do not fit the model: {}",
                weights.display(),
                e
            ))
        })?;

        info!("Loaded checkpoint '{}' ({} labels)", path.display(), args.labels);
        Ok(Checkpoint {
            path: path.to_path_buf(),
            model,
        })
    }

    /// Reads only the training arguments of the checkpoint under `path`.
    pub fn load_args(path: impl AsRef<Path>) -> Result<TrainingArgs> {
        let args_path = path.as_ref().join(ARGS_FILE);
        let json = fs::read_to_string(&args_path).map_err(|e| {
            SaliencyError::Checkpoint(format!("cannot read '{}': {}", args_path.display(), e))
        })?;
        let args: TrainingArgs = serde_json::from_str(&json).map_err(|e| {
            SaliencyError::Checkpoint(format!("invalid '{}': {}", args_path.display(), e))
        })?;
        args.validate()?;
        Ok(args)
    }

    /// Writes `model` as a checkpoint directory at `path`.
    pub fn save(model: &CnnClassifier, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        fs::write(
            path.join(ARGS_FILE),
            serde_json::to_string_pretty(model.args())?,
        )?;
        model.var_store().save(path.join(WEIGHTS_FILE))?;
        debug!("Saved checkpoint to '{}'", path.display());
        Ok(())
    }
}
