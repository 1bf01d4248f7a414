//! Per-checkpoint cache of predicted classes and logits.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::Kind;
use tracing::info;

use super::checkpoint::Checkpoint;
use super::dataset::NliDataset;
use super::model::InputMode;
use crate::{Result, SaliencyError};

/// Model outputs for every dataset instance, in dataset order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    /// Arg-max class per instance
    pub class: Vec<i64>,
    /// Raw logits per instance
    pub logits: Vec<Vec<f32>>,
}

impl Predictions {
    pub fn len(&self) -> usize {
        self.class.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class.is_empty()
    }
}

/// Outcome of [`PredictionCache::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Inference ran and the cache file was written.
    Computed,
    /// A cache file already existed and was left untouched.
    Reused,
}

pub struct PredictionCache;

impl PredictionCache {
    /// `<checkpoint path>.predictions`
    pub fn path_for(checkpoint_path: &Path) -> PathBuf {
        let mut path = checkpoint_path.as_os_str().to_owned();
        path.push(".predictions");
        PathBuf::from(path)
    }

    /// Partial file the cache is written to before being renamed into place.
    fn partial_path_for(checkpoint_path: &Path) -> PathBuf {
        let mut path = Self::path_for(checkpoint_path).into_os_string();
        path.push(".partial");
        PathBuf::from(path)
    }

    /// Writes the prediction cache of `checkpoint` unless it already exists.
    ///
    /// An existing file is trusted as is; checkpoints are never modified in
    /// place, so it cannot be stale. The file only appears once it is
    /// complete, an interrupted write leaves at most a `.partial` sibling.
    pub fn ensure(
        checkpoint: &Checkpoint,
        dataset: &NliDataset,
        batch_size: usize,
        pad_id: i64,
    ) -> Result<CacheStatus> {
        let path = Self::path_for(&checkpoint.path);
        if path.exists() {
            info!("Reusing predictions '{}'", path.display());
            return Ok(CacheStatus::Reused);
        }

        let predictions = Self::predict(checkpoint, dataset, batch_size, pad_id)?;
        let partial = Self::partial_path_for(&checkpoint.path);
        let mut writer = BufWriter::new(File::create(&partial)?);
        serde_json::to_writer(&mut writer, &predictions)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&partial, &path)?;
        info!(
            "Wrote {} predictions to '{}'",
            predictions.len(),
            path.display()
        );
        Ok(CacheStatus::Computed)
    }

    /// Reads the cache written for the checkpoint at `checkpoint_path`.
    pub fn load(checkpoint_path: &Path) -> Result<Predictions> {
        let path = Self::path_for(checkpoint_path);
        let file = File::open(&path).map_err(|e| {
            SaliencyError::Checkpoint(format!("cannot open '{}': {}", path.display(), e))
        })?;
        let predictions: Predictions = serde_json::from_reader(BufReader::new(file))?;
        if predictions.logits.len() != predictions.class.len() {
            return Err(SaliencyError::Checkpoint(format!(
                "'{}' holds {} classes but {} logit rows",
                path.display(),
                predictions.class.len(),
                predictions.logits.len()
            )));
        }
        Ok(predictions)
    }

    /// Removes the cache of `checkpoint_path` if present.
    pub fn invalidate(checkpoint_path: &Path) -> Result<bool> {
        let path = Self::path_for(checkpoint_path);
        if path.exists() {
            fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn predict(
        checkpoint: &Checkpoint,
        dataset: &NliDataset,
        batch_size: usize,
        pad_id: i64,
    ) -> Result<Predictions> {
        let model = &checkpoint.model;
        model.expect_input_mode(InputMode::TokenIds)?;

        let mut class = Vec::with_capacity(dataset.len());
        let mut logits = Vec::with_capacity(dataset.len());
        tch::no_grad(|| -> Result<()> {
            for batch in dataset.batches(batch_size, pad_id, model.min_input_len(), model.device())
            {
                let output = model.forward(&batch.input_ids).to_kind(Kind::Float);
                class.extend(Vec::<i64>::try_from(&output.argmax(1, false))?);
                for row in 0..batch.len() as i64 {
                    logits.push(Vec::<f32>::try_from(&output.get(row))?);
                }
            }
            Ok(())
        })?;

        Ok(Predictions { class, logits })
    }
}
