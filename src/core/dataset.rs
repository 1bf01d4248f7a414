//! e-SNLI loading and padded batch iteration.

use std::path::Path;

use serde::Deserialize;
use tch::{Device, Kind, Tensor};
use tracing::{info, warn};

use super::config::Split;
use super::tokenizer::NliTokenizer;
use crate::{Result, SaliencyError};

/// Gold label names and their class indices.
pub const LABELS: [(&str, i64); 3] = [("entailment", 0), ("neutral", 1), ("contradiction", 2)];

/// Pairs tokenized per call to the tokenizer while loading.
const ENCODE_CHUNK: usize = 1024;

/// One tokenized premise/hypothesis pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NliInstance {
    /// `[CLS] premise [SEP] hypothesis [SEP]` token ids, unpadded
    pub token_ids: Vec<i64>,
    /// Gold class index
    pub label: i64,
}

/// The columns of an e-SNLI CSV row we read; the rest are ignored.
#[derive(Debug, Deserialize)]
struct EsnliRow {
    gold_label: String,
    #[serde(rename = "Sentence1")]
    premise: String,
    #[serde(rename = "Sentence2")]
    hypothesis: String,
}

fn label_index(name: &str) -> Option<i64> {
    LABELS
        .iter()
        .find(|(label, _)| *label == name)
        .map(|&(_, index)| index)
}

/// Evaluation split held in memory, in file order.
#[derive(Debug, Clone, Default)]
pub struct NliDataset {
    instances: Vec<NliInstance>,
}

impl NliDataset {
    pub fn from_instances(instances: Vec<NliInstance>) -> Self {
        Self { instances }
    }

    /// Reads and tokenizes every CSV file of `split` under `dataset_dir`.
    pub fn load(dataset_dir: &Path, split: Split, tokenizer: &NliTokenizer) -> Result<Self> {
        let mut instances = Vec::new();
        for file in split.files() {
            let path = dataset_dir.join(file);
            let reader = csv::Reader::from_path(&path).map_err(|e| {
                SaliencyError::Dataset(format!("cannot open '{}': {}", path.display(), e))
            })?;
            instances.extend(Self::read_instances(reader, tokenizer)?);
        }
        if instances.is_empty() {
            return Err(SaliencyError::Dataset(format!(
                "split '{}' in '{}' has no labelled instances",
                split,
                dataset_dir.display()
            )));
        }
        info!("Loaded {} {} instances", instances.len(), split);
        Ok(Self { instances })
    }

    fn read_instances<R: std::io::Read>(
        mut reader: csv::Reader<R>,
        tokenizer: &NliTokenizer,
    ) -> Result<Vec<NliInstance>> {
        let mut rows = Vec::new();
        for (line, row) in reader.deserialize::<EsnliRow>().enumerate() {
            let row = row?;
            match label_index(row.gold_label.trim()) {
                Some(label) => rows.push((row, label)),
                None => warn!(
                    "Skipping row {} with unknown label '{}'",
                    line + 1,
                    row.gold_label
                ),
            }
        }

        let mut instances = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(ENCODE_CHUNK) {
            let pairs: Vec<(&str, &str)> = chunk
                .iter()
                .map(|(row, _)| (row.premise.as_str(), row.hypothesis.as_str()))
                .collect();
            let encoded = tokenizer.encode_pairs(&pairs);
            instances.extend(
                encoded
                    .into_iter()
                    .zip(chunk)
                    .map(|(token_ids, &(_, label))| NliInstance { token_ids, label }),
            );
        }
        Ok(instances)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[NliInstance] {
        &self.instances
    }

    /// Largest token id in the split, to check it against a model vocabulary.
    pub fn max_token_id(&self) -> Option<i64> {
        self.instances
            .iter()
            .flat_map(|instance| instance.token_ids.iter().copied())
            .max()
    }

    /// Iterates over padded batches in dataset order.
    ///
    /// # Arguments
    /// * `batch_size` - instances per batch (the last one may be smaller)
    /// * `pad_id` - id filling positions past each instance's length
    /// * `min_len` - batches are padded to at least this many positions
    /// * `device` - device the batch tensors are created on
    pub fn batches(
        &self,
        batch_size: usize,
        pad_id: i64,
        min_len: usize,
        device: Device,
    ) -> Batches<'_> {
        Batches {
            instances: &self.instances,
            next: 0,
            batch_size: batch_size.max(1),
            pad_id,
            min_len,
            device,
        }
    }
}

/// A padded slice of the dataset.
pub struct Batch {
    /// Index of the first instance of the batch in the dataset
    pub start: usize,
    /// `(batch, tokens)` int64 token ids
    pub input_ids: Tensor,
    /// `(batch, tokens)` float mask, 1 for real tokens
    pub mask: Tensor,
    /// Real length of each instance
    pub lengths: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }
}

/// Iterator over the batches of an [`NliDataset`].
pub struct Batches<'a> {
    instances: &'a [NliInstance],
    next: usize,
    batch_size: usize,
    pad_id: i64,
    min_len: usize,
    device: Device,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.next >= self.instances.len() {
            return None;
        }
        let start = self.next;
        let end = (start + self.batch_size).min(self.instances.len());
        self.next = end;
        Some(collate(
            start,
            &self.instances[start..end],
            self.pad_id,
            self.min_len,
            self.device,
        ))
    }
}

/// Pads a vector to ensure it has at least `target_len` elements, using `pad_value`.
/// If the vector is already longer than `target_len`, it remains unchanged.
#[inline(always)]
fn pad_vec<T: Clone>(vec: &[T], pad_value: T, target_len: usize) -> Vec<T> {
    let mut padded = vec.to_owned();
    if padded.len() < target_len {
        padded.resize(target_len, pad_value);
    }
    padded
}

/// Converts a list of equal-length vectors into a single batched tensor on the specified device.
#[inline(always)]
fn to_batched_tensor<T: Copy + tch::kind::Element>(vecs: &[Vec<T>], device: Device) -> Tensor {
    Tensor::stack(
        &vecs
            .iter()
            .map(|v| Tensor::from_slice(v))
            .collect::<Vec<_>>(),
        0,
    )
    .to_device(device)
}

fn collate(
    start: usize,
    instances: &[NliInstance],
    pad_id: i64,
    min_len: usize,
    device: Device,
) -> Batch {
    let max_len = instances
        .iter()
        .map(|instance| instance.token_ids.len())
        .max()
        .unwrap_or(0)
        .max(min_len);

    let mut id_batches = Vec::with_capacity(instances.len());
    let mut mask_batches = Vec::with_capacity(instances.len());
    let mut lengths = Vec::with_capacity(instances.len());
    for instance in instances {
        let seq_len = instance.token_ids.len();
        id_batches.push(pad_vec(&instance.token_ids, pad_id, max_len));
        mask_batches.push(pad_vec(&vec![1.0f32; seq_len], 0.0, max_len));
        lengths.push(seq_len);
    }

    Batch {
        start,
        input_ids: to_batched_tensor(&id_batches, device),
        mask: to_batched_tensor(&mask_batches, device).to_kind(Kind::Float),
        lengths,
    }
}
