//! High-level pipeline assembling tokenizer, dataset, checkpoints and
//! attribution strategies.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tch::{Device, Tensor};
use tracing::{debug, info};

use crate::core::{
    aggregation::Aggregation,
    attribution::{AttributionMethod, Attributor},
    checkpoint::Checkpoint,
    config::SaliencyConfig,
    dataset::{Batch, NliDataset},
    model::{CnnClassifier, InterpretableEmbedding},
    predictions::PredictionCache,
    serialize::{AttributionRecord, AttributionWriter},
    tokenizer::NliTokenizer,
};
use crate::{Result, SaliencyError};

/// Generates attribution files for single checkpoints over a loaded split.
pub struct SaliencyGenerator {
    config: SaliencyConfig,
    tokenizer: NliTokenizer,
    dataset: NliDataset,
    device: Device,
}

impl SaliencyGenerator {
    /// Seeds the RNG, builds the tokenizer and loads the configured split.
    pub fn new(config: SaliencyConfig) -> Result<Self> {
        config.validate()?;
        seed_everything(config.seed, config.device());
        let tokenizer =
            NliTokenizer::from_source(&config.tokenizer, config.lower_case, config.max_length)?;
        let dataset = NliDataset::load(&config.dataset_dir, config.split, &tokenizer)?;
        Ok(Self::from_parts(config, tokenizer, dataset))
    }

    /// Assembles a generator from already loaded parts.
    pub fn from_parts(config: SaliencyConfig, tokenizer: NliTokenizer, dataset: NliDataset) -> Self {
        let device = config.device();
        SaliencyGenerator {
            config,
            tokenizer,
            dataset,
            device,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SaliencyConfig {
        &self.config
    }

    pub fn dataset(&self) -> &NliDataset {
        &self.dataset
    }

    pub fn tokenizer(&self) -> &NliTokenizer {
        &self.tokenizer
    }

    /// Attributes every instance of the split for every class of the
    /// checkpoint and writes one JSON line per instance to `output_path`.
    ///
    /// # Arguments
    /// * `checkpoint_path` - checkpoint directory; its prediction cache is
    ///   written next to it on first use
    /// * `output_path` - attribution file, overwritten
    /// * `method` - attribution strategy
    /// * `aggregation` - reduction to one score per token
    ///
    /// # Returns
    /// Seconds spent per instance, one sample per batch
    pub fn generate(
        &self,
        checkpoint_path: &Path,
        output_path: &Path,
        method: AttributionMethod,
        aggregation: Aggregation,
    ) -> Result<Vec<f64>> {
        if method.is_gradient_based() != aggregation.accepts_embedding_attributions() {
            return Err(SaliencyError::Config(format!(
                "aggregation '{}' cannot reduce '{}' attributions",
                aggregation, method
            )));
        }

        let pad_id = self.tokenizer.pad_id();
        let mut checkpoint = Checkpoint::load(checkpoint_path, pad_id, self.device)?;
        let vocab_size = checkpoint.model.args().vocab_size;
        if let Some(max_id) = self.dataset.max_token_id() {
            if max_id >= vocab_size {
                return Err(SaliencyError::Checkpoint(format!(
                    "token id {} outside the model vocabulary of {} entries",
                    max_id, vocab_size
                )));
            }
        }
        let batch_size = self
            .config
            .batch_size
            .unwrap_or(checkpoint.model.args().batch_size);

        PredictionCache::ensure(&checkpoint, &self.dataset, batch_size, pad_id)?;

        info!(
            "Running {} / {} on '{}'",
            method,
            aggregation,
            checkpoint_path.display()
        );
        let mut writer = AttributionWriter::create(output_path)?;
        let samples = self.attribute_model(
            &mut checkpoint.model,
            method,
            aggregation,
            batch_size,
            &mut writer,
        )?;

        info!(
            "Wrote {} records to '{}' ({:.6}s per instance)",
            writer.written(),
            output_path.display(),
            mean(&samples)
        );
        Ok(samples)
    }

    /// Runs `method` over the split with `model`. Gradient methods run with
    /// the interpretable embedding installed, and the model is back in token
    /// id mode when this returns, whether or not attribution failed.
    fn attribute_model(
        &self,
        model: &mut CnnClassifier,
        method: AttributionMethod,
        aggregation: Aggregation,
        batch_size: usize,
        writer: &mut AttributionWriter,
    ) -> Result<Vec<f64>> {
        let attributor = method.attributor(self.config.sliding_window, self.tokenizer.pad_id());
        if method.is_gradient_based() {
            let adapter = InterpretableEmbedding::install(model);
            let samples = self.attribute_split(
                adapter.model(),
                Some(&adapter),
                attributor.as_ref(),
                aggregation,
                batch_size,
                writer,
            )?;
            Ok(samples)
        } else {
            self.attribute_split(
                model,
                None,
                attributor.as_ref(),
                aggregation,
                batch_size,
                writer,
            )
        }
    }

    fn attribute_split(
        &self,
        model: &CnnClassifier,
        adapter: Option<&InterpretableEmbedding<'_>>,
        attributor: &dyn Attributor,
        aggregation: Aggregation,
        batch_size: usize,
        writer: &mut AttributionWriter,
    ) -> Result<Vec<f64>> {
        let pad_id = self.tokenizer.pad_id();
        let mut samples = Vec::new();

        for batch in self
            .dataset
            .batches(batch_size, pad_id, model.min_input_len(), model.device())
        {
            let embeddings =
                adapter.map(|adapter| adapter.indices_to_embeddings(&batch.input_ids).detach());
            let inputs = embeddings.as_ref().unwrap_or(&batch.input_ids);

            let start = Instant::now();
            let reference = embeddings
                .as_ref()
                .filter(|_| aggregation.requires_embeddings());
            let scores = attribute_batch(model, attributor, aggregation, &batch, inputs, reference)?;
            let elapsed = start.elapsed().as_secs_f64();
            samples.push(elapsed / batch.len() as f64);
            debug!(
                "Batch at {} ({} instances) took {:.4}s",
                batch.start,
                batch.len(),
                elapsed
            );

            for (offset, class_scores) in scores.iter().enumerate() {
                let instance = &self.dataset.instances()[batch.start + offset];
                let tokens = instance
                    .token_ids
                    .iter()
                    .map(|&id| self.tokenizer.id_to_token(id))
                    .collect::<Result<Vec<_>>>()?;
                writer.write_record(&AttributionRecord::from_class_scores(tokens, class_scores))?;
            }
        }

        Ok(samples)
    }
}

/// Scores of every instance of `batch`, as `[instance][class][position]`
/// trimmed to each instance's real length.
fn attribute_batch(
    model: &CnnClassifier,
    attributor: &dyn Attributor,
    aggregation: Aggregation,
    batch: &Batch,
    inputs: &Tensor,
    embeddings: Option<&Tensor>,
) -> Result<Vec<Vec<Vec<f32>>>> {
    let mut scores = vec![Vec::with_capacity(model.num_labels() as usize); batch.len()];
    for target in 0..model.num_labels() {
        let raw = attributor.attribute(model, inputs, target)?;
        let summary = aggregation
            .summarize(&raw, embeddings, &batch.mask)?
            .detach()
            .to_device(Device::Cpu);
        for (offset, &length) in batch.lengths.iter().enumerate() {
            let row = summary.get(offset as i64).narrow(0, 0, length as i64);
            scores[offset].push(Vec::<f32>::try_from(&row)?);
        }
    }
    Ok(scores)
}

/// Throughput of one (method, aggregation, model family) combination.
///
/// Statistics cover the replicates of `models_dir` only. Timings of other
/// model directories run with the same method and aggregation are not
/// accumulated into it.
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputSummary {
    pub method: AttributionMethod,
    pub aggregation: Aggregation,
    pub models_dir: PathBuf,
    /// Mean over replicates of the per-instance seconds
    pub mean: f64,
    /// Population standard deviation over replicates
    pub std: f64,
}

impl ThroughputSummary {
    /// Summarizes the mean per-instance seconds of each replicate of one
    /// model directory.
    pub fn from_replicates(
        method: AttributionMethod,
        aggregation: Aggregation,
        models_dir: &Path,
        replicate_means: &[f64],
    ) -> Self {
        ThroughputSummary {
            method,
            aggregation,
            models_dir: models_dir.to_path_buf(),
            mean: mean(replicate_means),
            std: std_dev(replicate_means),
        }
    }
}

/// Runs every configured method, aggregation, model family and replicate.
pub struct SaliencySweep {
    generator: SaliencyGenerator,
}

impl SaliencySweep {
    pub fn new(config: SaliencyConfig) -> Result<Self> {
        Ok(Self::from_generator(SaliencyGenerator::new(config)?))
    }

    pub fn from_generator(generator: SaliencyGenerator) -> Self {
        SaliencySweep { generator }
    }

    pub fn generator(&self) -> &SaliencyGenerator {
        &self.generator
    }

    pub fn run(&self) -> Result<Vec<ThroughputSummary>> {
        let config = self.generator.config();
        let mut summaries = Vec::new();

        for &method in &config.methods {
            info!("Running saliency {}", method);
            for aggregation in config.aggregations_for(method) {
                info!("Running aggregation {}", aggregation);
                for group in &config.models {
                    let mut replicate_means = Vec::with_capacity(config.replicates);
                    for replicate in 1..=config.replicates {
                        let samples = self.generator.generate(
                            &group.checkpoint_path(replicate),
                            &group.output_path(replicate, method, aggregation),
                            method,
                            aggregation,
                        )?;
                        replicate_means.push(mean(&samples));
                    }

                    let summary = ThroughputSummary::from_replicates(
                        method,
                        aggregation,
                        &group.models_dir,
                        &replicate_means,
                    );
                    info!(
                        "Throughput {} / {} on '{}': {:.6}s +- {:.6}s per instance",
                        method,
                        aggregation,
                        group.models_dir.display(),
                        summary.mean,
                        summary.std
                    );
                    summaries.push(summary);
                }
            }
        }

        Ok(summaries)
    }
}

/// Seeds the torch RNGs. On CUDA every device is seeded and cuDNN is
/// disabled, so convolutions use the deterministic native kernels.
fn seed_everything(seed: i64, device: Device) {
    tch::manual_seed(seed);
    if device.is_cuda() {
        tch::Cuda::manual_seed_all(seed as u64);
        tch::Cuda::cudnn_set_benchmark(false);
        tch::Cuda::set_user_enabled_cudnn(false);
        debug!("Seeded CUDA devices with {}, cuDNN disabled", seed);
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = mean(values);
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ModelGroup, SaliencyConfigBuilder};
    use crate::core::dataset::NliInstance;
    use crate::core::model::tests::tiny_args;
    use crate::core::model::InputMode;
    use crate::core::tokenizer::tests::write_vocab;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        generator: SaliencyGenerator,
    }

    fn fixture(methods: Vec<AttributionMethod>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let vocab = write_vocab(&root);

        tch::manual_seed(31);
        for replicate in 1..=2 {
            let model = CnnClassifier::new(&tiny_args(), 0, Device::Cpu).unwrap();
            Checkpoint::save(&model, root.join(format!("models/cnn_{}", replicate))).unwrap();
        }

        let config = SaliencyConfigBuilder::new()
            .models(vec![ModelGroup::new(root.join("models/cnn"), root.join("out"))])
            .replicates(2)
            .methods(methods)
            .vocab_path(&vocab)
            .batch_size(2)
            .build()
            .unwrap();
        let tokenizer = NliTokenizer::from_vocab_file(&vocab, true, 512).unwrap();
        let dataset = NliDataset::from_instances(vec![
            NliInstance {
                token_ids: vec![2, 7, 3],
                label: 0,
            },
            NliInstance {
                token_ids: vec![2, 6, 7, 3, 8, 3],
                label: 1,
            },
            NliInstance {
                token_ids: vec![2, 8, 12, 13, 3],
                label: 2,
            },
        ]);

        Fixture {
            _dir: dir,
            root,
            generator: SaliencyGenerator::from_parts(config, tokenizer, dataset),
        }
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_occlusion_records_match_instances() {
        let fixture = fixture(vec![AttributionMethod::Occlusion]);
        let output = fixture.root.join("out/occ");

        let samples = fixture
            .generator
            .generate(
                &fixture.root.join("models/cnn_1"),
                &output,
                AttributionMethod::Occlusion,
                Aggregation::None,
            )
            .unwrap();

        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| *s >= 0.0));
        let records = read_lines(&output);
        assert_eq!(records.len(), 3);
        let first = records[0]["tokens"].as_array().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0]["token"], "[CLS]");
        assert_eq!(first[1]["token"], "cat");
        for token in first {
            for class in ["0", "1", "2"] {
                assert!(token[class].is_number());
            }
        }
        assert_eq!(records[1]["tokens"].as_array().unwrap().len(), 6);
        assert!(PredictionCache::path_for(&fixture.root.join("models/cnn_1")).exists());
    }

    #[test]
    fn test_mean_scores_have_unit_norm() {
        let fixture = fixture(vec![AttributionMethod::Saliency]);
        let output = fixture.root.join("out/sal_mean");

        fixture
            .generator
            .generate(
                &fixture.root.join("models/cnn_2"),
                &output,
                AttributionMethod::Saliency,
                Aggregation::Mean,
            )
            .unwrap();

        for record in read_lines(&output) {
            for class in ["0", "1", "2"] {
                let norm: f64 = record["tokens"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|token| token[class].as_f64().unwrap().powi(2))
                    .sum::<f64>()
                    .sqrt();
                assert!((norm - 1.0).abs() < 1e-4, "norm {}", norm);
            }
        }
    }

    #[test]
    fn test_mismatched_aggregation_is_rejected() {
        let fixture = fixture(vec![AttributionMethod::Occlusion]);
        let checkpoint = fixture.root.join("models/cnn_1");

        let occlusion_mean = fixture.generator.generate(
            &checkpoint,
            &fixture.root.join("out/x"),
            AttributionMethod::Occlusion,
            Aggregation::Mean,
        );
        let saliency_none = fixture.generator.generate(
            &checkpoint,
            &fixture.root.join("out/y"),
            AttributionMethod::Saliency,
            Aggregation::None,
        );

        assert!(matches!(occlusion_mean, Err(SaliencyError::Config(_))));
        assert!(matches!(saliency_none, Err(SaliencyError::Config(_))));
    }

    #[test]
    fn test_runs_are_deterministic() {
        let fixture = fixture(vec![AttributionMethod::GuidedBackprop]);
        let checkpoint = fixture.root.join("models/cnn_1");
        let first = fixture.root.join("out/a");
        let second = fixture.root.join("out/b");

        for output in [&first, &second] {
            fixture
                .generator
                .generate(
                    &checkpoint,
                    output,
                    AttributionMethod::GuidedBackprop,
                    Aggregation::L2,
                )
                .unwrap();
        }

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn test_failed_gradient_run_restores_token_mode() {
        let fixture = fixture(vec![AttributionMethod::Saliency]);
        let mut checkpoint =
            Checkpoint::load(&fixture.root.join("models/cnn_1"), 0, Device::Cpu).unwrap();
        let mut writer = AttributionWriter::create(&fixture.root.join("out/failed")).unwrap();

        // per-embedding attributions cannot be reduced with 'none'
        let result = fixture.generator.attribute_model(
            &mut checkpoint.model,
            AttributionMethod::Saliency,
            Aggregation::None,
            2,
            &mut writer,
        );

        assert!(matches!(result, Err(SaliencyError::Config(_))));
        assert_eq!(checkpoint.model.input_mode(), InputMode::TokenIds);
        let samples = fixture
            .generator
            .attribute_model(
                &mut checkpoint.model,
                AttributionMethod::Occlusion,
                Aggregation::None,
                2,
                &mut writer,
            )
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(checkpoint.model.input_mode(), InputMode::TokenIds);
    }

    #[test]
    fn test_sweep_writes_every_combination() {
        let fixture = fixture(vec![
            AttributionMethod::Saliency,
            AttributionMethod::Occlusion,
        ]);
        let sweep = SaliencySweep::from_generator(fixture.generator);

        let summaries = sweep.run().unwrap();

        // sal x {mean, l2} + occlusion x {none}, one model family
        assert_eq!(summaries.len(), 3);
        for (method, aggregation) in [("sal", "mean"), ("sal", "l2"), ("occlusion", "none")] {
            for replicate in 1..=2 {
                let path = fixture
                    .root
                    .join("out")
                    .join(format!("cnn_{}_{}_{}", replicate, method, aggregation));
                assert_eq!(read_lines(&path).len(), 3, "{}", path.display());
            }
        }
        assert!(summaries.iter().all(|s| s.mean >= 0.0 && s.std >= 0.0));
    }

    #[test]
    fn test_vocabulary_mismatch_is_rejected() {
        let fixture = fixture(vec![AttributionMethod::Occlusion]);
        let config = fixture.generator.config().clone();
        let tokenizer =
            NliTokenizer::from_vocab_file(&fixture.root.join("vocab.txt"), true, 512).unwrap();
        let generator = SaliencyGenerator::from_parts(
            config,
            tokenizer,
            NliDataset::from_instances(vec![NliInstance {
                token_ids: vec![2, 15, 3],
                label: 0,
            }]),
        );

        let result = generator.generate(
            &fixture.root.join("models/cnn_1"),
            &fixture.root.join("out/z"),
            AttributionMethod::Occlusion,
            Aggregation::None,
        );

        assert!(matches!(result, Err(SaliencyError::Checkpoint(_))));
    }

    #[test]
    fn test_mean_and_std() {
        assert_eq!(mean(&[]), 0.0);
        assert!((mean(&[1.0, 2.0, 3.0]) - 2.0).abs() < 1e-12);
        assert!((std_dev(&[1.0, 3.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_throughput_summary_covers_one_directory() {
        let cnn = ThroughputSummary::from_replicates(
            AttributionMethod::Saliency,
            Aggregation::Mean,
            Path::new("models/cnn"),
            &[0.25, 0.75],
        );
        let lstm = ThroughputSummary::from_replicates(
            AttributionMethod::Saliency,
            Aggregation::Mean,
            Path::new("models/lstm"),
            &[2.0, 2.0, 2.0],
        );

        assert_eq!(cnn.models_dir, PathBuf::from("models/cnn"));
        assert!((cnn.mean - 0.5).abs() < 1e-12);
        assert!((cnn.std - 0.25).abs() < 1e-12);
        assert!((lstm.mean - 2.0).abs() < 1e-12);
        assert_eq!(lstm.std, 0.0);
    }

    #[test]
    fn test_seed_everything_repeats_random_draws() {
        seed_everything(5, Device::Cpu);
        let first = Tensor::randn([4, 3], (tch::Kind::Float, Device::Cpu));
        seed_everything(5, Device::Cpu);
        let second = Tensor::randn([4, 3], (tch::Kind::Float, Device::Cpu));

        assert_eq!(first, second);
    }
}
