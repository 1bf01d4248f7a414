use anyhow::Result;

use crate::cli::AttributeArgs;
use crate::core::{
    Aggregation, AttributionMethod, ModelGroup, SaliencyConfigBuilder, SaliencyGenerator,
    TokenizerSource,
};

/// Attributes a single checkpoint and prints the mean seconds per instance.
///
/// # Arguments
/// `args` - The CLI arguments structure containing:
///  - `checkpoint`: checkpoint directory to attribute.
///  - `output`: attribution file to write.
///  - `method` / `aggregation`: the combination to run.
///  - `dataset_dir` / `split`: where the e-SNLI CSV files are.
///  - `tokenizer`: pretrained name or local vocabulary.
pub fn cmd_attribute(args: AttributeArgs) -> Result<()> {
    let method: AttributionMethod = args.method.into();
    let aggregation: Aggregation = args.aggregation.into();

    let mut builder = SaliencyConfigBuilder::new()
        .dataset(&args.dataset_dir, args.split.into())
        .models(vec![ModelGroup::new(
            &args.checkpoint,
            args.output.parent().unwrap_or(args.output.as_path()),
        )])
        .replicates(1)
        .methods(vec![method])
        .sliding_window(args.sliding_window)
        .seed(args.seed)
        .gpu(args.gpu);
    if let Some(batch_size) = args.batch_size {
        builder = builder.batch_size(batch_size);
    }
    builder.config.tokenizer = TokenizerSource {
        pretrained: args.tokenizer.pretrained,
        vocab: args.tokenizer.vocab,
    };
    if method.is_gradient_based() {
        builder = builder.gradient_aggregations(vec![aggregation]);
    }
    let config = builder.build()?;

    let generator = SaliencyGenerator::new(config)?;
    let samples = generator.generate(&args.checkpoint, &args.output, method, aggregation)?;

    let mean = samples.iter().sum::<f64>() / samples.len().max(1) as f64;
    println!("{:.6} s per instance over {} batches", mean, samples.len());
    Ok(())
}
