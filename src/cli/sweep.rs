use anyhow::{Context, Result};

use crate::cli::SweepArgs;
use crate::core::{SaliencyConfig, SaliencySweep};

/// Runs the full method x aggregation x model x replicate sweep described by
/// a JSON configuration and prints a throughput table.
pub fn cmd_sweep(args: SweepArgs) -> Result<()> {
    let mut config = SaliencyConfig::from_file(&args.config)
        .with_context(|| format!("loading '{}'", args.config.display()))?;
    if args.gpu {
        config.gpu = true;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let summaries = SaliencySweep::new(config)?.run()?;
    for summary in &summaries {
        println!(
            "{}\t{}\t{}\t{:.6}\t{:.6}",
            summary.method,
            summary.aggregation,
            summary.models_dir.display(),
            summary.mean,
            summary.std
        );
    }

    Ok(())
}
