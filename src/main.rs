//! SegmentForge: customer segmentation CLI
//!
//! Trains the segmentation model from raw transactions and scores single
//! customers or whole tables with the saved artifacts.

use anyhow::{Context, Result};
use clap::Parser;
use segmentforge::cli::{parse_feature_pairs, Args, Command, TrainOptions};
use segmentforge::inference::{segment_distribution, InferenceService};
use segmentforge::{data, train};
use std::path::Path;
use std::time::Instant;
use tracing::Level;

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    match &args.command {
        Command::Train(options) => run_training(&args, options),
        Command::Predict { features } => run_prediction(&args, features),
        Command::Batch { input, output } => run_batch(&args, input, output.as_deref()),
    }
}

fn run_training(args: &Args, options: &TrainOptions) -> Result<()> {
    println!("=== Training ===\n");
    let config = options.to_config(args.artifact_dir.clone());
    let start_time = Instant::now();

    let report = train::train_from_csv(&options.input, &config)
        .with_context(|| format!("training on {} failed", options.input.display()))?;

    println!("✓ Model fitted on {} customers", report.customers);
    println!("\n=== Segment Sizes ===");
    for (segment, size) in report.segment_sizes() {
        let percentage = (size as f64 / report.customers as f64) * 100.0;
        println!("{segment}: {size} customers ({percentage:.1}%)");
    }
    println!("\nSilhouette score (sample): {:.3}", report.silhouette);
    println!("Within-cluster sum of squares: {:.2}", report.inertia);
    println!("\nArtifacts saved to: {}", report.bundle_path.display());
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}

fn run_prediction(args: &Args, features: &str) -> Result<()> {
    let features = parse_feature_pairs(features)?;
    let service = InferenceService::load(&args.artifact_dir)?;

    let cluster = service.predict_cluster(&features)?;
    let segment = segmentforge::labels::segment_name(cluster);
    println!("✓ Predicted Segment: {segment} (cluster {cluster})");
    Ok(())
}

fn run_batch(args: &Args, input: &Path, output: Option<&Path>) -> Result<()> {
    let service = InferenceService::load(&args.artifact_dir)?;
    let table = data::load_csv(input)?;
    let mut scored = service.predict_batch(&table)?;

    println!("✓ Segmented {} customers\n", scored.height());
    println!("=== Segment Distribution ===");
    for (segment, count) in segment_distribution(&scored)? {
        println!("{segment}: {count}");
    }

    match output {
        Some(path) => {
            data::write_csv(&mut scored, path)?;
            println!("\nSegmented customers saved to: {}", path.display());
        }
        None => println!("\n{}", scored.head(Some(10))),
    }
    Ok(())
}
