//! Command-line interface definitions and argument parsing

use crate::config::{
    ClusterAlgorithm, ClusterSettings, ScalerKind, SegmentationConfig, DEFAULT_ARTIFACT_DIR,
};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;

/// Customer segmentation from transaction history
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding the trained artifact bundle
    #[arg(long, global = true, env = "SEGMENTFORGE_ARTIFACT_DIR", default_value = DEFAULT_ARTIFACT_DIR)]
    pub artifact_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fit the segmentation model on raw transactions and save the artifacts
    Train(TrainOptions),

    /// Predict the segment of a single customer
    Predict {
        /// Feature values as comma-separated name=value pairs
        /// Example: --features "Recency=10,Frequency=5,Monetary_Total=500"
        #[arg(short, long)]
        features: String,
    },

    /// Segment every customer of a CSV file (raw transactions or customer features)
    Batch {
        /// Path to the input CSV file
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the segmented customers as CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct TrainOptions {
    /// Path to the raw transaction CSV file
    #[arg(short, long, default_value = "data/raw/transactions.csv")]
    pub input: PathBuf,

    /// Scaler applied after log compression
    #[arg(long, value_enum, default_value_t = ScalerKind::Robust)]
    pub scaler: ScalerKind,

    /// Clustering algorithm
    #[arg(long, value_enum, default_value_t = ClusterAlgorithm::KMeans)]
    pub algorithm: ClusterAlgorithm,

    /// Random seed for cluster initialization
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Number of K-Means restarts
    #[arg(long, default_value = "10")]
    pub n_init: usize,

    /// Maximum iterations for the clustering algorithm
    #[arg(long, default_value = "300")]
    pub max_iters: usize,

    /// Tolerance for convergence
    #[arg(long, default_value = "1e-4")]
    pub tolerance: f64,
}

impl TrainOptions {
    pub fn to_config(&self, artifact_dir: PathBuf) -> SegmentationConfig {
        SegmentationConfig {
            artifact_dir,
            scaler: self.scaler,
            clustering: ClusterSettings {
                algorithm: self.algorithm,
                seed: self.seed,
                n_init: self.n_init,
                max_iters: self.max_iters,
                tolerance: self.tolerance,
            },
        }
    }
}

/// Parse feature values from a `name=value,name=value` string
pub fn parse_feature_pairs(input: &str) -> anyhow::Result<HashMap<String, f64>> {
    let mut features = HashMap::new();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Feature must be in format 'name=value': {}", pair))?;

        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", name.trim(), value))?;

        features.insert(name.trim().to_string(), value);
    }

    if features.is_empty() {
        anyhow::bail!("At least one feature value is required");
    }
    Ok(features)
}
