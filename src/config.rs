//! Training and inference configuration

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of customer segments. Fixed for this domain.
pub const CLUSTER_COUNT: usize = 5;

/// Default location of the persisted artifact bundle
pub const DEFAULT_ARTIFACT_DIR: &str = "models";

/// Scaling step applied after the log1p compression
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ScalerKind {
    /// Median / interquartile range
    #[default]
    Robust,
    /// Mean / population standard deviation
    Standard,
}

/// Clustering engine used at training time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAlgorithm {
    #[default]
    #[serde(rename = "kmeans")]
    #[value(name = "kmeans")]
    KMeans,
    /// Gaussian mixture with a single covariance matrix shared by all components
    GaussianMixture,
}

/// Parameters of the clustering fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub algorithm: ClusterAlgorithm,
    pub seed: u64,
    /// Number of K-means restarts; the best inertia wins
    pub n_init: usize,
    pub max_iters: usize,
    pub tolerance: f64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            algorithm: ClusterAlgorithm::default(),
            seed: 42,
            n_init: 10,
            max_iters: 300,
            tolerance: 1e-4,
        }
    }
}

/// Full configuration of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Directory the artifact bundle is written to and read from
    pub artifact_dir: PathBuf,
    pub scaler: ScalerKind,
    pub clustering: ClusterSettings,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            scaler: ScalerKind::default(),
            clustering: ClusterSettings::default(),
        }
    }
}

impl SegmentationConfig {
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }
}
