//! Training: aggregate, preprocess, cluster, sort, persist

use crate::artifacts::{ArtifactBundle, ArtifactStore};
use crate::config::{SegmentationConfig, CLUSTER_COUNT};
use crate::data::{self, MONETARY_TOTAL};
use crate::error::SegmentError;
use crate::labels::{segment_name, sort_by_value, SortBasis};
use crate::pipeline::PreprocessingPipeline;
use crate::model::fit_clusters;
use polars::prelude::DataFrame;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// Rows used for the silhouette diagnostic
const SILHOUETTE_SAMPLE: usize = 1000;

/// Summary of a completed training run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub customers: usize,
    /// Customers per canonical cluster
    pub cluster_sizes: Vec<usize>,
    pub inertia: f64,
    pub silhouette: f64,
    pub bundle_path: PathBuf,
}

impl TrainingReport {
    /// `(segment name, customers)` in canonical order
    pub fn segment_sizes(&self) -> Vec<(&'static str, usize)> {
        self.cluster_sizes
            .iter()
            .enumerate()
            .map(|(cluster, &size)| (segment_name(cluster), size))
            .collect()
    }
}

/// Load raw transactions from CSV and train on them
pub fn train_from_csv(
    path: impl AsRef<Path>,
    config: &SegmentationConfig,
) -> crate::Result<TrainingReport> {
    let transactions = data::load_csv(path)?;
    train(&transactions, config)
}

/// Fit the full pipeline on raw transactions and persist the artifact bundle
///
/// The bundle is only written once every step has succeeded.
pub fn train(
    transactions: &DataFrame,
    config: &SegmentationConfig,
) -> crate::Result<TrainingReport> {
    let start_time = Instant::now();
    info!(rows = transactions.height(), "starting training");

    let customers = data::aggregate(transactions)?;
    let feature_columns = data::feature_names();
    let raw = data::feature_matrix(&customers, &feature_columns)?;
    info!(customers = raw.nrows(), "aggregated customer features");

    let pipeline = PreprocessingPipeline::new(config.scaler).fit(raw.view())?;
    let scaled = pipeline.transform(raw.view())?;

    let fit = fit_clusters(scaled.view(), CLUSTER_COUNT, &config.clustering)?;

    let monetary_index = feature_columns
        .iter()
        .position(|name| name == MONETARY_TOTAL)
        .ok_or_else(|| SegmentError::schema(format!("missing feature `{MONETARY_TOTAL}`")))?;
    let (remap, fit) = sort_by_value(fit, SortBasis::Centers, monetary_index)?;
    info!(remap = ?remap.as_slice(), "clusters sorted by monetary value");

    let cluster_sizes = fit.cluster_sizes();
    let silhouette = fit.silhouette_sample(scaled.view(), SILHOUETTE_SAMPLE);
    let inertia = fit.inertia;

    let bundle = ArtifactBundle::new(feature_columns, pipeline, fit.model, config.clustering.seed);
    let bundle_path = ArtifactStore::new(&config.artifact_dir).save(&bundle)?;

    info!(
        elapsed_secs = start_time.elapsed().as_secs_f64(),
        inertia,
        silhouette,
        "training complete"
    );

    Ok(TrainingReport {
        customers: raw.nrows(),
        cluster_sizes,
        inertia,
        silhouette,
        bundle_path,
    })
}
