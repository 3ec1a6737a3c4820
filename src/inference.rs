//! Scoring new customers with the persisted artifacts

use crate::artifacts::{ArtifactBundle, ArtifactStore};
use crate::data::{self, TableKind};
use crate::error::SegmentError;
use crate::labels::{segment_name, SEGMENTS};
use ndarray::Array2;
use polars::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Column holding the canonical cluster index in batch output
pub const CLUSTER_COLUMN: &str = "Cluster";
/// Column holding the segment name in batch output
pub const SEGMENT_COLUMN: &str = "Segment";

/// Read-only scorer over a loaded artifact bundle
///
/// Cloning is cheap and clones share the same bundle.
#[derive(Debug, Clone)]
pub struct InferenceService {
    bundle: Arc<ArtifactBundle>,
}

impl InferenceService {
    /// Load artifacts from `dir`
    pub fn load(dir: impl AsRef<Path>) -> crate::Result<Self> {
        let bundle = ArtifactStore::new(dir.as_ref()).load()?;
        Ok(Self {
            bundle: Arc::new(bundle),
        })
    }

    pub fn from_bundle(bundle: ArtifactBundle) -> crate::Result<Self> {
        bundle.validate()?;
        Ok(Self {
            bundle: Arc::new(bundle),
        })
    }

    pub fn bundle(&self) -> &ArtifactBundle {
        &self.bundle
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.bundle.feature_columns
    }

    /// Canonical cluster of a single customer
    ///
    /// Features missing from `features` count as 0; unknown keys are ignored.
    pub fn predict_cluster(&self, features: &HashMap<String, f64>) -> crate::Result<usize> {
        let columns = self.feature_columns();
        let mut row = Array2::zeros((1, columns.len()));
        for (j, name) in columns.iter().enumerate() {
            let value = features.get(name).copied().unwrap_or(0.0);
            if !value.is_finite() || value < 0.0 {
                return Err(SegmentError::data(format!(
                    "feature `{name}` has out-of-domain value {value}"
                )));
            }
            row[[0, j]] = value;
        }

        for name in features.keys().filter(|name| !columns.contains(name)) {
            debug!(feature = %name, "ignoring unknown feature");
        }

        let scaled = self.bundle.pipeline.transform(row.view())?;
        self.bundle.model.predict_row(scaled.row(0))
    }

    /// Segment name of a single customer
    pub fn predict_one(&self, features: &HashMap<String, f64>) -> crate::Result<&'static str> {
        self.predict_cluster(features).map(segment_name)
    }

    /// Score a table of raw transactions or aggregated customer features
    ///
    /// Raw input is aggregated first. The result is the customer table with
    /// `Cluster` and `Segment` columns appended.
    pub fn predict_batch(&self, table: &DataFrame) -> crate::Result<DataFrame> {
        let kind = data::classify(table)?;
        let mut customers = match kind {
            TableKind::RawTransactions => data::aggregate(table)?,
            TableKind::CustomerFeatures => table.clone(),
        };

        let raw = data::feature_matrix(&customers, self.feature_columns())?;
        let scaled = self.bundle.pipeline.transform(raw.view())?;
        let clusters = self.bundle.model.predict(scaled.view())?;

        let cluster_ids: Vec<u32> = clusters.iter().map(|&c| c as u32).collect();
        let segments: Vec<&str> = clusters.iter().map(|&c| segment_name(c)).collect();
        customers.with_column(Series::new(CLUSTER_COLUMN, cluster_ids))?;
        customers.with_column(Series::new(SEGMENT_COLUMN, segments))?;

        info!(?kind, customers = customers.height(), "scored batch");
        Ok(customers)
    }
}

/// Customers per segment in a scored table, in catalog order
///
/// Segments with no customers are listed with a count of 0.
pub fn segment_distribution(scored: &DataFrame) -> crate::Result<Vec<(String, usize)>> {
    let column = scored
        .column(SEGMENT_COLUMN)
        .map_err(|_| SegmentError::schema(format!("missing `{SEGMENT_COLUMN}` column")))?;

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for segment in column.str()?.into_iter().flatten() {
        *counts.entry(segment).or_default() += 1;
    }

    let mut distribution: Vec<(String, usize)> = SEGMENTS
        .iter()
        .map(|&name| (name.to_string(), counts.remove(name).unwrap_or(0)))
        .collect();
    let mut others: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    others.sort();
    distribution.extend(others);
    Ok(distribution)
}
