//! Canonical cluster ordering and segment names
//!
//! Clustering engines hand out labels in arbitrary order. After fitting,
//! clusters are renumbered by ascending spend so that canonical cluster 0 is
//! the lowest-value segment and cluster k-1 the highest. The renumbering is
//! baked into the model parameters, so predictions come out canonical.

use crate::error::SegmentError;
use crate::model::ClusterFit;
use ndarray::{ArrayView2, Axis};
use tracing::debug;

/// Segment names indexed by canonical cluster
pub const SEGMENTS: [&str; 5] = [
    "Murky",
    "At-Risk",
    "Potential Loyalists",
    "Loyal Customers",
    "VIPs",
];

/// Name reported for indices outside the catalog
pub const UNKNOWN_SEGMENT: &str = "Unknown";

/// Look up the segment name of a canonical cluster index
pub fn segment_name(cluster: usize) -> &'static str {
    SEGMENTS.get(cluster).copied().unwrap_or(UNKNOWN_SEGMENT)
}

/// Quantity clusters are ranked by
#[derive(Debug, Clone, Copy)]
pub enum SortBasis<'a> {
    /// Center coordinate on the monetary dimension
    Centers,
    /// Mean of the monetary dimension over the rows assigned to each cluster
    Assignments(ArrayView2<'a, f64>),
}

/// `lookup[original] = canonical`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRemap(Vec<usize>);

impl LabelRemap {
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &label)| i == label)
    }

    /// Canonical label for `label`, or `None` when it is not a known cluster
    pub fn apply(&self, label: usize) -> Option<usize> {
        self.0.get(label).copied()
    }
}

/// Renumber clusters by ascending value on the monetary dimension
///
/// Ties keep their relative order, so an already sorted model gets the
/// identity remap.
pub fn sort_by_value(
    mut fit: ClusterFit,
    basis: SortBasis<'_>,
    monetary_index: usize,
) -> crate::Result<(LabelRemap, ClusterFit)> {
    let centers = fit.model.centers();
    if monetary_index >= centers.ncols() {
        return Err(SegmentError::schema(format!(
            "monetary column index {monetary_index} out of range for {} features",
            centers.ncols()
        )));
    }

    let mut values: Vec<f64> = centers.column(monetary_index).to_vec();
    if let SortBasis::Assignments(features) = basis {
        if features.nrows() != fit.labels.len() || features.ncols() != centers.ncols() {
            return Err(SegmentError::data(
                "feature matrix does not match the fitted training rows",
            ));
        }
        let monetary = features.index_axis(Axis(1), monetary_index);
        let mut sums = vec![0.0; values.len()];
        let mut counts = vec![0usize; values.len()];
        for (&label, &value) in fit.labels.iter().zip(monetary.iter()) {
            sums[label] += value;
            counts[label] += 1;
        }
        // Empty clusters keep their center coordinate
        for (cluster, value) in values.iter_mut().enumerate() {
            if counts[cluster] > 0 {
                *value = sums[cluster] / counts[cluster] as f64;
            }
        }
    }

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut lookup = vec![0; order.len()];
    for (canonical, &original) in order.iter().enumerate() {
        lookup[original] = canonical;
    }

    fit.model.reorder(&order);
    fit.model.compose_remap(&lookup);
    fit.labels.mapv_inplace(|label| lookup[label]);

    debug!(?order, ?values, "clusters sorted by monetary value");
    Ok((LabelRemap(lookup), fit))
}
