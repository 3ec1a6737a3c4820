//! Log-compression and scaling applied before clustering
//!
//! The pipeline is fit once on the training features. Afterwards its
//! parameters are frozen: [`FittedPipeline::transform`] never looks at the
//! distribution of the data it is given.

use crate::config::ScalerKind;
use crate::error::SegmentError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Unfitted transform chain: `log1p` followed by a scaler
#[derive(Debug, Clone, Copy, Default)]
pub struct PreprocessingPipeline {
    scaler: ScalerKind,
}

/// Frozen transform: `(log1p(x) - center) / scale`, column-wise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPipeline {
    scaler: ScalerKind,
    center: Array1<f64>,
    scale: Array1<f64>,
}

impl PreprocessingPipeline {
    pub fn new(scaler: ScalerKind) -> Self {
        Self { scaler }
    }

    /// Estimate scaler parameters from the log-compressed features
    pub fn fit(&self, features: ArrayView2<f64>) -> crate::Result<FittedPipeline> {
        if features.nrows() == 0 || features.ncols() == 0 {
            return Err(SegmentError::data(
                "cannot fit preprocessing on an empty feature matrix",
            ));
        }

        let compressed = log1p(features)?;
        let mut center = Array1::zeros(compressed.ncols());
        let mut scale = Array1::ones(compressed.ncols());

        for (j, column) in compressed.axis_iter(Axis(1)).enumerate() {
            let (c, s) = match self.scaler {
                ScalerKind::Robust => robust_parameters(column),
                ScalerKind::Standard => standard_parameters(column),
            };
            center[j] = c;
            // Constant columns pass through unscaled
            scale[j] = if s == 0.0 { 1.0 } else { s };
        }

        Ok(FittedPipeline {
            scaler: self.scaler,
            center,
            scale,
        })
    }
}

impl FittedPipeline {
    /// Apply `log1p` and the frozen scaler parameters
    pub fn transform(&self, features: ArrayView2<f64>) -> crate::Result<Array2<f64>> {
        if features.ncols() != self.n_features() {
            return Err(SegmentError::data(format!(
                "expected {} feature columns, got {}",
                self.n_features(),
                features.ncols()
            )));
        }

        let mut transformed = log1p(features)?;
        for mut row in transformed.axis_iter_mut(Axis(0)) {
            row -= &self.center;
            row /= &self.scale;
        }
        Ok(transformed)
    }

    pub fn n_features(&self) -> usize {
        self.center.len()
    }

    pub fn scaler(&self) -> ScalerKind {
        self.scaler
    }

    pub fn center(&self) -> &Array1<f64> {
        &self.center
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }

    /// Structural check used when loading persisted artifacts
    pub(crate) fn is_consistent(&self) -> bool {
        self.center.len() == self.scale.len()
            && self.center.iter().all(|v| v.is_finite())
            && self.scale.iter().all(|v| v.is_finite() && *v != 0.0)
    }
}

fn log1p(features: ArrayView2<f64>) -> crate::Result<Array2<f64>> {
    if let Some(((i, j), value)) = features
        .indexed_iter()
        .find(|(_, v)| !v.is_finite() || **v < -1.0)
    {
        return Err(SegmentError::data(format!(
            "value {value} at row {i}, column {j} is outside the domain of log1p"
        )));
    }
    Ok(features.mapv(f64::ln_1p))
}

fn robust_parameters(column: ArrayView1<f64>) -> (f64, f64) {
    let mut sorted = column.to_vec();
    sorted.sort_by(f64::total_cmp);
    let median = quantile(&sorted, 0.5);
    let iqr = quantile(&sorted, 0.75) - quantile(&sorted, 0.25);
    (median, iqr)
}

fn standard_parameters(column: ArrayView1<f64>) -> (f64, f64) {
    let mean = column.mean().unwrap_or(0.0);
    (mean, column.std(0.0))
}

/// Quantile of sorted values with linear interpolation between ranks
fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let position = q * (n - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            let fraction = position - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}
