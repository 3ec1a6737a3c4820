//! Cluster models fit on preprocessed customer features

use crate::config::{ClusterAlgorithm, ClusterSettings};
use crate::error::SegmentError;
use linfa::prelude::*;
use linfa_clustering::KMeans;
use linfa_linalg::cholesky::{Cholesky, InverseC};
use linfa_linalg::LinalgError;
use linfa_nn::distance::L2Dist;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Regularization added to the diagonal of the shared covariance
const REG_COVAR: f64 = 1e-6;

/// Per-cluster parameters of a fitted model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum ClusterParams {
    /// Nearest-centroid assignment under Euclidean distance
    KMeans { centroids: Array2<f64> },
    /// Most probable component of a mixture whose components share one covariance
    GaussianMixture {
        means: Array2<f64>,
        weights: Array1<f64>,
        /// Inverse of the shared covariance matrix
        precision: Array2<f64>,
    },
}

/// Fitted cluster model in the preprocessed feature space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedClusterModel {
    params: ClusterParams,
    /// `remap[original_label] = canonical_label`
    remap: Vec<usize>,
}

/// Result of a training fit: the model plus training-set diagnostics
#[derive(Debug, Clone)]
pub struct ClusterFit {
    pub model: FittedClusterModel,
    /// Cluster assignments for the training rows
    pub labels: Array1<usize>,
    /// Within-cluster sum of squares around the cluster centers
    pub inertia: f64,
}

impl FittedClusterModel {
    pub(crate) fn new(params: ClusterParams) -> Self {
        let k = params.centers().nrows();
        Self {
            params,
            remap: (0..k).collect(),
        }
    }

    pub fn n_clusters(&self) -> usize {
        self.params.centers().nrows()
    }

    pub fn n_features(&self) -> usize {
        self.params.centers().ncols()
    }

    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    /// Cluster centers (K-means centroids or mixture means)
    pub fn centers(&self) -> &Array2<f64> {
        self.params.centers()
    }

    pub fn remap(&self) -> &[usize] {
        &self.remap
    }

    /// Assign a single preprocessed row to a cluster
    pub fn predict_row(&self, row: ArrayView1<f64>) -> crate::Result<usize> {
        if row.len() != self.n_features() {
            return Err(SegmentError::data(format!(
                "feature vector must have exactly {} dimensions, got {}",
                self.n_features(),
                row.len()
            )));
        }

        let scores: Vec<f64> = match &self.params {
            ClusterParams::KMeans { centroids } => centroids
                .outer_iter()
                .map(|centroid| -squared_distance(row, centroid))
                .collect(),
            ClusterParams::GaussianMixture {
                means,
                weights,
                precision,
            } => means
                .outer_iter()
                .zip(weights.iter())
                .map(|(mean, &weight)| {
                    weight.max(f64::MIN_POSITIVE).ln() - 0.5 * mahalanobis(row, mean, precision)
                })
                .collect(),
        };

        // First best wins so ties resolve deterministically
        let mut best = 0;
        for (cluster, &score) in scores.iter().enumerate() {
            if score > scores[best] {
                best = cluster;
            }
        }
        Ok(best)
    }

    /// Assign every preprocessed row to a cluster
    pub fn predict(&self, features: ArrayView2<f64>) -> crate::Result<Array1<usize>> {
        features
            .outer_iter()
            .map(|row| self.predict_row(row))
            .collect::<crate::Result<Vec<_>>>()
            .map(Array1::from)
    }

    /// Reorder per-cluster parameters so that new cluster `i` is old cluster `order[i]`
    pub(crate) fn reorder(&mut self, order: &[usize]) {
        let reorder_rows = |m: &Array2<f64>| m.select(Axis(0), order);
        self.params = match &self.params {
            ClusterParams::KMeans { centroids } => ClusterParams::KMeans {
                centroids: reorder_rows(centroids),
            },
            ClusterParams::GaussianMixture {
                means,
                weights,
                precision,
            } => ClusterParams::GaussianMixture {
                means: reorder_rows(means),
                weights: weights.select(Axis(0), order),
                precision: precision.clone(),
            },
        };
    }

    pub(crate) fn compose_remap(&mut self, lookup: &[usize]) {
        for label in self.remap.iter_mut() {
            *label = lookup[*label];
        }
    }

    /// Structural check used when loading persisted artifacts
    pub(crate) fn is_consistent(&self) -> bool {
        let k = self.n_clusters();
        let mut seen = vec![false; k];
        let remap_is_permutation = self.remap.len() == k
            && self.remap.iter().all(|&label| {
                label < k && !std::mem::replace(&mut seen[label], true)
            });

        let params_fit = match &self.params {
            ClusterParams::KMeans { .. } => true,
            ClusterParams::GaussianMixture {
                weights, precision, ..
            } => {
                let d = self.n_features();
                weights.len() == k && precision.dim() == (d, d)
            }
        };

        remap_is_permutation && params_fit && self.centers().iter().all(|v| v.is_finite())
    }
}

impl ClusterParams {
    pub fn centers(&self) -> &Array2<f64> {
        match self {
            ClusterParams::KMeans { centroids } => centroids,
            ClusterParams::GaussianMixture { means, .. } => means,
        }
    }
}

impl ClusterFit {
    /// Number of training rows per cluster
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.model.n_clusters()];
        for &label in self.labels.iter() {
            if label < sizes.len() {
                sizes[label] += 1;
            }
        }
        sizes
    }

    /// Mean silhouette coefficient over the first `sample_size` training rows
    pub fn silhouette_sample(&self, features: ArrayView2<f64>, sample_size: usize) -> f64 {
        let n_samples = features.nrows().min(sample_size).min(self.labels.len());
        if n_samples < 2 {
            return 0.0;
        }

        let k = self.model.n_clusters();
        let mut silhouette_sum = 0.0;

        for i in 0..n_samples {
            let point = features.row(i);
            let own = self.labels[i];

            let mut totals = vec![0.0; k];
            let mut counts = vec![0usize; k];
            for j in (0..n_samples).filter(|&j| j != i) {
                let other = self.labels[j];
                if other < k {
                    totals[other] += squared_distance(point, features.row(j)).sqrt();
                    counts[other] += 1;
                }
            }

            let a_i = if counts[own] == 0 {
                0.0
            } else {
                totals[own] / counts[own] as f64
            };
            let b_i = (0..k)
                .filter(|&c| c != own && counts[c] > 0)
                .map(|c| totals[c] / counts[c] as f64)
                .fold(f64::INFINITY, f64::min);

            silhouette_sum += if b_i.is_infinite() || (a_i == 0.0 && b_i == 0.0) {
                0.0
            } else {
                (b_i - a_i) / a_i.max(b_i)
            };
        }

        silhouette_sum / n_samples as f64
    }
}

/// Fit `n_clusters` clusters on preprocessed features
pub fn fit_clusters(
    features: ArrayView2<f64>,
    n_clusters: usize,
    settings: &ClusterSettings,
) -> crate::Result<ClusterFit> {
    if n_clusters == 0 {
        return Err(SegmentError::clustering("number of clusters must be positive"));
    }
    if features.nrows() < n_clusters {
        return Err(SegmentError::data(format!(
            "number of customers ({}) must be at least equal to number of clusters ({})",
            features.nrows(),
            n_clusters
        )));
    }

    let centroids = fit_kmeans_centroids(features, n_clusters, settings)?;
    let kmeans = FittedClusterModel::new(ClusterParams::KMeans { centroids });

    let model = match settings.algorithm {
        ClusterAlgorithm::KMeans => kmeans,
        ClusterAlgorithm::GaussianMixture => {
            let labels = kmeans.predict(features)?;
            FittedClusterModel::new(fit_tied_mixture(
                features,
                kmeans.centers(),
                &labels,
                settings,
            )?)
        }
    };

    let labels = model.predict(features)?;
    let inertia = compute_inertia(features, &labels, model.centers());

    info!(
        algorithm = ?settings.algorithm,
        n_clusters,
        rows = features.nrows(),
        inertia,
        "fitted cluster model"
    );

    Ok(ClusterFit {
        model,
        labels,
        inertia,
    })
}

fn fit_kmeans_centroids(
    features: ArrayView2<f64>,
    n_clusters: usize,
    settings: &ClusterSettings,
) -> crate::Result<Array2<f64>> {
    let dataset = DatasetBase::from(features.to_owned());
    let rng = StdRng::seed_from_u64(settings.seed);

    let model = KMeans::params_with(n_clusters, rng, L2Dist)
        .n_runs(settings.n_init.max(1))
        .max_n_iterations(settings.max_iters as u64)
        .tolerance(settings.tolerance)
        .fit(&dataset)
        .map_err(|e| SegmentError::clustering(format!("k-means failed: {e}")))?;

    Ok(model.centroids().clone())
}

/// EM for a Gaussian mixture with one full covariance shared by all components
fn fit_tied_mixture(
    features: ArrayView2<f64>,
    initial_means: &Array2<f64>,
    initial_labels: &Array1<usize>,
    settings: &ClusterSettings,
) -> crate::Result<ClusterParams> {
    let (n, d) = features.dim();
    let k = initial_means.nrows();

    // Start from a hard K-means partition
    let mut resp = Array2::<f64>::zeros((n, k));
    for (i, &label) in initial_labels.iter().enumerate() {
        resp[[i, label]] = 1.0;
    }
    let mut means = initial_means.clone();
    let (mut weights, mut covariance) = m_step(features, &resp, &mut means);

    let mut previous = f64::NEG_INFINITY;
    let mut converged = false;
    for iteration in 0..settings.max_iters {
        let (precision, log_det) = precision_and_log_det(&covariance)?;
        let norm = -0.5 * (d as f64 * (2.0 * std::f64::consts::PI).ln() + log_det);

        // E-step
        let mut log_likelihood = 0.0;
        for (i, x) in features.outer_iter().enumerate() {
            let log_probs: Vec<f64> = (0..k)
                .map(|c| {
                    weights[c].max(f64::MIN_POSITIVE).ln() + norm
                        - 0.5 * mahalanobis(x, means.row(c), &precision)
                })
                .collect();
            let max = log_probs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let log_sum = max + log_probs.iter().map(|lp| (lp - max).exp()).sum::<f64>().ln();
            log_likelihood += log_sum;
            for (c, lp) in log_probs.iter().enumerate() {
                resp[[i, c]] = (lp - log_sum).exp();
            }
        }
        log_likelihood /= n as f64;

        (weights, covariance) = m_step(features, &resp, &mut means);

        if (log_likelihood - previous).abs() < settings.tolerance {
            debug!(iteration, log_likelihood, "gaussian mixture converged");
            converged = true;
            break;
        }
        previous = log_likelihood;
    }

    if !converged {
        warn!(
            max_iters = settings.max_iters,
            "gaussian mixture did not converge"
        );
    }

    let (precision, _) = precision_and_log_det(&covariance)?;
    Ok(ClusterParams::GaussianMixture {
        means,
        weights,
        precision,
    })
}

/// Update weights, means and the shared covariance from responsibilities
fn m_step(
    features: ArrayView2<f64>,
    resp: &Array2<f64>,
    means: &mut Array2<f64>,
) -> (Array1<f64>, Array2<f64>) {
    let (n, d) = features.dim();
    let counts = resp.sum_axis(Axis(0));

    for (c, &count) in counts.iter().enumerate() {
        // Components that lost all mass keep their previous mean
        if count > 10.0 * f64::EPSILON {
            let weighted = resp.column(c).dot(&features) / count;
            means.row_mut(c).assign(&weighted);
        }
    }

    let mut covariance = Array2::<f64>::zeros((d, d));
    for (i, x) in features.outer_iter().enumerate() {
        for (c, mean) in means.outer_iter().enumerate() {
            let r = resp[[i, c]];
            if r == 0.0 {
                continue;
            }
            let diff = &x - &mean;
            for a in 0..d {
                for b in 0..d {
                    covariance[[a, b]] += r * diff[a] * diff[b];
                }
            }
        }
    }
    covariance /= n as f64;
    for a in 0..d {
        covariance[[a, a]] += REG_COVAR;
    }

    (counts / n as f64, covariance)
}

/// Inverse and log-determinant of the shared covariance, both via its Cholesky factor
fn precision_and_log_det(covariance: &Array2<f64>) -> crate::Result<(Array2<f64>, f64)> {
    let not_positive_definite = |e: LinalgError| {
        SegmentError::clustering(format!("shared covariance is not positive definite: {e}"))
    };

    let lower = covariance.cholesky().map_err(not_positive_definite)?;
    let precision = covariance.invc().map_err(not_positive_definite)?;
    let log_det = 2.0 * lower.diag().mapv(f64::ln).sum();
    Ok((precision, log_det))
}

fn mahalanobis(x: ArrayView1<f64>, mean: ArrayView1<f64>, precision: &Array2<f64>) -> f64 {
    let diff = &x - &mean;
    diff.dot(&precision.dot(&diff))
}

fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Within-cluster sum of squares
fn compute_inertia(features: ArrayView2<f64>, labels: &Array1<usize>, centers: &Array2<f64>) -> f64 {
    let mut inertia = 0.0;
    for (point, &cluster) in features.outer_iter().zip(labels.iter()) {
        if cluster < centers.nrows() {
            inertia += squared_distance(point, centers.row(cluster));
        }
    }
    inertia
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn three_blobs() -> Array2<f64> {
        array![
            [-5.0, -5.0],
            [-5.2, -4.9],
            [-4.8, -5.1],
            [0.0, 0.1],
            [0.2, -0.1],
            [-0.1, 0.0],
            [5.0, 5.1],
            [5.1, 4.9],
            [4.9, 5.0],
        ]
    }

    #[test]
    fn test_fit_kmeans() {
        let features = three_blobs();
        let fit = fit_clusters(features.view(), 3, &ClusterSettings::default()).unwrap();

        assert_eq!(fit.model.n_clusters(), 3);
        assert_eq!(fit.labels.len(), 9);
        assert_eq!(fit.model.centers().shape(), &[3, 2]);
        assert_eq!(fit.model.remap(), &[0, 1, 2]);

        // each blob lands in its own cluster
        assert_eq!(fit.labels[0], fit.labels[1]);
        assert_eq!(fit.labels[3], fit.labels[5]);
        assert_ne!(fit.labels[0], fit.labels[3]);
        assert_ne!(fit.labels[3], fit.labels[6]);
        assert_ne!(fit.labels[0], fit.labels[6]);
    }

    #[test]
    fn test_fit_is_reproducible_with_seed() {
        let features = three_blobs();
        let settings = ClusterSettings::default();
        let first = fit_clusters(features.view(), 3, &settings).unwrap();
        let second = fit_clusters(features.view(), 3, &settings).unwrap();
        assert_eq!(first.model, second.model);
        assert_eq!(first.labels, second.labels);
    }

    #[test]
    fn test_fit_gaussian_mixture() {
        let features = three_blobs();
        let settings = ClusterSettings {
            algorithm: ClusterAlgorithm::GaussianMixture,
            ..ClusterSettings::default()
        };
        let fit = fit_clusters(features.view(), 3, &settings).unwrap();

        assert!(matches!(
            fit.model.params(),
            ClusterParams::GaussianMixture { .. }
        ));
        assert!(fit.labels.iter().all(|&label| label < 3));
        assert_eq!(fit.labels[0], fit.labels[2]);
        assert_ne!(fit.labels[0], fit.labels[8]);
        assert_eq!(fit.cluster_sizes().iter().sum::<usize>(), 9);
    }

    #[test]
    fn test_predict_row_nearest_centroid() {
        let model = FittedClusterModel::new(ClusterParams::KMeans {
            centroids: array![[0.0, 0.0], [10.0, 10.0]],
        });
        assert_eq!(model.predict_row(array![1.0, 1.0].view()).unwrap(), 0);
        assert_eq!(model.predict_row(array![9.0, 8.0].view()).unwrap(), 1);
        // equidistant points go to the first cluster
        assert_eq!(model.predict_row(array![5.0, 5.0].view()).unwrap(), 0);
        assert!(model.predict_row(array![1.0].view()).is_err());
    }

    #[test]
    fn test_cluster_sizes() {
        let features = three_blobs();
        let fit = fit_clusters(features.view(), 3, &ClusterSettings::default()).unwrap();
        let sizes = fit.cluster_sizes();
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes.iter().sum::<usize>(), 9);
        assert!(fit.inertia >= 0.0 && fit.inertia.is_finite());
    }

    #[test]
    fn test_silhouette_well_separated() {
        let features = three_blobs();
        let fit = fit_clusters(features.view(), 3, &ClusterSettings::default()).unwrap();
        let score = fit.silhouette_sample(features.view(), 100);
        assert!(score > 0.8, "silhouette {score}");
    }

    #[test]
    fn test_too_few_rows() {
        let features = array![[0.0, 1.0], [1.0, 0.0]];
        let err = fit_clusters(features.view(), 5, &ClusterSettings::default()).unwrap_err();
        assert!(matches!(err, SegmentError::Data(_)));
    }

    #[test]
    fn test_precision_and_log_det() {
        let matrix = array![[4.0, 2.0], [2.0, 3.0]];
        let (precision, log_det) = precision_and_log_det(&matrix).unwrap();
        let identity = matrix.dot(&precision);
        assert!((identity[[0, 0]] - 1.0).abs() < 1e-12);
        assert!(identity[[0, 1]].abs() < 1e-12);
        assert!((identity[[1, 1]] - 1.0).abs() < 1e-12);
        // det = 4 * 3 - 2 * 2
        assert!((log_det - 8f64.ln()).abs() < 1e-12);

        let err = precision_and_log_det(&array![[0.0, 0.0], [0.0, 1.0]]).unwrap_err();
        assert!(matches!(err, SegmentError::Clustering(_)));
    }

    #[test]
    fn test_consistency_check() {
        let mut model = FittedClusterModel::new(ClusterParams::KMeans {
            centroids: array![[0.0], [1.0], [2.0]],
        });
        assert!(model.is_consistent());
        model.remap = vec![0, 0, 2];
        assert!(!model.is_consistent());
    }
}
