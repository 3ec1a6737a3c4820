//! SegmentForge: customer segmentation from transaction history
//!
//! Raw transactions are reduced to one RFM-style feature vector per customer,
//! compressed with `log1p`, scaled, and clustered into five segments ordered
//! by total spend. Training persists the fitted pipeline as one artifact
//! bundle; inference reloads it to score single customers or whole tables.

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod labels;
pub mod model;
pub mod pipeline;
pub mod train;

// Re-export public items for easier access
pub use artifacts::{ArtifactBundle, ArtifactStore};
pub use config::{ClusterAlgorithm, ScalerKind, SegmentationConfig, CLUSTER_COUNT};
pub use data::{aggregate, classify, TableKind, FEATURE_COLUMNS};
pub use error::{ErrorKind, SegmentError};
pub use inference::InferenceService;
pub use labels::{segment_name, sort_by_value, LabelRemap, SortBasis, SEGMENTS};
pub use model::{fit_clusters, ClusterFit, FittedClusterModel};
pub use pipeline::{FittedPipeline, PreprocessingPipeline};
pub use train::{train, train_from_csv, TrainingReport};

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, SegmentError>;
