//! Persisted artifact bundle
//!
//! Pipeline, cluster model and feature list are written together as one
//! JSON document, so they can never be read back out of step.

use crate::config::CLUSTER_COUNT;
use crate::error::SegmentError;
use crate::labels::SEGMENTS;
use crate::model::FittedClusterModel;
use crate::pipeline::FittedPipeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

/// File name of the bundle inside the artifact directory
pub const BUNDLE_FILE: &str = "segmentation_bundle.json";

/// Everything inference needs to reproduce training-time behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    /// Feature names in the column order the pipeline was fit on
    pub feature_columns: Vec<String>,
    pub pipeline: FittedPipeline,
    pub model: FittedClusterModel,
    /// Segment names by canonical cluster index
    pub segments: Vec<String>,
    pub seed: u64,
    pub trained_at: DateTime<Utc>,
}

impl ArtifactBundle {
    pub fn new(
        feature_columns: Vec<String>,
        pipeline: FittedPipeline,
        model: FittedClusterModel,
        seed: u64,
    ) -> Self {
        Self {
            feature_columns,
            pipeline,
            model,
            segments: SEGMENTS.iter().map(|name| name.to_string()).collect(),
            seed,
            trained_at: Utc::now(),
        }
    }

    /// Check that the pieces fit together
    pub fn validate(&self) -> crate::Result<()> {
        let n_features = self.feature_columns.len();
        if n_features == 0 {
            return Err(SegmentError::resource("artifact bundle lists no features"));
        }
        if self.pipeline.n_features() != n_features || !self.pipeline.is_consistent() {
            return Err(SegmentError::resource(format!(
                "preprocessing pipeline expects {} features but the bundle lists {}",
                self.pipeline.n_features(),
                n_features
            )));
        }
        if self.model.n_features() != n_features {
            return Err(SegmentError::resource(format!(
                "cluster model expects {} features but the bundle lists {}",
                self.model.n_features(),
                n_features
            )));
        }
        if self.model.n_clusters() != CLUSTER_COUNT || !self.model.is_consistent() {
            return Err(SegmentError::resource(format!(
                "cluster model is malformed ({} clusters, expected {CLUSTER_COUNT})",
                self.model.n_clusters()
            )));
        }
        if self.segments.iter().map(String::as_str).ne(SEGMENTS) {
            return Err(SegmentError::resource(format!(
                "segment catalog {:?} does not match {SEGMENTS:?}",
                self.segments
            )));
        }
        Ok(())
    }
}

/// Directory holding the artifact bundle
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.root.join(BUNDLE_FILE)
    }

    pub fn exists(&self) -> bool {
        self.bundle_path().is_file()
    }

    /// Write the bundle atomically: a reader sees the old bundle or the new one
    pub fn save(&self, bundle: &ArtifactBundle) -> crate::Result<PathBuf> {
        bundle.validate()?;
        fs::create_dir_all(&self.root).map_err(|e| {
            SegmentError::resource(format!("cannot create {}: {e}", self.root.display()))
        })?;

        let path = self.bundle_path();
        let staged = NamedTempFile::new_in(&self.root).map_err(|e| {
            SegmentError::resource(format!("cannot stage artifacts in {}: {e}", self.root.display()))
        })?;

        let mut writer = BufWriter::new(staged);
        serde_json::to_writer(&mut writer, bundle)
            .map_err(|e| SegmentError::resource(format!("cannot serialize artifacts: {e}")))?;
        writer.flush()?;
        let staged = writer
            .into_inner()
            .map_err(|e| SegmentError::resource(format!("cannot flush artifacts: {e}")))?;
        staged.as_file().sync_all()?;
        staged.persist(&path).map_err(|e| {
            SegmentError::resource(format!("cannot write {}: {}", path.display(), e.error))
        })?;

        info!(path = %path.display(), "saved artifact bundle");
        Ok(path)
    }

    /// Read and validate the bundle
    pub fn load(&self) -> crate::Result<ArtifactBundle> {
        let path = self.bundle_path();
        if !path.is_file() {
            return Err(SegmentError::resource(format!(
                "model artifacts not found at {}; run training first",
                path.display()
            )));
        }

        let file = fs::File::open(&path).map_err(|e| {
            SegmentError::resource(format!("cannot open {}: {e}", path.display()))
        })?;
        let bundle: ArtifactBundle = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| SegmentError::resource(format!("corrupt artifacts at {}: {e}", path.display())))?;
        bundle.validate()?;

        info!(
            path = %path.display(),
            trained_at = %bundle.trained_at,
            "loaded artifact bundle"
        );
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterSettings;
    use crate::model::fit_clusters;
    use crate::pipeline::PreprocessingPipeline;
    use ndarray::{array, Array2};
    use tempfile::tempdir;

    fn sample_bundle() -> ArtifactBundle {
        let raw = Array2::from_shape_fn((12, 2), |(i, j)| ((i * 7 + j * 3) % 11) as f64 * 10.0);
        let pipeline = PreprocessingPipeline::default().fit(raw.view()).unwrap();
        let scaled = pipeline.transform(raw.view()).unwrap();
        let fit = fit_clusters(scaled.view(), CLUSTER_COUNT, &ClusterSettings::default()).unwrap();
        ArtifactBundle::new(
            vec!["Recency".to_string(), "Monetary_Total".to_string()],
            pipeline,
            fit.model,
            42,
        )
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("models"));
        let bundle = sample_bundle();

        let path = store.save(&bundle).unwrap();
        assert_eq!(path, store.bundle_path());
        assert!(store.exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded, bundle);

        let sample = array![[13.0, 250.0], [0.0, 1.5]];
        let before = bundle.pipeline.transform(sample.view()).unwrap();
        let after = loaded.pipeline.transform(sample.view()).unwrap();
        assert_eq!(before, after);
        assert_eq!(
            bundle.model.predict(before.view()).unwrap(),
            loaded.model.predict(after.view()).unwrap()
        );
    }

    #[test]
    fn test_load_missing_bundle() {
        let dir = tempdir().unwrap();
        let err = ArtifactStore::new(dir.path()).load().unwrap_err();
        assert!(matches!(err, SegmentError::Resource(_)));
    }

    #[test]
    fn test_load_corrupt_bundle() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(BUNDLE_FILE), b"{not json").unwrap();
        let err = ArtifactStore::new(dir.path()).load().unwrap_err();
        assert!(matches!(err, SegmentError::Resource(_)));
    }

    #[test]
    fn test_validate_feature_count_mismatch() {
        let mut bundle = sample_bundle();
        bundle.feature_columns.push("Total_Points".to_string());
        assert!(matches!(bundle.validate(), Err(SegmentError::Resource(_))));

        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.save(&bundle).is_err());
        assert!(!store.exists());
    }

    #[test]
    fn test_validate_segment_catalog() {
        let mut bundle = sample_bundle();
        assert!(bundle.validate().is_ok());

        bundle.segments.swap(0, 4);
        assert!(matches!(bundle.validate(), Err(SegmentError::Resource(_))));

        bundle.segments.truncate(3);
        assert!(matches!(bundle.validate(), Err(SegmentError::Resource(_))));
    }

    #[test]
    fn test_save_replaces_previous_bundle() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let mut first = sample_bundle();
        first.seed = 1;
        store.save(&first).unwrap();

        let mut second = sample_bundle();
        second.seed = 2;
        store.save(&second).unwrap();

        assert_eq!(store.load().unwrap().seed, 2);
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
