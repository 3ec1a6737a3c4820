//! Error taxonomy shared by training and inference

use polars::prelude::PolarsError;
use thiserror::Error;

/// Coarse classification of a [`SegmentError`] for presentation layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required column is missing from the input table
    Schema,
    /// Persisted artifacts or input files are absent, unreadable or inconsistent
    Resource,
    /// Values are non-numeric or outside the domain of the transform
    Data,
    /// Anything else (clustering failures, frame internals)
    Internal,
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Clustering error: {0}")]
    Clustering(String),

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SegmentError {
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn clustering(msg: impl Into<String>) -> Self {
        Self::Clustering(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema(_) => ErrorKind::Schema,
            Self::Resource(_) | Self::Io(_) => ErrorKind::Resource,
            Self::Data(_) => ErrorKind::Data,
            Self::Clustering(_) | Self::Polars(_) => ErrorKind::Internal,
        }
    }
}
