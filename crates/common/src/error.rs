//! Error types for FlowSeal integrity primitives

use thiserror::Error;

/// Result type alias using the FlowSeal common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while canonicalizing, chaining or sealing evidence
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Cyclic structure detected at {path}")]
    CyclicStructure { path: String },

    #[error("Sealing error: {0}")]
    Sealing(String),

    #[error("Integrity verification failed: {0}")]
    Integrity(String),

    #[error("Journal error: {0}")]
    Journal(String),
}

impl Error {
    /// True for errors that came from traversing a cyclic composite value
    pub fn is_cyclic(&self) -> bool {
        matches!(self, Error::CyclicStructure { .. })
    }
}
