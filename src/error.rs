//! Error types for delta-mirror — Railway Programming
//!
//! All operations return `Result<T, MirrorError>`.
//! No panics, no unwraps in production code paths.

use thiserror::Error;

/// Unified error type for all mirroring operations
#[derive(Error, Debug)]
pub enum MirrorError {
    // ─── Configuration & Metadata ───

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    // ─── Load Pipeline ───

    #[error("Destination is locked (lock held for {held_for_secs}s, TTL {ttl_secs}s)")]
    Locked { held_for_secs: i64, ttl_secs: i64 },

    #[error("Source driver error: {0}")]
    Source(String),

    #[error("Lake engine error: {0}")]
    Engine(String),

    // ─── Infrastructure ───

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Delta table error: {0}")]
    DeltaTable(String),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("DataFusion error: {0}")]
    DataFusion(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<deltalake::DeltaTableError> for MirrorError {
    fn from(err: deltalake::DeltaTableError) -> Self {
        MirrorError::DeltaTable(err.to_string())
    }
}

impl From<deltalake::arrow::error::ArrowError> for MirrorError {
    fn from(err: deltalake::arrow::error::ArrowError) -> Self {
        MirrorError::Arrow(err.to_string())
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

impl From<deltalake::datafusion::error::DataFusionError> for MirrorError {
    fn from(err: deltalake::datafusion::error::DataFusionError) -> Self {
        MirrorError::DataFusion(err.to_string())
    }
}

impl From<url::ParseError> for MirrorError {
    fn from(err: url::ParseError) -> Self {
        MirrorError::Config(format!("URL parse error: {err}"))
    }
}

/// Result type alias for mirroring operations
pub type Result<T> = std::result::Result<T, MirrorError>;
