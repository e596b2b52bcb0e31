//! Error taxonomy of the refresh pipeline

use thiserror::Error;

/// Result type used across the pipeline
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Remote source could not be reached or refused to serve the payload,
    /// either permanently or after the retry budget ran out
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Fetched payload does not carry the columns the dataset declares
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Storage gateway rejected a batch; the run fails, earlier tables stay
    #[error("storage commit failed: {0}")]
    StorageCommit(String),

    /// A refresh is already in flight; triggers are rejected, never queued
    #[error("a refresh is already running")]
    AlreadyRunning,

    /// Lookup of a dataset id the registry does not know
    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(String),
}
