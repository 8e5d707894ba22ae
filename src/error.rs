use std::time::Duration;

use thiserror::Error;

/// Errors raised by a destination store call.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rejected by store: {0}")]
    Rejected(String),
}

/// Errors raised while materializing a file's row set.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error fetching {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Header mismatch: file has {found} columns, event declares {expected}")]
    HeaderMismatch { expected: usize, found: usize },

    #[error("Row {line} has {found} fields, expected {expected}")]
    RowWidth {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Unsupported file URL: {0}")]
    UnsupportedUrl(String),
}

/// Errors raised by checkpoint persistence.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Checkpoint store timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised while validating an inbound queue message.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Message must carry exactly one of file_url or batchrows")]
    AmbiguousRowSource,

    #[error("Message carries neither file_url nor batchrows")]
    NoRowSource,
}

/// Invalid runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Sub-batch size {sub_batch_size} exceeds batch size {batch_size}")]
    SubBatchTooLarge {
        batch_size: usize,
        sub_batch_size: usize,
    },
}

/// A single sub-batch insert that failed.
#[derive(Error, Debug)]
#[error("sub-batch {sub_batch} of batch {batch} failed: {source}")]
pub struct WriteError {
    pub batch: usize,
    pub sub_batch: usize,
    #[source]
    pub source: StoreError,
}

/// Errors that end an ingestion run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Schema provisioning failed for table {table}: {source}")]
    SchemaProvision {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Invalid header for table {table}: {reason}")]
    InvalidHeader { table: String, reason: String },

    #[error("Row fetch failed for {file}: {source}")]
    RowFetch {
        file: String,
        #[source]
        source: FetchError,
    },

    #[error("Batch {batch} failed after {attempts} attempts: {source}")]
    BatchWrite {
        batch: usize,
        attempts: usize,
        #[source]
        source: WriteError,
    },

    #[error("Writer task for batch {batch} did not finish: {source}")]
    WriterTask {
        batch: usize,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("Split mismatch: {0}")]
    Split(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl IngestError {
    /// Short reason used in `Failed:<reason>` status strings.
    pub fn reason(&self) -> String {
        match self {
            IngestError::SchemaProvision { .. } | IngestError::InvalidHeader { .. } => {
                "schema".to_string()
            }
            IngestError::RowFetch { .. } => "row fetch".to_string(),
            IngestError::BatchWrite { batch, .. } | IngestError::WriterTask { batch, .. } => {
                format!("batch {}", batch)
            }
            IngestError::Split(_) => "splitting".to_string(),
            IngestError::Checkpoint(_) => "checkpoint".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
