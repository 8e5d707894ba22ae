//! Run status of an ingestion orchestration

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of one ingestion run, as reported to observers.
///
/// Batch indices are 0-based.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Received,
    SchemaEnsuring,
    Splitting,
    BatchInFlight { batch: usize },
    BatchCommitted { batch: usize },
    Completed,
    Failed { reason: String, cause: String },
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed { .. } | RunStatus::Cancelled
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Received => write!(f, "Received"),
            RunStatus::SchemaEnsuring => write!(f, "SchemaEnsuring"),
            RunStatus::Splitting => write!(f, "Splitting"),
            RunStatus::BatchInFlight { batch } => write!(f, "BatchInFlight:{}", batch),
            RunStatus::BatchCommitted { batch } => write!(f, "BatchCommitted:{}", batch),
            RunStatus::Completed => write!(f, "Completed"),
            RunStatus::Failed { reason, .. } => write!(f, "Failed:{}", reason),
            RunStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}
