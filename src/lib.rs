//! csv-ingest - queue-driven CSV ingestion into PostgreSQL
//!
//! A "new file" message is turned into a provisioned table and a sequence of
//! checkpointed batch inserts. See `ingestion::IngestOrchestrator`.

pub mod config;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod observability;
pub mod safety;

pub use config::{IngestConfig, RedeliveryPolicy};
pub use error::{IngestError, Result};
pub use ingestion::{IngestEvent, IngestOrchestrator, IngestReport, RunStatus};
