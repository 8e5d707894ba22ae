//! Ingestion Module
//!
//! Moves an uploaded CSV file into a relational table:
//! - Idempotent table provisioning from the file header
//! - Batch / sub-batch decomposition of the row set
//! - Bulk inserts with per-sub-batch retry
//! - A persisted checkpoint so a restarted run resumes at the first
//!   uncommitted batch

pub mod batch_writer;
pub mod checkpoint;
pub mod consumer;
pub mod message;
pub mod orchestrator;
pub mod row_source;
pub mod schema_catalog;
pub mod splitter;
pub mod status;
pub mod upload;

pub use batch_writer::BatchWriter;
pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, IngestProgress, MemoryCheckpointStore, RunKey,
};
pub use consumer::{consume_lines, ConsumeOutcome};
pub use message::IngestMessage;
pub use orchestrator::{IngestOptions, IngestOrchestrator, IngestReport, RunHandle};
pub use row_source::{CsvRowFetcher, RowFetcher};
pub use schema_catalog::SchemaCatalog;
pub use splitter::{split, sub_split, Batch, SubBatch};
pub use status::RunStatus;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One source record, keyed by normalized column name.
pub type Row = Map<String, Value>;

/// Default generic column type for header-derived tables.
pub const TEXT_COLUMN_TYPE: &str = "VARCHAR";

/// Lower-case and trim a column or table identifier.
pub fn normalize_identifier(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Textual form of a cell as written to the destination. `None` is SQL NULL.
pub fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Where an event's rows come from.
#[derive(Clone, Debug, PartialEq)]
pub enum RowSource {
    /// Rows already materialized in the message.
    Inline(Vec<Row>),
    /// A URL or path to fetch the full file from.
    Remote(String),
}

/// A validated "new file" event.
#[derive(Clone, Debug, PartialEq)]
pub struct IngestEvent {
    pub file_name: String,
    pub table_name: String,
    /// Normalized column names in source order.
    pub header: Vec<String>,
    pub description: Option<String>,
    pub rows: RowSource,
}

impl IngestEvent {
    pub fn run_key(&self) -> RunKey {
        RunKey::new(&self.table_name, &self.file_name)
    }
}

/// Column definition of a destination table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
}

/// Physical schema of a destination table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    pub description: Option<String>,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}
