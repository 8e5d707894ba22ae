//! Batch Writer - One bulk insert per sub-batch

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{cell_text, Row, SubBatch};
use crate::db::{with_timeout, DestinationStore};
use crate::error::WriteError;

/// Text cells of `rows` in `columns` order. Missing keys become NULL.
pub fn to_text_rows(columns: &[String], rows: &[Row]) -> Vec<Vec<Option<String>>> {
    rows.iter()
        .map(|row| {
            columns
                .iter()
                .map(|col| row.get(col).and_then(cell_text))
                .collect()
        })
        .collect()
}

/// Writes sub-batches to the destination. Retry is left to the caller.
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn DestinationStore>,
    timeout: Duration,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn DestinationStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Insert every row of the sub-batch in a single store call.
    ///
    /// Returns the sub-batch size: rows whose key was already present count as
    /// written, since they are in the table.
    pub async fn write_sub_batch(
        &self,
        table: &str,
        columns: &[String],
        sub_batch: &SubBatch,
    ) -> Result<u64, WriteError> {
        if sub_batch.rows.is_empty() {
            return Ok(0);
        }

        let rows = to_text_rows(columns, &sub_batch.rows);
        match with_timeout(self.timeout, self.store.insert_rows(table, columns, &rows)).await {
            Ok(inserted) => {
                let rows = rows.len() as u64;
                if inserted < rows {
                    info!(
                        table,
                        batch = sub_batch.batch_index,
                        sub_batch = sub_batch.index,
                        skipped = rows - inserted,
                        "Skipped rows already present under the same primary key"
                    );
                }
                debug!(
                    table,
                    batch = sub_batch.batch_index,
                    sub_batch = sub_batch.index,
                    rows = inserted,
                    "Sub-batch written"
                );
                Ok(rows)
            }
            Err(source) => {
                warn!(
                    table,
                    batch = sub_batch.batch_index,
                    sub_batch = sub_batch.index,
                    error = %source,
                    "Sub-batch insert failed"
                );
                Err(WriteError {
                    batch: sub_batch.batch_index,
                    sub_batch: sub_batch.index,
                    source,
                })
            }
        }
    }
}
