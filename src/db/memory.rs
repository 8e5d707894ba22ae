//! In-process destination store, used by `--dry-run` and the test suite.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::destination::{CreateOutcome, DestinationStore};
use crate::error::StoreError;
use crate::ingestion::TableSchema;

#[derive(Debug)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Vec<Option<String>>>,
    keys: HashSet<Vec<String>>,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            keys: HashSet::new(),
        }
    }
}

/// Destination that keeps tables in memory.
///
/// Inserts behave like `INSERT .. ON CONFLICT DO NOTHING`: a row whose
/// primary key is already present is skipped and not counted. A NULL key
/// cell is rejected. The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    tables: Mutex<HashMap<String, MemoryTable>>,
    create_calls: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing table, as if created by an earlier deployment.
    pub fn with_table(self, schema: TableSchema) -> Self {
        self.lock_tables()
            .insert(schema.table_name.clone(), MemoryTable::new(schema));
        self
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryTable>> {
        // Every mutation is a single insert/extend, so a poisoned map is still consistent.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn table_count(&self) -> usize {
        self.lock_tables().len()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock_tables().get(table).map_or(0, |t| t.rows.len())
    }

    pub fn schema(&self, table: &str) -> Option<TableSchema> {
        self.lock_tables().get(table).map(|t| t.schema.clone())
    }

    /// Copy of all rows written to a table.
    pub fn rows(&self, table: &str) -> Vec<Vec<Option<String>>> {
        self.lock_tables()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.lock_tables().contains_key(table))
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        Ok(self.schema(table))
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<CreateOutcome, StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.lock_tables();
        if tables.contains_key(&schema.table_name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        tables.insert(schema.table_name.clone(), MemoryTable::new(schema.clone()));
        Ok(CreateOutcome::Created)
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<u64, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.lock_tables();
        let target = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::Rejected(format!("relation \"{}\" does not exist", table)))?;

        let known: Vec<&str> = target.schema.columns.iter().map(|c| c.name.as_str()).collect();
        if let Some(missing) = columns.iter().find(|c| !known.contains(&c.as_str())) {
            return Err(StoreError::Rejected(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                missing, table
            )));
        }

        let key_positions: Vec<usize> = target
            .schema
            .primary_key()
            .iter()
            .filter_map(|pk| columns.iter().position(|c| c.as_str() == *pk))
            .collect();
        if key_positions.is_empty() {
            target.rows.extend(rows.iter().cloned());
            return Ok(rows.len() as u64);
        }

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key: Option<Vec<String>> = key_positions
                .iter()
                .map(|&i| row.get(i).cloned().flatten())
                .collect();
            match key {
                Some(key) => keyed.push((key, row)),
                None => {
                    return Err(StoreError::Rejected(format!(
                        "null value in primary key of relation \"{}\"",
                        table
                    )))
                }
            }
        }

        let mut inserted = 0u64;
        for (key, row) in keyed {
            if target.keys.insert(key) {
                target.rows.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}
