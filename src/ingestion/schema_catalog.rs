//! Schema Catalog - Idempotent table provisioning from a file header
//!
//! Every column of a derived table is `VARCHAR`. A column is part of the
//! primary key when its name is one of the configured identifier columns.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{normalize_identifier, ColumnDef, TableSchema, TEXT_COLUMN_TYPE};
use crate::db::{with_timeout, CreateOutcome, DestinationStore};
use crate::error::{IngestError, Result, StoreError};

/// PostgreSQL truncates identifiers beyond 63 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

pub struct SchemaCatalog {
    store: Arc<dyn DestinationStore>,
    timeout: Duration,
    primary_key_columns: Vec<String>,
}

impl SchemaCatalog {
    pub fn new(store: Arc<dyn DestinationStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            primary_key_columns: vec!["playerid".to_string()],
        }
    }

    /// Replace the identifier convention used to pick primary-key columns.
    pub fn with_primary_key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.primary_key_columns = columns
            .into_iter()
            .map(|c| normalize_identifier(c.as_ref()))
            .filter(|c| !c.is_empty())
            .collect();
        self
    }

    /// Normalize and check a header: non-empty, no blank or over-long names,
    /// no duplicates once lower-cased.
    pub fn validate_header(&self, table_name: &str, header: &[String]) -> Result<Vec<String>> {
        let invalid = |reason: String| IngestError::InvalidHeader {
            table: table_name.to_string(),
            reason,
        };

        if header.is_empty() {
            return Err(invalid("header is empty".to_string()));
        }

        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(header.len());
        for (position, raw) in header.iter().enumerate() {
            let name = normalize_identifier(raw);
            if name.is_empty() {
                return Err(invalid(format!("column {} has an empty name", position)));
            }
            if name.len() > MAX_IDENTIFIER_LEN {
                return Err(invalid(format!(
                    "column name '{}' exceeds {} bytes",
                    name, MAX_IDENTIFIER_LEN
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(invalid(format!("duplicate column '{}'", name)));
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Schema a new table gets for this header.
    pub fn derive_schema(
        &self,
        table_name: &str,
        header: &[String],
        description: Option<&str>,
    ) -> TableSchema {
        let columns = header
            .iter()
            .map(|name| {
                let primary_key = self.primary_key_columns.iter().any(|pk| pk == name);
                ColumnDef {
                    name: name.clone(),
                    data_type: TEXT_COLUMN_TYPE.to_string(),
                    nullable: !primary_key,
                    primary_key,
                }
            })
            .collect();

        TableSchema {
            table_name: table_name.to_string(),
            columns,
            description: description.map(str::to_string),
        }
    }

    /// Make sure the destination table exists and return its schema.
    ///
    /// An existing table is returned as-is without a create call. Losing a
    /// creation race to another run is not an error.
    pub async fn ensure_table(
        &self,
        table_name: &str,
        header: &[String],
        description: Option<&str>,
    ) -> Result<TableSchema> {
        let header = self.validate_header(table_name, header)?;

        if self
            .call(table_name, self.store.table_exists(table_name))
            .await?
        {
            if let Some(existing) = self
                .call(table_name, self.store.describe_table(table_name))
                .await?
            {
                debug!(table = %table_name, "Table already exists");
                return Ok(existing);
            }
        }

        let schema = self.derive_schema(table_name, &header, description);
        match self
            .call(table_name, self.store.create_table(&schema))
            .await?
        {
            CreateOutcome::Created => {
                info!(
                    table = %table_name,
                    columns = schema.columns.len(),
                    primary_key = ?schema.primary_key(),
                    "Created table"
                );
                Ok(schema)
            }
            CreateOutcome::AlreadyExists => {
                info!(table = %table_name, "Table was created concurrently, reading it back");
                let existing = self
                    .call(table_name, self.store.describe_table(table_name))
                    .await?;
                Ok(existing.unwrap_or(schema))
            }
        }
    }

    async fn call<T, F>(&self, table_name: &str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, StoreError>>,
    {
        with_timeout(self.timeout, call)
            .await
            .map_err(|source| IngestError::SchemaProvision {
                table: table_name.to_string(),
                source,
            })
    }
}
