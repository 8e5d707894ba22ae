//! Destination store - the relational interface the ingestion core writes to

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use super::sql::{comment_ddl, create_table_ddl, quote_ident};
use crate::error::StoreError;
use crate::ingestion::{ColumnDef, TableSchema, TEXT_COLUMN_TYPE};

/// PostgreSQL caps a statement at 65535 bind parameters.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Outcome of a create-table call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another creator got there first; not an error.
    AlreadyExists,
}

/// Relational destination used by the schema catalog and the batch writer.
///
/// Implementations:
/// - PgDestination: PostgreSQL through a shared sqlx pool
/// - MemoryDestination: in-process tables for dry runs and tests
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Whether a table with this name exists.
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    /// Physical schema of an existing table, `None` if it does not exist.
    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>, StoreError>;

    /// Create the table with its comment. A concurrent or earlier creation is
    /// reported as `AlreadyExists`.
    async fn create_table(&self, schema: &TableSchema) -> Result<CreateOutcome, StoreError>;

    /// Bulk insert rows of text cells (`None` is NULL) in `columns` order.
    ///
    /// A row whose primary key is already present is skipped, so a batch can
    /// be written again after a redelivery or a resume. Returns the number of
    /// rows actually inserted.
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<u64, StoreError>;
}

/// Run a store call under a deadline. An elapsed deadline is reported as
/// `StoreError::Timeout`, the same way as a transport failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Columns of the relation `$1` resolves to on the search_path, the same
/// lookup `table_exists` uses.
const DESCRIBE_COLUMNS_SQL: &str = r#"
    SELECT a.attname::text,
           format_type(a.atttypid, a.atttypmod),
           NOT a.attnotnull,
           COALESCE(a.attnum = ANY(i.indkey), false)
    FROM pg_attribute a
    LEFT JOIN pg_index i
      ON i.indrelid = a.attrelid
     AND i.indisprimary
    WHERE a.attrelid = to_regclass($1)
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

/// Map a `format_type` name back to the spelling used in generated DDL.
pub fn catalog_type_name(pg_type: &str) -> String {
    match pg_type {
        "character varying" => TEXT_COLUMN_TYPE.to_string(),
        other => other.to_uppercase(),
    }
}

/// PostgreSQL destination backed by the process-wide pool.
#[derive(Clone)]
pub struct PgDestination {
    pool: PgPool,
}

impl PgDestination {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 42P07 is duplicate_table; 23505 on pg_type is the race where two
    /// transactions create the same table concurrently.
    fn is_duplicate_table(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => db_err
                .code()
                .map_or(false, |code| matches!(code.as_ref(), "42P07" | "23505")),
            _ => false,
        }
    }
}

#[async_trait]
impl DestinationStore for PgDestination {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(quote_ident(table))
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn describe_table(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let rows: Vec<(String, String, bool, bool)> = sqlx::query_as(DESCRIBE_COLUMNS_SQL)
            .bind(quote_ident(table))
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let description: Option<String> =
            sqlx::query_scalar("SELECT obj_description(to_regclass($1), 'pg_class')")
                .bind(quote_ident(table))
                .fetch_one(&self.pool)
                .await?;

        let columns = rows
            .into_iter()
            .map(|(name, data_type, nullable, primary_key)| ColumnDef {
                name,
                data_type: catalog_type_name(&data_type),
                nullable,
                primary_key,
            })
            .collect();

        Ok(Some(TableSchema {
            table_name: table.to_string(),
            columns,
            description,
        }))
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<CreateOutcome, StoreError> {
        let ddl = create_table_ddl(schema);
        debug!(table = %schema.table_name, ddl = %ddl, "Creating table");

        let mut tx = self.pool.begin().await?;
        match sqlx::query(&ddl).execute(&mut *tx).await {
            Ok(_) => {}
            Err(e) if Self::is_duplicate_table(&e) => {
                tx.rollback().await?;
                info!(table = %schema.table_name, "Table created concurrently by another writer");
                return Ok(CreateOutcome::AlreadyExists);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(comment) = comment_ddl(schema) {
            sqlx::query(&comment).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(CreateOutcome::Created)
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let params = rows.len() * columns.len();
        if params > MAX_BIND_PARAMS {
            return Err(StoreError::Rejected(format!(
                "{} rows x {} columns exceeds {} bind parameters",
                rows.len(),
                columns.len(),
                MAX_BIND_PARAMS
            )));
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", quote_ident(table), column_list));
        builder.push_values(rows, |mut values, row| {
            for cell in row {
                values.push_bind(cell.clone());
            }
        });
        builder.push(" ON CONFLICT DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
