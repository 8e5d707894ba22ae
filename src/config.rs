//! Runtime configuration for the ingestion pipeline

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ingestion::IngestOptions;
use crate::safety::RetryPolicy;

/// What to do when an event arrives for a run that already completed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RedeliveryPolicy {
    /// Ingest the whole file again. Rows may be duplicated.
    #[default]
    Reingest,
    /// Acknowledge without writing.
    SkipCompleted,
}

/// Ingestion configuration
#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Rows per checkpointed batch
    pub batch_size: usize,

    /// Rows per insert call
    pub sub_batch_size: usize,

    /// Concurrent sub-batch inserts within one batch (1 = sequential)
    pub max_concurrent_writes: usize,

    /// Attempts per sub-batch, including the first
    pub max_attempts: usize,

    pub retry_initial_delay: Duration,

    /// Deadline for every destination store call
    pub store_timeout: Duration,

    pub max_db_connections: u32,

    /// Column names treated as the primary key when present in a header
    pub primary_key_columns: Vec<String>,

    pub redelivery: RedeliveryPolicy,

    /// Files ingested concurrently by the consumer
    pub max_concurrent_files: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            sub_batch_size: 100,
            max_concurrent_writes: 4,
            max_attempts: 3,
            retry_initial_delay: Duration::from_millis(200),
            store_timeout: Duration::from_secs(30),
            max_db_connections: 10,
            primary_key_columns: vec!["playerid".to_string()],
            redelivery: RedeliveryPolicy::Reingest,
            max_concurrent_files: 4,
        }
    }
}

impl IngestConfig {
    /// Reject zero sizes and a sub-batch larger than its batch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("batch_size", self.batch_size),
            ("sub_batch_size", self.sub_batch_size),
            ("max_concurrent_writes", self.max_concurrent_writes),
            ("max_attempts", self.max_attempts),
            ("max_concurrent_files", self.max_concurrent_files),
            ("max_db_connections", self.max_db_connections as usize),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::Zero("store_timeout"));
        }
        if self.sub_batch_size > self.batch_size {
            return Err(ConfigError::SubBatchTooLarge {
                batch_size: self.batch_size,
                sub_batch_size: self.sub_batch_size,
            });
        }
        Ok(())
    }

    /// Orchestrator options for this configuration.
    pub fn ingest_options(&self) -> Result<IngestOptions, ConfigError> {
        self.validate()?;
        let non_zero =
            |name: &'static str, value: usize| NonZeroUsize::new(value).ok_or(ConfigError::Zero(name));

        Ok(IngestOptions {
            batch_size: non_zero("batch_size", self.batch_size)?,
            sub_batch_size: non_zero("sub_batch_size", self.sub_batch_size)?,
            max_concurrent_writes: non_zero("max_concurrent_writes", self.max_concurrent_writes)?,
            retry: RetryPolicy::new(self.max_attempts, self.retry_initial_delay),
            redelivery: self.redelivery,
        })
    }
}
