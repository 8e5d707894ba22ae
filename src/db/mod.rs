//! Database module for the ingestion destination
//!
//! This module provides the PostgreSQL pool, the destination store the
//! ingestion core writes through, and checkpoint persistence.

pub mod connection;
pub mod destination;
pub mod memory;
pub mod progress_repo;
pub mod sql;

pub use connection::{init_pool, DbPool};
pub use destination::{with_timeout, CreateOutcome, DestinationStore, PgDestination};
pub use memory::MemoryDestination;
pub use progress_repo::PgCheckpointStore;
