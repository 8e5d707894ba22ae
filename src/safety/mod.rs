pub mod failure_recovery;

pub use failure_recovery::{FailureRecovery, RetryExhausted, RetryPolicy};
