//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::quota::{BucketState, UsageRecord, UsageSummary};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("persistence unavailable")]
    Unavailable,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Token-bucket rows (`rate_limits`).
///
/// Load and save are separate round-trips; two in-flight checks against the
/// same bucket can each observe the pre-deduction balance.
#[async_trait]
pub trait BucketsRepo: Send + Sync {
    async fn load_bucket(
        &self,
        identifier: &str,
        action: &str,
    ) -> Result<Option<BucketState>, RepoError>;

    /// Insert or overwrite the row for `(identifier, action)`.
    async fn save_bucket(&self, bucket: &BucketState) -> Result<(), RepoError>;

    /// Remove every action bucket of one identifier, returning rows removed.
    async fn delete_buckets(&self, identifier: &str) -> Result<u64, RepoError>;

    async fn delete_all_buckets(&self) -> Result<u64, RepoError>;
}

/// Append-only usage audit (`usage_stats`).
#[async_trait]
pub trait UsageRepo: Send + Sync {
    async fn append_usage(&self, record: &UsageRecord) -> Result<(), RepoError>;

    /// Aggregate of records with `timestamp_ms >= since_ms`; each ranking
    /// holds at most `top_n` names.
    async fn summarize_usage(
        &self,
        since_ms: i64,
        top_n: usize,
    ) -> Result<UsageSummary, RepoError>;

    /// Delete records with `timestamp_ms < cutoff_ms`, returning rows removed.
    async fn purge_usage_before(&self, cutoff_ms: i64) -> Result<u64, RepoError>;
}
