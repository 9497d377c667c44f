//! In-memory repositories.
//!
//! Used when no database URL is configured and by tests. State is lost on
//! restart and is not shared between processes.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::application::repos::{BucketsRepo, RepoError, UsageRepo};
use crate::domain::quota::{BucketState, UsageRecord, UsageSummary};

#[derive(Debug, Default)]
pub struct MemoryRepositories {
    buckets: DashMap<(String, String), BucketState>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one bucket.
    pub fn bucket(&self, identifier: &str, action: &str) -> Option<BucketState> {
        self.buckets
            .get(&(identifier.to_string(), action.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub async fn usage_len(&self) -> usize {
        self.usage.read().await.len()
    }
}

#[async_trait]
impl BucketsRepo for MemoryRepositories {
    async fn load_bucket(
        &self,
        identifier: &str,
        action: &str,
    ) -> Result<Option<BucketState>, RepoError> {
        Ok(self.bucket(identifier, action))
    }

    async fn save_bucket(&self, bucket: &BucketState) -> Result<(), RepoError> {
        self.buckets.insert(
            (bucket.identifier.clone(), bucket.action.clone()),
            bucket.clone(),
        );
        Ok(())
    }

    async fn delete_buckets(&self, identifier: &str) -> Result<u64, RepoError> {
        let before = self.buckets.len();
        self.buckets.retain(|(id, _), _| id != identifier);
        Ok((before - self.buckets.len()) as u64)
    }

    async fn delete_all_buckets(&self) -> Result<u64, RepoError> {
        let removed = self.buckets.len() as u64;
        self.buckets.clear();
        Ok(removed)
    }
}

#[async_trait]
impl UsageRepo for MemoryRepositories {
    async fn append_usage(&self, record: &UsageRecord) -> Result<(), RepoError> {
        self.usage.write().await.push(record.clone());
        Ok(())
    }

    async fn summarize_usage(
        &self,
        since_ms: i64,
        top_n: usize,
    ) -> Result<UsageSummary, RepoError> {
        let usage = self.usage.read().await;
        let mut summary = UsageSummary::default();
        let mut tokens = 0_u128;
        let mut subjects: HashMap<&str, u64> = HashMap::new();
        let mut actions: HashMap<&str, u64> = HashMap::new();
        let mut tiers: BTreeMap<String, u64> = BTreeMap::new();

        for record in usage.iter().filter(|record| record.timestamp_ms >= since_ms) {
            summary.total_requests += 1;
            if record.allowed {
                summary.allowed_requests += 1;
            }
            tokens += u128::from(record.tokens_consumed);
            *subjects.entry(record.subject_id.as_str()).or_default() += 1;
            *actions.entry(record.action.as_str()).or_default() += 1;
            *tiers.entry(record.tier.clone()).or_default() += 1;
        }

        summary.tokens_consumed = u64::try_from(tokens).unwrap_or(u64::MAX);
        summary.top_subjects = top_n_by_count(subjects, top_n);
        summary.top_actions = top_n_by_count(actions, top_n);
        summary.tier_distribution = tiers;
        Ok(summary)
    }

    async fn purge_usage_before(&self, cutoff_ms: i64) -> Result<u64, RepoError> {
        let mut usage = self.usage.write().await;
        let before = usage.len();
        usage.retain(|record| record.timestamp_ms >= cutoff_ms);
        Ok((before - usage.len()) as u64)
    }
}

fn top_n_by_count(counts: HashMap<&str, u64>, n: usize) -> Vec<(String, u64)> {
    let mut ranked: Vec<(String, u64)> = counts
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(n);
    ranked
}
