use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use metrics::counter;
use thiserror::Error;
use tollgate_api_types::LimitedBy;
use tracing::{debug, info, warn};

use crate::application::repos::{BucketsRepo, RepoError, UsageRepo};
use crate::domain::error::DomainError;
use crate::domain::quota::{
    BucketLimits, BucketScope, BucketState, GLOBAL_TIER, OPERATOR_TIER, Tier, UsageRecord,
};
use crate::util::clock::Clock;

use super::analytics::UsageAnalytics;
use super::decision::{AdmissionDecision, CombinedDecision};
use super::tiers::QuotaPolicy;

const METRIC_QUOTA_DECISION_TOTAL: &str = "tollgate_quota_decision_total";
const METRIC_QUOTA_STORE_ERROR_TOTAL: &str = "tollgate_quota_store_error_total";
const MS_PER_DAY: i64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Tier and operator status of one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectStatus {
    pub subject: String,
    /// Tier checks would apply right now.
    pub effective_tier: String,
    pub operator: bool,
    pub assigned_tier: Option<String>,
}

/// Token-bucket admission control over subject tiers and per-action global envelopes.
pub struct QuotaService {
    buckets: Arc<dyn BucketsRepo>,
    usage: Arc<dyn UsageRepo>,
    policy: QuotaPolicy,
    assignments: DashMap<String, String>,
    operators: DashSet<String>,
    clock: Arc<dyn Clock>,
}

impl QuotaService {
    pub fn new(
        buckets: Arc<dyn BucketsRepo>,
        usage: Arc<dyn UsageRepo>,
        policy: QuotaPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let assignments = policy
            .assignments
            .iter()
            .map(|(subject, tier)| (subject.clone(), tier.clone()))
            .collect();
        let operators = policy.operators.iter().cloned().collect();

        Self {
            buckets,
            usage,
            policy,
            assignments,
            operators,
            clock,
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn is_operator(&self, subject: &str) -> bool {
        self.operators.contains(subject)
    }

    /// Tier applied to `subject`, falling back to the default tier.
    pub fn resolve_tier(&self, subject: &str) -> Tier {
        let assigned = self.assignments.get(subject).map(|entry| entry.value().clone());
        if let Some(name) = assigned.as_deref()
            && !self.policy.tiers.contains(name)
        {
            warn!(
                target = "tollgate::quota",
                subject,
                assigned_tier = name,
                fallback = %self.policy.tiers.default_tier().name,
                "subject assigned to unknown tier"
            );
        }
        self.policy.tiers.resolve(assigned.as_deref()).clone()
    }

    /// Charge `cost` against the subject's bucket for `action`.
    pub async fn check_subject_limit(
        &self,
        subject: &str,
        action: &str,
        cost: u64,
    ) -> AdmissionDecision {
        let now_ms = self.clock.now_ms();
        let decision = if self.is_operator(subject) {
            AdmissionDecision::bypass(now_ms)
        } else {
            self.evaluate_subject(subject, action, cost, now_ms).await
        };

        let limited_by = (!decision.allowed).then_some(LimitedBy::User);
        let charged = if decision.allowed { cost } else { 0 };
        self.record_usage(
            subject,
            action,
            charged,
            &decision.tier,
            decision.allowed,
            limited_by,
            now_ms,
        )
        .await;

        decision
    }

    /// Charge `cost` against the action's shared bucket, regardless of subject.
    pub async fn check_global_limit(&self, action: &str, cost: u64) -> AdmissionDecision {
        let now_ms = self.clock.now_ms();
        self.evaluate_global(action, cost, now_ms).await
    }

    /// Run subject and global checks without short-circuiting.
    ///
    /// Both buckets are charged whenever each can afford the cost, even when
    /// the other rejects.
    pub async fn check_both(&self, subject: &str, action: &str, cost: u64) -> CombinedDecision {
        let now_ms = self.clock.now_ms();

        let combined = if self.is_operator(subject) {
            CombinedDecision {
                subject: AdmissionDecision::bypass(now_ms),
                global: AdmissionDecision::bypass(now_ms),
            }
        } else {
            let (subject_decision, global_decision) = tokio::join!(
                self.evaluate_subject(subject, action, cost, now_ms),
                self.evaluate_global(action, cost, now_ms),
            );
            CombinedDecision {
                subject: subject_decision,
                global: global_decision,
            }
        };

        let charged = if combined.subject.allowed { cost } else { 0 };
        self.record_usage(
            subject,
            action,
            charged,
            &combined.subject.tier,
            combined.allowed(),
            combined.limited_by(),
            now_ms,
        )
        .await;

        combined
    }

    async fn evaluate_subject(
        &self,
        subject: &str,
        action: &str,
        cost: u64,
        now_ms: i64,
    ) -> AdmissionDecision {
        let tier = self.resolve_tier(subject);
        let scope = BucketScope::Subject(subject.to_string());
        match self
            .consume(&scope, action, cost, &tier.name, &tier.limits, now_ms)
            .await
        {
            Ok(decision) => decision,
            Err(err) => self.degrade(&scope, action, err, now_ms),
        }
    }

    async fn evaluate_global(&self, action: &str, cost: u64, now_ms: i64) -> AdmissionDecision {
        let Some(limits) = self.policy.global_limit(action) else {
            return AdmissionDecision::unlimited(now_ms, GLOBAL_TIER);
        };

        let scope = BucketScope::Global;
        match self
            .consume(&scope, action, cost, GLOBAL_TIER, limits, now_ms)
            .await
        {
            Ok(decision) => decision,
            Err(err) => self.degrade(&scope, action, err, now_ms),
        }
    }

    /// Load or seed, refill, try to deduct, persist.
    async fn consume(
        &self,
        scope: &BucketScope,
        action: &str,
        cost: u64,
        tier: &str,
        limits: &BucketLimits,
        now_ms: i64,
    ) -> Result<AdmissionDecision, RepoError> {
        let identifier = scope.identifier();
        let mut bucket = match self.buckets.load_bucket(&identifier, action).await? {
            Some(bucket) => bucket,
            None => BucketState::seeded(identifier, action, tier, limits, now_ms),
        };

        bucket.tier = tier.to_string();
        bucket.refill(limits, now_ms);
        let allowed = bucket.try_consume(cost);
        self.buckets.save_bucket(&bucket).await?;

        let outcome = if allowed { "allowed" } else { "rejected" };
        counter!(METRIC_QUOTA_DECISION_TOTAL, "scope" => scope.label(), "outcome" => outcome)
            .increment(1);

        if allowed {
            let reset_time_ms = bucket.time_until(limits, limits.capacity, now_ms);
            Ok(AdmissionDecision::admitted(bucket.tokens, reset_time_ms, tier))
        } else if cost > limits.max_burst {
            debug!(
                target = "tollgate::quota",
                scope = scope.label(),
                identifier = %bucket.identifier,
                action,
                cost,
                max_burst = limits.max_burst,
                tier,
                "cost exceeds burst size"
            );
            Ok(AdmissionDecision::over_burst(bucket.tokens, now_ms, tier))
        } else {
            let reset_time_ms = bucket.time_until(limits, cost, now_ms);
            debug!(
                target = "tollgate::quota",
                scope = scope.label(),
                identifier = %bucket.identifier,
                action,
                cost,
                tokens = bucket.tokens,
                tier,
                "quota exceeded"
            );
            Ok(AdmissionDecision::rejected(
                bucket.tokens,
                reset_time_ms,
                now_ms,
                tier,
            ))
        }
    }

    fn degrade(
        &self,
        scope: &BucketScope,
        action: &str,
        err: RepoError,
        now_ms: i64,
    ) -> AdmissionDecision {
        let policy = self.policy.failure_policy;
        warn!(
            target = "tollgate::quota",
            scope = scope.label(),
            action,
            error = %err,
            failure_policy = policy.as_str(),
            "quota store unavailable, applying failure policy"
        );
        counter!(METRIC_QUOTA_STORE_ERROR_TOTAL, "scope" => scope.label(), "policy" => policy.as_str())
            .increment(1);
        AdmissionDecision::degraded(policy, now_ms)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_usage(
        &self,
        subject: &str,
        action: &str,
        tokens_consumed: u64,
        tier: &str,
        allowed: bool,
        limited_by: Option<LimitedBy>,
        now_ms: i64,
    ) {
        let record = UsageRecord {
            subject_id: subject.to_string(),
            action: action.to_string(),
            timestamp_ms: now_ms,
            tokens_consumed,
            tier: tier.to_string(),
            allowed,
            limited_by: limited_by.map(|limiter| limiter.as_str().to_string()),
        };

        if tier == OPERATOR_TIER {
            info!(
                target = "tollgate::quota::audit",
                subject,
                action,
                cost = tokens_consumed,
                "operator request bypassed quota"
            );
        }

        // usage is audit data; losing a row must not change the decision
        if let Err(err) = self.usage.append_usage(&record).await {
            warn!(
                target = "tollgate::quota",
                subject,
                action,
                error = %err,
                "failed to record usage"
            );
        }
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Drop every bucket of `subject`. Unknown subjects are a no-op.
    pub async fn reset_subject(&self, subject: &str) -> Result<u64, QuotaError> {
        let identifier = BucketScope::Subject(subject.to_string()).identifier();
        let removed = self.buckets.delete_buckets(&identifier).await?;
        info!(target = "tollgate::quota", subject, removed, "subject quota reset");
        Ok(removed)
    }

    /// Drop all subject and global buckets. Usage history is kept.
    pub async fn reset_all(&self) -> Result<u64, QuotaError> {
        let removed = self.buckets.delete_all_buckets().await?;
        info!(target = "tollgate::quota", removed, "all quota buckets reset");
        Ok(removed)
    }

    pub fn set_subject_tier(&self, subject: &str, tier: &str) -> Result<(), QuotaError> {
        if !self.policy.tiers.contains(tier) {
            return Err(DomainError::unknown_tier(tier).into());
        }
        self.assignments
            .insert(subject.to_string(), tier.to_string());
        info!(target = "tollgate::quota", subject, tier, "subject tier assigned");
        Ok(())
    }

    /// Returns whether an assignment existed.
    pub fn clear_subject_tier(&self, subject: &str) -> bool {
        self.assignments.remove(subject).is_some()
    }

    /// Returns whether the subject was newly added.
    pub fn add_operator(&self, subject: &str) -> bool {
        let added = self.operators.insert(subject.to_string());
        if added {
            info!(target = "tollgate::quota", subject, "operator added");
        }
        added
    }

    /// Returns whether the subject was an operator.
    pub fn remove_operator(&self, subject: &str) -> bool {
        let removed = self.operators.remove(subject).is_some();
        if removed {
            info!(target = "tollgate::quota", subject, "operator removed");
        }
        removed
    }

    pub fn subject_status(&self, subject: &str) -> SubjectStatus {
        let operator = self.is_operator(subject);
        let assigned_tier = self.assignments.get(subject).map(|entry| entry.value().clone());
        let effective_tier = if operator {
            OPERATOR_TIER.to_string()
        } else {
            self.policy.tiers.resolve(assigned_tier.as_deref()).name.clone()
        };

        SubjectStatus {
            subject: subject.to_string(),
            effective_tier,
            operator,
            assigned_tier,
        }
    }

    /// Configured tiers, highest priority first.
    pub fn tiers(&self) -> Vec<&Tier> {
        self.policy.tiers.by_priority()
    }

    // ------------------------------------------------------------------
    // Analytics and retention
    // ------------------------------------------------------------------

    pub async fn analytics(
        &self,
        window_days: u32,
        top_n: usize,
    ) -> Result<UsageAnalytics, QuotaError> {
        let since_ms = self
            .clock
            .now_ms()
            .saturating_sub(i64::from(window_days).saturating_mul(MS_PER_DAY));
        let summary = self.usage.summarize_usage(since_ms, top_n).await?;
        Ok(UsageAnalytics::from_summary(window_days, summary))
    }

    /// Delete usage records older than the retention window.
    pub async fn purge_expired_usage(&self) -> Result<u64, QuotaError> {
        let retention_ms = i64::try_from(self.policy.usage_retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff_ms = self.clock.now_ms().saturating_sub(retention_ms);
        let removed = self.usage.purge_usage_before(cutoff_ms).await?;
        if removed > 0 {
            info!(target = "tollgate::quota", removed, cutoff_ms, "purged expired usage records");
        }
        Ok(removed)
    }
}
