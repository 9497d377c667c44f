use tollgate_api_types::{AdmissionResult, LimitedBy};

use crate::domain::quota::{OPERATOR_TIER, UNKNOWN_TIER, retry_after_secs};

use super::tiers::FailurePolicy;

/// Result of a single subject or global check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// `None` when no bucket applies (operators, actions without a global envelope).
    pub tokens_remaining: Option<u64>,
    /// Epoch ms when the bucket is expected to recover.
    pub reset_time_ms: i64,
    /// `None` when admitted, or when no amount of waiting covers the cost.
    pub retry_after_secs: Option<u64>,
    pub tier: String,
    /// The bucket could not cover the cost.
    pub exceeded: bool,
    /// The cost is above the most this bucket can ever hold.
    pub over_burst: bool,
}

impl AdmissionDecision {
    pub(crate) fn admitted(tokens_remaining: u64, reset_time_ms: i64, tier: &str) -> Self {
        Self {
            allowed: true,
            tokens_remaining: Some(tokens_remaining),
            reset_time_ms,
            retry_after_secs: None,
            tier: tier.to_string(),
            exceeded: false,
            over_burst: false,
        }
    }

    pub(crate) fn rejected(
        tokens_remaining: u64,
        reset_time_ms: i64,
        now_ms: i64,
        tier: &str,
    ) -> Self {
        Self {
            allowed: false,
            tokens_remaining: Some(tokens_remaining),
            reset_time_ms,
            retry_after_secs: Some(retry_after_secs(reset_time_ms, now_ms)),
            tier: tier.to_string(),
            exceeded: true,
            over_burst: false,
        }
    }

    /// Rejection for a cost the bucket can never cover.
    pub(crate) fn over_burst(tokens_remaining: u64, now_ms: i64, tier: &str) -> Self {
        Self {
            allowed: false,
            tokens_remaining: Some(tokens_remaining),
            reset_time_ms: now_ms,
            retry_after_secs: None,
            tier: tier.to_string(),
            exceeded: true,
            over_burst: true,
        }
    }

    /// Operators are never charged.
    pub(crate) fn bypass(now_ms: i64) -> Self {
        Self::unlimited(now_ms, OPERATOR_TIER)
    }

    /// Best-effort answer when storage failed.
    pub(crate) fn degraded(policy: FailurePolicy, now_ms: i64) -> Self {
        match policy {
            FailurePolicy::Open => Self::admitted(0, now_ms, UNKNOWN_TIER),
            FailurePolicy::Closed => Self {
                allowed: false,
                tokens_remaining: Some(0),
                reset_time_ms: now_ms + 1_000,
                retry_after_secs: Some(1),
                tier: UNKNOWN_TIER.to_string(),
                exceeded: false,
                over_burst: false,
            },
        }
    }

    pub(crate) fn unlimited(now_ms: i64, tier: &str) -> Self {
        Self {
            tokens_remaining: None,
            ..Self::admitted(0, now_ms, tier)
        }
    }
}

impl From<&AdmissionDecision> for AdmissionResult {
    fn from(decision: &AdmissionDecision) -> Self {
        Self {
            allowed: decision.allowed,
            tokens_remaining: decision.tokens_remaining,
            reset_time: decision.reset_time_ms,
            retry_after: decision.retry_after_secs,
            tier: decision.tier.clone(),
            exceeded: decision.exceeded,
        }
    }
}

/// Subject and global decisions for one governed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedDecision {
    pub subject: AdmissionDecision,
    pub global: AdmissionDecision,
}

impl CombinedDecision {
    pub fn allowed(&self) -> bool {
        self.subject.allowed && self.global.allowed
    }

    /// The subject limit wins when both reject.
    pub fn limited_by(&self) -> Option<LimitedBy> {
        if !self.subject.allowed {
            Some(LimitedBy::User)
        } else if !self.global.allowed {
            Some(LimitedBy::Global)
        } else {
            None
        }
    }

    /// Decision whose figures should be reported to the caller.
    pub fn binding(&self) -> &AdmissionDecision {
        match self.limited_by() {
            Some(LimitedBy::Global) => &self.global,
            _ => &self.subject,
        }
    }
}
