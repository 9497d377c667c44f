//! Token-bucket state and the pure refill/consume arithmetic.
//!
//! Nothing in here touches storage or the clock; callers pass `now_ms`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Identifier used for the single shared bucket of every action.
pub const GLOBAL_IDENTIFIER: &str = "global";
const SUBJECT_IDENTIFIER_PREFIX: &str = "user:";

/// Tier name reported for operators, who bypass every bucket.
pub const OPERATOR_TIER: &str = "operator";
/// Tier name reported when the quota store could not be consulted.
pub const UNKNOWN_TIER: &str = "unknown";
/// Tier name reported on global-limit decisions.
pub const GLOBAL_TIER: &str = "global";

/// Capacity envelope shared by tiers and per-action global limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLimits {
    /// Tokens a fresh bucket starts with.
    pub capacity: u64,
    /// Tokens added per elapsed second.
    pub refill_rate: u64,
    /// Hard ceiling on stored tokens.
    pub max_burst: u64,
}

impl BucketLimits {
    pub fn new(capacity: u64, refill_rate: u64, max_burst: u64) -> Result<Self, DomainError> {
        let limits = Self {
            capacity,
            refill_rate,
            max_burst,
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.capacity == 0 {
            return Err(DomainError::invalid_limits("capacity must be greater than zero"));
        }
        if self.refill_rate == 0 {
            return Err(DomainError::invalid_limits(
                "refill_rate must be greater than zero",
            ));
        }
        if self.max_burst < self.capacity {
            return Err(DomainError::invalid_limits(format!(
                "max_burst ({}) must be at least capacity ({})",
                self.max_burst, self.capacity
            )));
        }
        Ok(())
    }
}

/// Named quota profile assignable to a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub name: String,
    pub limits: BucketLimits,
    /// Higher wins when precedence matters; unique across a tier table.
    pub priority: u32,
}

/// Whose bucket is being touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketScope {
    Subject(String),
    Global,
}

impl BucketScope {
    /// Storage identifier; subject and global namespaces never collide.
    pub fn identifier(&self) -> String {
        match self {
            BucketScope::Subject(subject) => format!("{SUBJECT_IDENTIFIER_PREFIX}{subject}"),
            BucketScope::Global => GLOBAL_IDENTIFIER.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BucketScope::Subject(_) => "user",
            BucketScope::Global => "global",
        }
    }
}

/// Live quota state for one (identifier, action) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    pub identifier: String,
    pub action: String,
    pub tokens: u64,
    pub last_refill_ms: i64,
    pub tier: String,
}

impl BucketState {
    /// A bucket seen for the first time starts full at `capacity`.
    pub fn seeded(
        identifier: impl Into<String>,
        action: impl Into<String>,
        tier: impl Into<String>,
        limits: &BucketLimits,
        now_ms: i64,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            action: action.into(),
            tokens: limits.capacity.min(limits.max_burst),
            last_refill_ms: now_ms,
            tier: tier.into(),
        }
    }

    /// Lazily credit tokens accrued since the last refill. Returns tokens added.
    ///
    /// `last_refill_ms` only advances when at least one whole token was
    /// credited, so sub-token elapsed time keeps accumulating.
    pub fn refill(&mut self, limits: &BucketLimits, now_ms: i64) -> u64 {
        // a lowered tier can leave a bucket above its new ceiling
        self.tokens = self.tokens.min(limits.max_burst);

        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed_ms <= 0 {
            return 0;
        }

        let elapsed_ms = elapsed_ms as u128;
        let to_add = elapsed_ms * u128::from(limits.refill_rate) / 1_000;
        if to_add == 0 {
            return 0;
        }

        let to_add = u64::try_from(to_add).unwrap_or(u64::MAX);
        self.tokens = self.tokens.saturating_add(to_add).min(limits.max_burst);
        self.last_refill_ms = now_ms;
        to_add
    }

    /// Deduct `cost` if affordable.
    pub fn try_consume(&mut self, cost: u64) -> bool {
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Epoch ms at which the bucket is expected to hold `target` tokens.
    ///
    /// `target` is clamped to `max_burst`, the most a bucket can ever hold.
    pub fn time_until(&self, limits: &BucketLimits, target: u64, now_ms: i64) -> i64 {
        let target = target.min(limits.max_burst);
        if self.tokens >= target {
            return now_ms;
        }

        let deficit = u128::from(target - self.tokens);
        let rate = u128::from(limits.refill_rate.max(1));
        let wait_ms = (deficit * 1_000).div_ceil(rate);
        let wait_ms = i64::try_from(wait_ms).unwrap_or(i64::MAX);

        self.last_refill_ms.saturating_add(wait_ms).max(now_ms)
    }
}

/// Whole seconds until `reset_time_ms`, never less than one.
pub fn retry_after_secs(reset_time_ms: i64, now_ms: i64) -> u64 {
    let wait_ms = reset_time_ms.saturating_sub(now_ms).max(0) as u64;
    wait_ms.div_ceil(1_000).max(1)
}

/// Append-only audit entry written for every governed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub subject_id: String,
    pub action: String,
    pub timestamp_ms: i64,
    pub tokens_consumed: u64,
    pub tier: String,
    pub allowed: bool,
    /// `user` or `global` when the request was blocked.
    pub limited_by: Option<String>,
}

/// Usage records aggregated over a time window.
///
/// Rankings are highest count first, ties broken by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub tokens_consumed: u64,
    pub top_subjects: Vec<(String, u64)>,
    pub top_actions: Vec<(String, u64)>,
    pub tier_distribution: BTreeMap<String, u64>,
}
