//! Tier table and the rest of the quota policy, built once at start-up.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::error::DomainError;
use crate::domain::quota::{BucketLimits, Tier};

pub const GUEST_TIER: &str = "guest";
pub const USER_TIER: &str = "user";
pub const PREMIUM_TIER: &str = "premium";

pub const AI_REQUEST_ACTION: &str = "ai_request";
pub const METADATA_READ_ACTION: &str = "metadata_read";

const DEFAULT_USAGE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// What a check reports when the quota store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Open => "open",
            FailurePolicy::Closed => "closed",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" | "fail-open" => Ok(FailurePolicy::Open),
            "closed" | "fail-closed" => Ok(FailurePolicy::Closed),
            other => Err(format!("unknown failure policy `{other}`")),
        }
    }
}

/// Known tiers plus the fallback used for unassigned or unknown names.
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: HashMap<String, Tier>,
    default_tier: String,
}

impl TierTable {
    pub fn new(tiers: Vec<Tier>, default_tier: impl Into<String>) -> Result<Self, DomainError> {
        let default_tier = default_tier.into();
        let mut by_name: HashMap<String, Tier> = HashMap::with_capacity(tiers.len());
        let mut by_priority: HashMap<u32, String> = HashMap::with_capacity(tiers.len());

        for tier in tiers {
            tier.limits.validate().map_err(|err| match err {
                DomainError::InvalidLimits { message } => {
                    DomainError::invalid_limits(format!("tier `{}`: {message}", tier.name))
                }
                other => other,
            })?;

            if let Some(first) = by_priority.insert(tier.priority, tier.name.clone()) {
                return Err(DomainError::DuplicatePriority {
                    priority: tier.priority,
                    first,
                    second: tier.name,
                });
            }
            by_name.insert(tier.name.clone(), tier);
        }

        if !by_name.contains_key(&default_tier) {
            return Err(DomainError::unknown_tier(default_tier));
        }

        Ok(Self {
            tiers: by_name,
            default_tier,
        })
    }

    /// guest 100/10/150, user 1000/50/1500, premium 5000/100/7500.
    pub fn reference() -> Self {
        let tiers = vec![
            reference_tier(GUEST_TIER, 100, 10, 150, 10),
            reference_tier(USER_TIER, 1_000, 50, 1_500, 20),
            reference_tier(PREMIUM_TIER, 5_000, 100, 7_500, 30),
        ];
        let tiers = tiers
            .into_iter()
            .map(|tier| (tier.name.clone(), tier))
            .collect();
        Self {
            tiers,
            default_tier: GUEST_TIER.to_string(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tiers.contains_key(name)
    }

    pub fn default_tier(&self) -> &Tier {
        // presence is checked in `new`; `reference` always carries guest
        &self.tiers[&self.default_tier]
    }

    /// Resolve an assigned name, falling back to the default tier.
    pub fn resolve(&self, assigned: Option<&str>) -> &Tier {
        assigned
            .and_then(|name| self.tiers.get(name))
            .unwrap_or_else(|| self.default_tier())
    }

    /// Tiers ordered from highest to lowest priority.
    pub fn by_priority(&self) -> Vec<&Tier> {
        let mut tiers: Vec<&Tier> = self.tiers.values().collect();
        tiers.sort_by(|a, b| b.priority.cmp(&a.priority));
        tiers
    }
}

fn reference_tier(name: &str, capacity: u64, refill_rate: u64, max_burst: u64, priority: u32) -> Tier {
    Tier {
        name: name.to_string(),
        limits: BucketLimits {
            capacity,
            refill_rate,
            max_burst,
        },
        priority,
    }
}

/// Everything the quota service needs to know, passed in explicitly.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub tiers: TierTable,
    /// Per-action global envelopes; actions absent here are not globally limited.
    pub global_limits: HashMap<String, BucketLimits>,
    pub failure_policy: FailurePolicy,
    pub usage_retention: Duration,
    /// Subjects that bypass every check.
    pub operators: Vec<String>,
    /// Initial subject to tier-name assignments.
    pub assignments: HashMap<String, String>,
}

impl QuotaPolicy {
    pub fn reference() -> Self {
        let global_limits = HashMap::from([
            (
                AI_REQUEST_ACTION.to_string(),
                BucketLimits {
                    capacity: 20_000,
                    refill_rate: 200,
                    max_burst: 30_000,
                },
            ),
            (
                METADATA_READ_ACTION.to_string(),
                BucketLimits {
                    capacity: 100_000,
                    refill_rate: 2_000,
                    max_burst: 150_000,
                },
            ),
        ]);

        Self {
            tiers: TierTable::reference(),
            global_limits,
            failure_policy: FailurePolicy::Open,
            usage_retention: DEFAULT_USAGE_RETENTION,
            operators: Vec::new(),
            assignments: HashMap::new(),
        }
    }

    pub fn global_limit(&self, action: &str) -> Option<&BucketLimits> {
        self.global_limits.get(action)
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_table_matches_documented_defaults() {
        let table = TierTable::reference();
        let guest = table.get(GUEST_TIER).expect("guest");
        assert_eq!(guest.limits, BucketLimits::new(100, 10, 150).expect("valid"));
        let user = table.get(USER_TIER).expect("user");
        assert_eq!(user.limits, BucketLimits::new(1_000, 50, 1_500).expect("valid"));
        let premium = table.get(PREMIUM_TIER).expect("premium");
        assert_eq!(
            premium.limits,
            BucketLimits::new(5_000, 100, 7_500).expect("valid")
        );
    }

    #[test]
    fn unknown_or_missing_names_resolve_to_default() {
        let table = TierTable::reference();
        assert_eq!(table.resolve(None).name, GUEST_TIER);
        assert_eq!(table.resolve(Some("platinum")).name, GUEST_TIER);
        assert_eq!(table.resolve(Some(PREMIUM_TIER)).name, PREMIUM_TIER);
    }

    #[test]
    fn priorities_must_be_unique() {
        let tiers = vec![
            reference_tier("a", 10, 1, 10, 1),
            reference_tier("b", 10, 1, 10, 1),
        ];
        let err = TierTable::new(tiers, "a").expect_err("duplicate priority");
        assert!(matches!(err, DomainError::DuplicatePriority { priority: 1, .. }));
    }

    #[test]
    fn default_tier_must_exist() {
        let tiers = vec![reference_tier("a", 10, 1, 10, 1)];
        let err = TierTable::new(tiers, "guest").expect_err("missing default");
        assert!(matches!(err, DomainError::UnknownTier { .. }));
    }

    #[test]
    fn invalid_limits_name_the_tier() {
        let tiers = vec![reference_tier("broken", 10, 1, 5, 1)];
        let err = TierTable::new(tiers, "broken").expect_err("burst below capacity");
        assert!(err.to_string().contains("tier `broken`"));
    }

    #[test]
    fn by_priority_orders_highest_first() {
        let table = TierTable::reference();
        let names: Vec<&str> = table
            .by_priority()
            .into_iter()
            .map(|tier| tier.name.as_str())
            .collect();
        assert_eq!(names, vec![PREMIUM_TIER, USER_TIER, GUEST_TIER]);
    }

    #[test]
    fn failure_policy_parses_aliases() {
        assert_eq!("open".parse::<FailurePolicy>(), Ok(FailurePolicy::Open));
        assert_eq!(
            "Fail-Closed".parse::<FailurePolicy>(),
            Ok(FailurePolicy::Closed)
        );
        assert!("maybe".parse::<FailurePolicy>().is_err());
    }
}
