//! Per-subject and global token-bucket quotas.

mod analytics;
mod decision;
mod service;
mod tiers;

pub use analytics::{DEFAULT_TOP_N, UsageAnalytics};
pub use decision::{AdmissionDecision, CombinedDecision};
pub use service::{QuotaError, QuotaService, SubjectStatus};
pub use tiers::{
    AI_REQUEST_ACTION, FailurePolicy, GUEST_TIER, METADATA_READ_ACTION, PREMIUM_TIER, QuotaPolicy,
    TierTable, USER_TIER,
};
