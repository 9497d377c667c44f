//! Wire types shared by the tollgate admin API and its clients.
//!
//! Everything here serialises as camelCase JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which limiter rejected a governed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitedBy {
    User,
    Global,
}

impl LimitedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitedBy::User => "user",
            LimitedBy::Global => "global",
        }
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResult {
    pub allowed: bool,
    /// Omitted when no bucket limits the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_remaining: Option<u64>,
    /// Epoch milliseconds.
    pub reset_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub tier: String,
    pub exceeded: bool,
}

/// Body returned with a `429 Too Many Requests`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRejection {
    pub error: ErrorMessage,
    pub limited_by: LimitedBy,
    pub tier: String,
    /// Omitted when the cost can never be covered by waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub tokens_remaining: u64,
    pub reset_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub total_size_bytes: u64,
    pub max_entries: u64,
    pub max_size_bytes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedCount {
    pub name: String,
    pub requests: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAnalyticsResponse {
    pub window_days: u32,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub average_tokens_per_request: f64,
    pub top_subjects: Vec<RankedCount>,
    pub top_actions: Vec<RankedCount>,
    pub tier_distribution: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierView {
    pub name: String,
    pub capacity: u64,
    pub refill_rate: u64,
    pub max_burst: u64,
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectView {
    pub subject: String,
    pub tier: String,
    pub operator: bool,
    /// Name stored for the subject, even when it no longer resolves to a known tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_tier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetTierRequest {
    pub tier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub buckets_removed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResponse {
    pub removed: u64,
}

/// Body of `POST /v1/admission`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub subject: String,
    pub action: String,
    #[serde(default = "default_cost")]
    pub cost: u64,
}

fn default_cost() -> u64 {
    1
}

/// Both checks of an admitted call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub allowed: bool,
    pub subject: AdmissionResult,
    pub global: AdmissionResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_serialises_camel_case() {
        let body = RateLimitRejection {
            error: ErrorMessage {
                code: "rate_limited".to_string(),
                message: "Rate limit exceeded".to_string(),
                hint: None,
            },
            limited_by: LimitedBy::Global,
            tier: "user".to_string(),
            retry_after: Some(3),
            tokens_remaining: 0,
            reset_time: 1_000,
        };

        let value = serde_json::to_value(&body).expect("serialise");
        assert_eq!(value["limitedBy"], "global");
        assert_eq!(value["retryAfter"], 3);
        assert_eq!(value["tokensRemaining"], 0);
        assert!(value["error"].get("hint").is_none());
    }

    #[test]
    fn admission_result_omits_retry_after_when_allowed() {
        let result = AdmissionResult {
            allowed: true,
            tokens_remaining: Some(90),
            reset_time: 0,
            retry_after: None,
            tier: "guest".to_string(),
            exceeded: false,
        };

        let value = serde_json::to_value(&result).expect("serialise");
        assert!(value.get("retryAfter").is_none());
        assert_eq!(value["tokensRemaining"], 90);

        let unlimited = AdmissionResult {
            tokens_remaining: None,
            tier: "operator".to_string(),
            ..result
        };
        let value = serde_json::to_value(&unlimited).expect("serialise");
        assert!(value.get("tokensRemaining").is_none());
    }

    #[test]
    fn admission_request_defaults_cost_to_one() {
        let request: AdmissionRequest =
            serde_json::from_str(r#"{"subject":"u1","action":"metadata_read"}"#)
                .expect("deserialise");
        assert_eq!(request.cost, 1);
    }
}
