//! Usage analytics report built from a repository summary.

use std::collections::BTreeMap;

use tollgate_api_types::{RankedCount, UsageAnalyticsResponse};

use crate::domain::quota::UsageSummary;

pub const DEFAULT_TOP_N: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct UsageAnalytics {
    pub window_days: u32,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub average_tokens_per_request: f64,
    pub top_subjects: Vec<(String, u64)>,
    pub top_actions: Vec<(String, u64)>,
    pub tier_distribution: BTreeMap<String, u64>,
}

impl UsageAnalytics {
    pub fn from_summary(window_days: u32, summary: UsageSummary) -> Self {
        let average_tokens_per_request = if summary.total_requests == 0 {
            0.0
        } else {
            summary.tokens_consumed as f64 / summary.total_requests as f64
        };

        Self {
            window_days,
            total_requests: summary.total_requests,
            allowed_requests: summary.allowed_requests,
            blocked_requests: summary
                .total_requests
                .saturating_sub(summary.allowed_requests),
            average_tokens_per_request,
            top_subjects: summary.top_subjects,
            top_actions: summary.top_actions,
            tier_distribution: summary.tier_distribution,
        }
    }
}

impl From<UsageAnalytics> for UsageAnalyticsResponse {
    fn from(value: UsageAnalytics) -> Self {
        let ranked = |items: Vec<(String, u64)>| {
            items
                .into_iter()
                .map(|(name, requests)| RankedCount { name, requests })
                .collect()
        };

        Self {
            window_days: value.window_days,
            total_requests: value.total_requests,
            allowed_requests: value.allowed_requests,
            blocked_requests: value.blocked_requests,
            average_tokens_per_request: value.average_tokens_per_request,
            top_subjects: ranked(value.top_subjects),
            top_actions: ranked(value.top_actions),
            tier_distribution: value.tier_distribution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zeroes() {
        let report = UsageAnalytics::from_summary(7, UsageSummary::default());
        assert_eq!(report.total_requests, 0);
        assert_eq!(report.blocked_requests, 0);
        assert_eq!(report.average_tokens_per_request, 0.0);
        assert!(report.top_subjects.is_empty());
    }

    #[test]
    fn derives_blocked_count_and_average() {
        let summary = UsageSummary {
            total_requests: 5,
            allowed_requests: 4,
            tokens_consumed: 24,
            ..Default::default()
        };

        let report = UsageAnalytics::from_summary(1, summary);
        assert_eq!(report.blocked_requests, 1);
        assert!((report.average_tokens_per_request - 4.8).abs() < f64::EPSILON);
    }

    #[test]
    fn converts_to_wire_shape() {
        let summary = UsageSummary {
            total_requests: 1,
            allowed_requests: 1,
            tokens_consumed: 10,
            top_subjects: vec![("u1".to_string(), 1)],
            top_actions: vec![("ai_request".to_string(), 1)],
            tier_distribution: BTreeMap::from([("user".to_string(), 1)]),
        };
        let response: UsageAnalyticsResponse = UsageAnalytics::from_summary(30, summary).into();
        assert_eq!(response.window_days, 30);
        assert_eq!(response.top_subjects[0].name, "u1");
        assert_eq!(response.top_subjects[0].requests, 1);
        assert_eq!(response.tier_distribution.get("user"), Some(&1));
    }
}
