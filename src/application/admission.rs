//! Admission facade: cache lookup, quota check, handler, cache store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tollgate_api_types::{ErrorMessage, LimitedBy, RateLimitRejection};
use tracing::{debug, instrument};

use crate::application::quota::{CombinedDecision, QuotaService};
use crate::cache::{CacheHit, CacheKey, CachedResponse, ResponseCache, log_store_failure};

const METRIC_ADMISSION_TOTAL: &str = "tollgate_admission_total";

/// Where and for how long a successful response may be cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirective {
    pub key: CacheKey,
    pub ttl: Duration,
}

/// One unit of governed work.
#[derive(Debug, Clone)]
pub struct GovernedCall {
    pub subject: String,
    pub action: String,
    pub cost: u64,
    /// `None` marks the call as uncacheable.
    pub cache: Option<CacheDirective>,
}

impl GovernedCall {
    pub fn new(subject: impl Into<String>, action: impl Into<String>, cost: u64) -> Self {
        Self {
            subject: subject.into(),
            action: action.into(),
            cost,
            cache: None,
        }
    }

    pub fn cached(mut self, key: CacheKey, ttl: Duration) -> Self {
        self.cache = Some(CacheDirective { key, ttl });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// Not enough tokens right now; waiting helps.
    Exhausted,
    /// The cost is above the limit's burst size; waiting never helps.
    CostExceedsBurst,
}

impl RejectionReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectionReason::Exhausted => "rate_limited",
            RejectionReason::CostExceedsBurst => "cost_exceeds_burst",
        }
    }
}

/// Why a call was refused, with the figures of the binding limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub limited_by: LimitedBy,
    pub reason: RejectionReason,
    pub tier: String,
    /// `None` for [`RejectionReason::CostExceedsBurst`].
    pub retry_after_secs: Option<u64>,
    pub tokens_remaining: u64,
    pub reset_time_ms: i64,
}

impl Rejection {
    fn from_decision(decision: &CombinedDecision) -> Option<Self> {
        let limited_by = decision.limited_by()?;
        let binding = decision.binding();
        let (reason, retry_after_secs) = if binding.over_burst {
            (RejectionReason::CostExceedsBurst, None)
        } else {
            (
                RejectionReason::Exhausted,
                Some(binding.retry_after_secs.unwrap_or(1)),
            )
        };
        Some(Self {
            limited_by,
            reason,
            tier: binding.tier.clone(),
            retry_after_secs,
            tokens_remaining: binding.tokens_remaining.unwrap_or_default(),
            reset_time_ms: binding.reset_time_ms,
        })
    }
}

impl From<&Rejection> for RateLimitRejection {
    fn from(rejection: &Rejection) -> Self {
        let message = match (rejection.reason, rejection.limited_by) {
            (RejectionReason::CostExceedsBurst, _) => {
                "Request cost exceeds the limit's burst size"
            }
            (RejectionReason::Exhausted, LimitedBy::User) => "Rate limit exceeded",
            (RejectionReason::Exhausted, LimitedBy::Global) => "Service is at capacity",
        };
        let hint = match rejection.retry_after_secs {
            Some(secs) => format!("Retry after {secs} seconds"),
            None => format!(
                "Lower the cost or move to a larger tier than `{}`",
                rejection.tier
            ),
        };
        Self {
            error: ErrorMessage {
                code: rejection.reason.code().to_string(),
                message: message.to_string(),
                hint: Some(hint),
            },
            limited_by: rejection.limited_by,
            tier: rejection.tier.clone(),
            retry_after: rejection.retry_after_secs,
            tokens_remaining: rejection.tokens_remaining,
            reset_time: rejection.reset_time_ms,
        }
    }
}

/// Result of [`Governor::execute`].
#[derive(Debug)]
pub enum Admission {
    /// Served from cache; quota untouched.
    Cached(CacheHit),
    Fresh {
        response: CachedResponse,
        decision: CombinedDecision,
    },
    Rejected(Rejection),
}

/// Composes the quota service and the response cache.
#[derive(Clone)]
pub struct Governor {
    quota: Arc<QuotaService>,
    cache: Arc<ResponseCache>,
}

impl Governor {
    pub fn new(quota: Arc<QuotaService>, cache: Arc<ResponseCache>) -> Self {
        Self { quota, cache }
    }

    pub fn quota(&self) -> &Arc<QuotaService> {
        &self.quota
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Cached response for a cacheable call, if one is fresh.
    pub fn lookup(&self, directive: &CacheDirective) -> Option<CacheHit> {
        if !self.cache.config().enabled {
            return None;
        }
        let hit = self.cache.get(&directive.key)?;
        debug!(outcome = "cached", key = %directive.key, "serving cached response");
        counter!(METRIC_ADMISSION_TOTAL, "outcome" => "cached").increment(1);
        Some(hit)
    }

    /// Charge quota for the call.
    pub async fn admit(&self, call: &GovernedCall) -> Result<CombinedDecision, Rejection> {
        let decision = self
            .quota
            .check_both(&call.subject, &call.action, call.cost)
            .await;
        match Rejection::from_decision(&decision) {
            Some(rejection) => {
                debug!(
                    outcome = "rejected",
                    subject = %call.subject,
                    action = %call.action,
                    limited_by = rejection.limited_by.as_str(),
                    reason = rejection.reason.code(),
                    retry_after = ?rejection.retry_after_secs,
                    "governed call rejected"
                );
                counter!(
                    METRIC_ADMISSION_TOTAL,
                    "outcome" => "rejected",
                    "limited_by" => rejection.limited_by.as_str()
                )
                .increment(1);
                Err(rejection)
            }
            None => {
                counter!(METRIC_ADMISSION_TOTAL, "outcome" => "admitted").increment(1);
                Ok(decision)
            }
        }
    }

    /// Cache a successful response. Failures are logged and swallowed.
    pub fn store(&self, directive: &CacheDirective, response: CachedResponse) {
        if !self.cache.config().enabled {
            return;
        }
        if let Err(err) = self.cache.set(directive.key.clone(), response, directive.ttl) {
            log_store_failure(&directive.key, &err);
        }
    }

    /// Run `handler` under governance.
    ///
    /// A cache hit is served without charging quota. A handler error is
    /// returned as-is; the quota already charged for it is not refunded.
    #[instrument(skip_all, fields(subject = %call.subject, action = %call.action, cost = call.cost))]
    pub async fn execute<F, Fut, E>(&self, call: &GovernedCall, handler: F) -> Result<Admission, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, E>>,
    {
        if let Some(directive) = &call.cache
            && let Some(hit) = self.lookup(directive)
        {
            return Ok(Admission::Cached(hit));
        }

        let decision = match self.admit(call).await {
            Ok(decision) => decision,
            Err(rejection) => return Ok(Admission::Rejected(rejection)),
        };

        let response = handler().await?;

        if let Some(directive) = &call.cache {
            self.store(directive, response.clone());
        }

        Ok(Admission::Fresh { response, decision })
    }
}
