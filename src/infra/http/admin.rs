use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tollgate_api_types::{
    CacheStatsResponse, PurgeResponse, ResetResponse, SetTierRequest, SubjectView, TierView,
    UsageAnalyticsResponse,
};

use crate::application::admission::Governor;
use crate::application::error::ErrorReport;
use crate::application::quota::{DEFAULT_TOP_N, SubjectStatus};
use crate::cache::CacheKey;
use crate::domain::quota::Tier;
use crate::infra::db::PostgresRepositories;

use super::error::ApiError;

const MAX_WINDOW_DAYS: u32 = 365;

#[derive(Clone)]
pub struct AdminState {
    pub governor: Governor,
    /// `None` when running on the in-memory store.
    pub db: Option<Arc<PostgresRepositories>>,
}

pub(super) async fn health(State(state): State<AdminState>) -> Response {
    let Some(db) = state.db.as_ref() else {
        return StatusCode::NO_CONTENT.into_response();
    };

    match db.health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::admin::health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct AnalyticsQuery {
    days: Option<u32>,
    top: Option<usize>,
}

pub(super) async fn analytics(
    State(state): State<AdminState>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<UsageAnalyticsResponse>, ApiError> {
    let days = query.days.unwrap_or(7);
    if days == 0 || days > MAX_WINDOW_DAYS {
        return Err(ApiError::bad_request(
            "Invalid window",
            Some(format!("`days` must be between 1 and {MAX_WINDOW_DAYS}")),
        ));
    }
    let top = query.top.unwrap_or(DEFAULT_TOP_N);

    let report = state.governor.quota().analytics(days, top).await?;
    Ok(Json(report.into()))
}

pub(super) async fn tiers(State(state): State<AdminState>) -> Json<Vec<TierView>> {
    let views = state
        .governor
        .quota()
        .tiers()
        .into_iter()
        .map(tier_view)
        .collect();
    Json(views)
}

pub(super) async fn subject(
    State(state): State<AdminState>,
    Path(subject): Path<String>,
) -> Json<SubjectView> {
    Json(subject_view(state.governor.quota().subject_status(&subject)))
}

pub(super) async fn set_tier(
    State(state): State<AdminState>,
    Path(subject): Path<String>,
    Json(request): Json<SetTierRequest>,
) -> Result<Json<SubjectView>, ApiError> {
    let quota = state.governor.quota();
    quota.set_subject_tier(&subject, request.tier.trim())?;
    Ok(Json(subject_view(quota.subject_status(&subject))))
}

pub(super) async fn clear_tier(
    State(state): State<AdminState>,
    Path(subject): Path<String>,
) -> Json<SubjectView> {
    let quota = state.governor.quota();
    quota.clear_subject_tier(&subject);
    Json(subject_view(quota.subject_status(&subject)))
}

pub(super) async fn reset_subject(
    State(state): State<AdminState>,
    Path(subject): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    let buckets_removed = state.governor.quota().reset_subject(&subject).await?;
    Ok(Json(ResetResponse { buckets_removed }))
}

pub(super) async fn reset_all(
    State(state): State<AdminState>,
) -> Result<Json<ResetResponse>, ApiError> {
    let buckets_removed = state.governor.quota().reset_all().await?;
    Ok(Json(ResetResponse { buckets_removed }))
}

pub(super) async fn add_operator(
    State(state): State<AdminState>,
    Path(subject): Path<String>,
) -> Json<SubjectView> {
    let quota = state.governor.quota();
    quota.add_operator(&subject);
    Json(subject_view(quota.subject_status(&subject)))
}

pub(super) async fn remove_operator(
    State(state): State<AdminState>,
    Path(subject): Path<String>,
) -> Json<SubjectView> {
    let quota = state.governor.quota();
    quota.remove_operator(&subject);
    Json(subject_view(quota.subject_status(&subject)))
}

pub(super) async fn purge_usage(
    State(state): State<AdminState>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let removed = state.governor.quota().purge_expired_usage().await?;
    Ok(Json(PurgeResponse { removed }))
}

pub(super) async fn cache_stats(State(state): State<AdminState>) -> Json<CacheStatsResponse> {
    Json(state.governor.cache().stats().into())
}

pub(super) async fn cache_clear(State(state): State<AdminState>) -> Json<PurgeResponse> {
    let removed = state.governor.cache().clear() as u64;
    Json(PurgeResponse { removed })
}

pub(super) async fn cache_invalidate(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.governor.cache().invalidate(&CacheKey::from_raw(key)) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Cache entry not found"))
    }
}

fn tier_view(tier: &Tier) -> TierView {
    TierView {
        name: tier.name.clone(),
        capacity: tier.limits.capacity,
        refill_rate: tier.limits.refill_rate,
        max_burst: tier.limits.max_burst,
        priority: tier.priority,
    }
}

fn subject_view(status: SubjectStatus) -> SubjectView {
    SubjectView {
        subject: status.subject,
        tier: status.effective_tier,
        operator: status.operator,
        assigned_tier: status.assigned_tier,
    }
}
