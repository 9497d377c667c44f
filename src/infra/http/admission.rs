//! Public admission API for callers that govern their own work.

use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tollgate_api_types::{AdmissionRequest, AdmissionResponse, AdmissionResult};

use crate::application::admission::{GovernedCall, Governor};
use crate::cache::{CacheKey, CachedResponse, TtlClass};

use super::error::ApiError;
use super::governance::{X_CACHE, apply_admitted_headers, hit_response, set_header};

#[derive(Clone)]
pub struct PublicState {
    pub governor: Governor,
}

pub(super) async fn admit(
    State(state): State<PublicState>,
    Json(request): Json<AdmissionRequest>,
) -> Response {
    let subject = request.subject.trim();
    let action = request.action.trim();
    if subject.is_empty() || action.is_empty() {
        return ApiError::bad_request(
            "Subject and action are required",
            Some("provide non-empty `subject` and `action`".to_string()),
        )
        .into_response();
    }

    let call = GovernedCall::new(subject, action, request.cost);
    match state.governor.admit(&call).await {
        Ok(decision) => {
            let body = AdmissionResponse {
                allowed: true,
                subject: AdmissionResult::from(&decision.subject),
                global: AdmissionResult::from(&decision.global),
            };
            let mut response = (StatusCode::OK, Json(body)).into_response();
            apply_admitted_headers(response.headers_mut(), &decision);
            response
        }
        Err(rejection) => ApiError::rate_limited(&rejection),
    }
}

pub(super) async fn cache_get(
    State(state): State<PublicState>,
    Path(key): Path<String>,
) -> Response {
    let cache = state.governor.cache();
    let hit = if cache.config().enabled {
        cache.get(&CacheKey::from_raw(key))
    } else {
        None
    };

    match hit {
        Some(hit) => hit_response(hit),
        None => {
            let mut response = ApiError::not_found("Cache entry not found").into_response();
            set_header(response.headers_mut(), X_CACHE, "MISS");
            response
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PutQuery {
    ttl: Option<String>,
}

pub(super) async fn cache_put(
    State(state): State<PublicState>,
    Path(key): Path<String>,
    Query(query): Query<PutQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let ttl_class = parse_ttl(query.ttl.as_deref())?;
    let cache = state.governor.cache();
    if !cache.config().enabled {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "cache_disabled",
            "Response cache is disabled",
            None,
        ));
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| vec![(CONTENT_TYPE.to_string(), value.to_string())])
        .unwrap_or_default();
    let response = CachedResponse {
        status: StatusCode::OK.as_u16(),
        headers: content_type,
        body,
    };

    let ttl = cache.config().ttl_for(ttl_class);
    cache.set(CacheKey::from_raw(key), response, ttl)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `metadata`, `content`, or a number of seconds. Defaults to `content`.
fn parse_ttl(raw: Option<&str>) -> Result<TtlClass, ApiError> {
    match raw.map(str::trim) {
        None | Some("") | Some("content") => Ok(TtlClass::Content),
        Some("metadata") => Ok(TtlClass::Metadata),
        Some(other) => match other.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(TtlClass::Custom(Duration::from_secs(secs))),
            _ => Err(ApiError::bad_request(
                "Invalid ttl",
                Some(format!(
                    "expected `metadata`, `content` or positive seconds, got `{other}`"
                )),
            )),
        },
    }
}
