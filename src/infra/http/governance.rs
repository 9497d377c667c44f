//! Governance middleware for host routers.
//!
//! Requests whose path falls under a configured route prefix are charged
//! against the subject and global buckets before reaching the inner
//! handler. `GET` responses with status 200 are cached; a cache hit is
//! served without charging quota.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode,
        header::ACCEPT,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use serde_json::json;
use tracing::{debug, warn};

use crate::application::admission::{CacheDirective, GovernedCall, Governor};
use crate::application::quota::CombinedDecision;
use crate::cache::{CacheHit, CacheKey, CachedResponse};
use crate::config::GovernedRoute;

use super::error::{ApiError, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};

pub const SUBJECT_HEADER: &str = "x-subject-id";
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_CACHE_AGE: HeaderName = HeaderName::from_static("x-cache-age");

/// Governed path prefixes, longest first.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<GovernedRoute>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<GovernedRoute>) -> Self {
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Longest prefix matching `path` on a segment boundary.
    pub fn resolve(&self, path: &str) -> Option<&GovernedRoute> {
        self.routes
            .iter()
            .find(|route| prefix_matches(&route.prefix, path))
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Clone)]
pub struct GovernanceState {
    pub governor: Governor,
    pub routes: Arc<RouteTable>,
}

impl GovernanceState {
    pub fn new(governor: Governor, routes: RouteTable) -> Self {
        Self {
            governor,
            routes: Arc::new(routes),
        }
    }
}

/// Subject named by the request, or [`ANONYMOUS_SUBJECT`].
pub fn subject_of(headers: &HeaderMap) -> String {
    headers
        .get(SUBJECT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_SUBJECT)
        .to_string()
}

pub async fn governance_layer(
    State(state): State<GovernanceState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(route) = state.routes.resolve(request.uri().path()).cloned() else {
        return next.run(request).await;
    };

    let governor = &state.governor;
    let mut call = GovernedCall::new(
        subject_of(request.headers()),
        route.action.as_str(),
        route.cost,
    );
    if route.cacheable && request.method() == Method::GET {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| request.uri().path());
        let accept = request
            .headers()
            .get(ACCEPT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let key = CacheKey::for_request(Method::GET.as_str(), path, &json!({ "accept": accept }));
        call = call.cached(key, governor.cache().config().ttl_for(route.ttl));
    }

    if let Some(directive) = &call.cache
        && let Some(hit) = governor.lookup(directive)
    {
        return hit_response(hit);
    }

    let decision = match governor.admit(&call).await {
        Ok(decision) => decision,
        Err(rejection) => return ApiError::rate_limited(&rejection),
    };

    let response = next.run(request).await;
    let mut response = match &call.cache {
        Some(directive) if response.status() == StatusCode::OK => {
            let limit = governor.cache().config().max_size_bytes;
            let mut response = buffer_and_store(governor, directive, response, limit).await;
            set_header(response.headers_mut(), X_CACHE, "MISS");
            response
        }
        _ => response,
    };

    apply_admitted_headers(response.headers_mut(), &decision);
    response
}

async fn buffer_and_store(
    governor: &Governor,
    directive: &CacheDirective,
    response: Response,
    limit: u64,
) -> Response {
    let hint = response.body().size_hint();
    if hint.lower() > limit {
        debug!(
            target = "tollgate::http::governance",
            key = %directive.key,
            size_bytes = hint.lower(),
            limit,
            "governed response exceeds cache limit; not cached"
        );
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(
                target = "tollgate::http::governance",
                key = %directive.key,
                error = %err,
                "failed to buffer governed response"
            );
            return Response::from_parts(parts, Body::empty());
        }
    };

    if bytes.len() as u64 <= limit {
        let cached = CachedResponse {
            status: parts.status.as_u16(),
            headers: parts
                .headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
                .collect(),
            body: bytes.clone(),
        };
        governor.store(directive, cached);
    } else {
        debug!(
            target = "tollgate::http::governance",
            key = %directive.key,
            size_bytes = bytes.len(),
            limit,
            "governed response exceeds cache limit; not cached"
        );
    }

    Response::from_parts(parts, Body::from(bytes))
}

pub(super) fn hit_response(hit: CacheHit) -> Response {
    let mut builder = Response::builder().status(hit.response.status);
    for (name, value) in &hit.response.headers {
        if let Ok(header_value) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), header_value);
        }
    }

    let mut response = builder
        .body(Body::from(hit.response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    let headers = response.headers_mut();
    set_header(headers, X_CACHE, "HIT");
    set_header(headers, X_CACHE_AGE, &hit.age.as_secs().to_string());
    response
}

pub(super) fn apply_admitted_headers(headers: &mut HeaderMap, decision: &CombinedDecision) {
    let binding = decision.binding();
    set_header(headers, X_RATELIMIT_LIMIT, &binding.tier);
    if let Some(remaining) = binding.tokens_remaining {
        set_header(headers, X_RATELIMIT_REMAINING, &remaining.to_string());
    }
    set_header(
        headers,
        X_RATELIMIT_RESET,
        &binding.reset_time_ms.to_string(),
    );
}

pub(super) fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
