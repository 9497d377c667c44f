use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header::CONTENT_TYPE},
    response::Response,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::Value;
use tollgate::application::admission::{GovernedCall, Governor};
use tollgate::application::quota::{QuotaPolicy, QuotaService};
use tollgate::cache::{CacheConfig, CacheKey, CachedResponse, ResponseCache};
use tollgate::infra::http::{AdminState, build_admin_router};
use tollgate::infra::memory::MemoryRepositories;
use tollgate::util::clock::ManualClock;
use tower::ServiceExt;

struct Harness {
    app: Router,
    governor: Governor,
    repos: Arc<MemoryRepositories>,
}

fn harness() -> Harness {
    let repos = Arc::new(MemoryRepositories::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let quota = Arc::new(QuotaService::new(
        repos.clone(),
        repos.clone(),
        QuotaPolicy::reference(),
        clock.clone(),
    ));
    let cache = Arc::new(ResponseCache::new(CacheConfig::default(), clock));
    let governor = Governor::new(quota, cache);
    let app = build_admin_router(AdminState {
        governor: governor.clone(),
        db: None,
    });
    Harness {
        app,
        governor,
        repos,
    }
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<&str>) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.clone()
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("response")
}

async fn json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

async fn spend(governor: &Governor, subject: &str, cost: u64) {
    governor
        .admit(&GovernedCall::new(subject, "ai_request", cost))
        .await
        .expect("admitted");
}

#[tokio::test]
async fn health_is_no_content_without_database() {
    let harness = harness();
    let response = send(&harness.app, Method::GET, "/health", None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn tiers_are_listed_by_priority() {
    let harness = harness();
    let response = send(&harness.app, Method::GET, "/quota/tiers", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json(response).await;
    let names: Vec<&str> = body
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|tier| tier["name"].as_str())
        .collect();
    assert_eq!(names, vec!["premium", "user", "guest"]);
    assert_eq!(body[2]["capacity"], 100);
    assert_eq!(body[2]["maxBurst"], 150);
}

#[tokio::test]
async fn tier_assignment_round_trip() {
    let harness = harness();

    let response = send(
        &harness.app,
        Method::PUT,
        "/quota/subjects/alice/tier",
        Some(r#"{"tier":"premium"}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["tier"], "premium");
    assert_eq!(body["assignedTier"], "premium");

    spend(&harness.governor, "alice", 1_000).await;
    assert_eq!(
        harness.repos.bucket("user:alice", "ai_request").map(|b| b.tokens),
        Some(4_000)
    );

    let response = send(&harness.app, Method::DELETE, "/quota/subjects/alice/tier", None).await;
    let body = json(response).await;
    assert_eq!(body["tier"], "guest");
    assert!(body.get("assignedTier").is_none());
}

#[tokio::test]
async fn unknown_tier_is_rejected() {
    let harness = harness();
    let response = send(
        &harness.app,
        Method::PUT,
        "/quota/subjects/bob/tier",
        Some(r#"{"tier":"platinum"}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert_eq!(body["error"]["code"], "unknown_tier");
}

#[tokio::test]
async fn operators_bypass_and_can_be_removed() {
    let harness = harness();

    let response = send(&harness.app, Method::PUT, "/quota/operators/ops", None).await;
    let body = json(response).await;
    assert_eq!(body["operator"], true);
    assert_eq!(body["tier"], "operator");

    spend(&harness.governor, "ops", 1_000_000).await;
    assert!(harness.repos.bucket("user:ops", "ai_request").is_none());

    let response = send(&harness.app, Method::DELETE, "/quota/operators/ops", None).await;
    let body = json(response).await;
    assert_eq!(body["operator"], false);
    assert_eq!(body["tier"], "guest");
}

#[tokio::test]
async fn reset_subject_and_reset_all() {
    let harness = harness();
    spend(&harness.governor, "carol", 50).await;
    spend(&harness.governor, "dave", 50).await;

    let response = send(&harness.app, Method::POST, "/quota/subjects/carol/reset", None).await;
    let body = json(response).await;
    assert_eq!(body["bucketsRemoved"], 1);
    assert!(harness.repos.bucket("user:carol", "ai_request").is_none());

    let response = send(&harness.app, Method::POST, "/quota/subjects/nobody/reset", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["bucketsRemoved"], 0);

    let response = send(&harness.app, Method::POST, "/quota/reset", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.repos.bucket_count(), 0);
    // usage history survives a reset
    assert_eq!(harness.repos.usage_len().await, 2);
}

#[tokio::test]
async fn analytics_aggregates_usage() {
    let harness = harness();
    spend(&harness.governor, "erin", 60).await;
    spend(&harness.governor, "erin", 30).await;
    let blocked = harness
        .governor
        .admit(&GovernedCall::new("erin", "ai_request", 30))
        .await;
    assert!(blocked.is_err());

    let response = send(&harness.app, Method::GET, "/quota/analytics?days=1&top=5", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["windowDays"], 1);
    assert_eq!(body["totalRequests"], 3);
    assert_eq!(body["allowedRequests"], 2);
    assert_eq!(body["blockedRequests"], 1);
    assert_eq!(body["averageTokensPerRequest"], 30.0);
    assert_eq!(body["topSubjects"][0]["name"], "erin");
    assert_eq!(body["tierDistribution"]["guest"], 3);

    let response = send(&harness.app, Method::GET, "/quota/analytics?days=0", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cache_stats_clear_and_invalidate() {
    let harness = harness();
    let cache = harness.governor.cache();
    for name in ["a", "b"] {
        cache
            .set(
                CacheKey::from_raw(name),
                CachedResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: Bytes::from_static(b"payload"),
                },
                Duration::from_secs(60),
            )
            .expect("fits");
    }
    assert!(cache.get(&CacheKey::from_raw("a")).is_some());
    assert!(cache.get(&CacheKey::from_raw("zzz")).is_none());

    let response = send(&harness.app, Method::GET, "/cache/stats", None).await;
    let body = json(response).await;
    assert_eq!(body["entries"], 2);
    assert_eq!(body["hits"], 1);
    assert_eq!(body["misses"], 1);
    assert_eq!(body["hitRate"], 0.5);
    assert_eq!(body["totalSizeBytes"], 14);

    let response = send(&harness.app, Method::DELETE, "/cache/entries/a", None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = send(&harness.app, Method::DELETE, "/cache/entries/a", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&harness.app, Method::DELETE, "/cache", None).await;
    assert_eq!(json(response).await["removed"], 1);
    assert!(cache.is_empty());
}
