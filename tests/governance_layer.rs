use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    routing::get,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tollgate::application::admission::Governor;
use tollgate::application::quota::{QuotaPolicy, QuotaService};
use tollgate::cache::{CacheConfig, ResponseCache, TtlClass};
use tollgate::config::GovernedRoute;
use tollgate::infra::http::{GovernanceState, RouteTable, SUBJECT_HEADER, governed};
use tollgate::infra::memory::MemoryRepositories;
use tollgate::util::clock::ManualClock;
use tower::ServiceExt;

struct Harness {
    app: Router,
    repos: Arc<MemoryRepositories>,
    clock: Arc<ManualClock>,
    calls: Arc<AtomicUsize>,
}

async fn summarize(State(calls): State<Arc<AtomicUsize>>) -> (StatusCode, &'static str) {
    calls.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, "summary")
}

async fn broken(State(calls): State<Arc<AtomicUsize>>) -> StatusCode {
    calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::BAD_GATEWAY
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
    let cache = Arc::new(ResponseCache::new(CacheConfig::default(), clock.clone()));
    let routes = RouteTable::new(vec![
        GovernedRoute {
            prefix: "/summarize".to_string(),
            action: "ai_request".to_string(),
            cost: 10,
            ttl: TtlClass::Content,
            cacheable: true,
        },
        GovernedRoute {
            prefix: "/broken".to_string(),
            action: "ai_request".to_string(),
            cost: 10,
            ttl: TtlClass::Content,
            cacheable: true,
        },
    ]);
    let state = GovernanceState::new(Governor::new(quota, cache), routes);

    let calls = Arc::new(AtomicUsize::new(0));
    let host = Router::new()
        .route("/summarize", get(summarize).post(summarize))
        .route("/broken", get(broken))
        .route("/open", get(summarize))
        .with_state(calls.clone());

    Harness {
        app: governed(host, state),
        repos,
        clock,
        calls,
    }
}

fn request(method: Method, uri: &str, subject: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(SUBJECT_HEADER, subject)
        .body(Body::empty())
        .expect("request")
}

fn tokens(harness: &Harness, subject: &str) -> Option<u64> {
    harness
        .repos
        .bucket(&format!("user:{subject}"), "ai_request")
        .map(|bucket| bucket.tokens)
}

#[tokio::test]
async fn repeated_get_is_served_from_cache_without_second_charge() {
    let harness = harness();

    let first = harness
        .app
        .clone()
        .oneshot(request(Method::GET, "/summarize?url=a&lang=en", "u1"))
        .await
        .expect("response");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-cache"], "MISS");
    assert_eq!(first.headers()["x-ratelimit-limit"], "guest");
    assert_eq!(first.headers()["x-ratelimit-remaining"], "90");

    harness.clock.advance(Duration::from_secs(3));

    // parameter order must not matter
    let second = harness
        .app
        .clone()
        .oneshot(request(Method::GET, "/summarize?lang=en&url=a", "u1"))
        .await
        .expect("response");
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["x-cache"], "HIT");
    assert_eq!(second.headers()["x-cache-age"], "3");
    let body = second.into_body().collect().await.expect("body").to_bytes();
    assert_eq!(&body[..], b"summary");

    assert_eq!(harness.calls.load(Ordering::SeqCst), 1);
    assert_eq!(tokens(&harness, "u1"), Some(90));
    assert_eq!(harness.repos.usage_len().await, 1);
}

#[tokio::test]
async fn post_requests_are_charged_but_never_cached() {
    let harness = harness();

    for _ in 0..2 {
        let response = harness
            .app
            .clone()
            .oneshot(request(Method::POST, "/summarize", "u1"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-cache").is_none());
    }

    assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
    assert_eq!(tokens(&harness, "u1"), Some(80));
}

#[tokio::test]
async fn exhausted_subject_gets_429_with_headers() {
    let harness = harness();

    for _ in 0..10 {
        let response = harness
            .app
            .clone()
            .oneshot(request(Method::POST, "/summarize", "u2"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = harness
        .app
        .clone()
        .oneshot(request(Method::POST, "/summarize", "u2"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = response.headers();
    assert_eq!(headers["retry-after"], "1");
    assert_eq!(headers["x-ratelimit-limit"], "guest");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert!(headers.contains_key("x-ratelimit-reset"));

    let body = response.into_body().collect().await.expect("body").to_bytes();
    let json: Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(json["limitedBy"], "user");
    assert_eq!(json["tier"], "guest");
    assert_eq!(json["retryAfter"], 1);
    assert_eq!(json["error"]["code"], "rate_limited");

    assert_eq!(harness.calls.load(Ordering::SeqCst), 10);

    // a second later enough tokens have refilled for one more call
    harness.clock.advance(Duration::from_secs(1));
    let response = harness
        .app
        .clone()
        .oneshot(request(Method::POST, "/summarize", "u2"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn failed_upstream_is_charged_and_not_cached() {
    let harness = harness();

    for _ in 0..2 {
        let response = harness
            .app
            .clone()
            .oneshot(request(Method::GET, "/broken", "u3"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get("x-cache").is_none());
    }

    assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
    assert_eq!(tokens(&harness, "u3"), Some(80));
}

#[tokio::test]
async fn unrouted_paths_are_not_governed() {
    let harness = harness();

    let response = harness
        .app
        .clone()
        .oneshot(request(Method::GET, "/open", "u4"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
    assert_eq!(harness.repos.bucket_count(), 0);
    assert_eq!(harness.repos.usage_len().await, 0);
}

#[tokio::test]
async fn missing_subject_header_charges_anonymous() {
    let harness = harness();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/summarize")
        .body(Body::empty())
        .expect("request");
    let response = harness.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(tokens(&harness, "anonymous"), Some(90));
}

#[tokio::test]
async fn response_larger_than_cache_limit_passes_through_uncached() {
    let repos = Arc::new(MemoryRepositories::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let quota = Arc::new(QuotaService::new(
        repos.clone(),
        repos.clone(),
        QuotaPolicy::reference(),
        clock.clone(),
    ));
    let cache = Arc::new(ResponseCache::new(
        CacheConfig {
            max_size_bytes: 16,
            ..Default::default()
        },
        clock,
    ));
    let routes = RouteTable::new(vec![GovernedRoute {
        prefix: "/big".to_string(),
        action: "metadata_read".to_string(),
        cost: 1,
        ttl: TtlClass::Content,
        cacheable: true,
    }]);
    let app = governed(
        Router::new().route("/big", get(|| async { "x".repeat(64) })),
        GovernanceState::new(Governor::new(quota, cache.clone()), routes),
    );

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/big", "u5"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "MISS");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body.len(), 64);
    }

    assert!(cache.is_empty());
    assert_eq!(
        repos
            .bucket("user:u5", "metadata_read")
            .map(|bucket| bucket.tokens),
        Some(98)
    );
}
