mod admin;
mod admission;
pub mod error;
pub mod governance;
mod middleware;

pub use admin::AdminState;
pub use admission::PublicState;
pub use error::ApiError;
pub use governance::{
    ANONYMOUS_SUBJECT, GovernanceState, RouteTable, SUBJECT_HEADER, governance_layer,
};
pub use middleware::{log_responses, set_request_context};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{delete, get, post, put},
};

/// Admission and cache API served on the public listener.
///
/// Paths under a prefix in `routes` are governed as well.
pub fn build_public_router(state: PublicState, routes: RouteTable) -> Router {
    let body_limit = usize::try_from(state.governor.cache().config().max_size_bytes)
        .unwrap_or(usize::MAX);
    let governance = GovernanceState::new(state.governor.clone(), routes);

    let router = Router::new()
        .route("/v1/admission", post(admission::admit))
        .route(
            "/v1/cache/{key}",
            get(admission::cache_get)
                .put(admission::cache_put)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state);

    governed(router, governance)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

/// Wrap a host router so configured route prefixes are governed.
pub fn governed<S>(router: Router<S>, state: GovernanceState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(axum_middleware::from_fn_with_state(state, governance_layer))
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/quota/analytics", get(admin::analytics))
        .route("/quota/tiers", get(admin::tiers))
        .route("/quota/reset", post(admin::reset_all))
        .route("/quota/usage/purge", post(admin::purge_usage))
        .route("/quota/subjects/{subject}", get(admin::subject))
        .route(
            "/quota/subjects/{subject}/tier",
            put(admin::set_tier).delete(admin::clear_tier),
        )
        .route(
            "/quota/subjects/{subject}/reset",
            post(admin::reset_subject),
        )
        .route(
            "/quota/operators/{subject}",
            put(admin::add_operator).delete(admin::remove_operator),
        )
        .route("/cache/stats", get(admin::cache_stats))
        .route("/cache", delete(admin::cache_clear))
        .route("/cache/entries/{key}", delete(admin::cache_invalidate))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
