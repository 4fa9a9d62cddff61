use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handler::{self, AppState};

/// Build the axum router with all LXP endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(handler::health_handler))
        .route(
            "/v1/repos",
            get(handler::list_repos).post(handler::create_repo),
        )
        .route("/v1/repos/:repo", axum::routing::delete(handler::delete_repo))
        .route(
            "/v1/repos/:repo/buckets",
            get(handler::list_buckets).post(handler::create_bucket),
        )
        .route(
            "/v1/repos/:repo/buckets/:bucket",
            axum::routing::delete(handler::delete_bucket),
        )
        .route(
            "/v1/repos/:repo/buckets/:bucket/records",
            get(handler::list_records).post(handler::put_record),
        )
        .route(
            "/v1/repos/:repo/buckets/:bucket/records/:oid",
            get(handler::get_record).delete(handler::delete_record),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
