use axum::{
    routing::{
        get,
        post,
    },
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    api,
    state::LocalAppState,
};

pub fn router(state: LocalAppState) -> Router {
    Router::new()
        .route("/api/v1/write", post(api::remote_write))
        .route("/api/v1/read", post(api::remote_read))
        .route("/api/v1/query", get(api::query))
        .route("/api/v1/query_range", get(api::query_range))
        .route("/api/v1/labels", get(api::labels))
        .route("/api/v1/label/{name}/values", get(api::label_values))
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
