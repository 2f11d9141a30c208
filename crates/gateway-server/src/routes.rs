//! Route definitions for the gateway API.

use axum::{
    body::Body,
    http::Request,
    routing::{delete, get, patch, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info_span;

use crate::{handlers, state::AppState};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    });

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/version", get(handlers::version))
        .nest("/v1", api_routes())
        .nest("/admin", admin_routes())
        .fallback(handlers::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(trace)
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// Caller-facing API in each supported dialect
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/messages", post(handlers::messages))
        .route("/models", get(handlers::list_models))
}

/// Admin/management routes
fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/providers", get(handlers::list_providers))
        .route("/fallback", get(handlers::get_fallback))
        .route("/fallback/enabled", put(handlers::set_fallback_enabled))
        .route("/fallback/routes", get(handlers::fallback_routes))
        .route("/fallback/models", post(handlers::create_virtual_model))
        .route(
            "/fallback/models/:id",
            patch(handlers::update_virtual_model).delete(handlers::delete_virtual_model),
        )
        .route("/fallback/models/:id/entries", post(handlers::create_entry))
        .route(
            "/fallback/models/:id/entries/:entry_id",
            delete(handlers::delete_entry),
        )
        .route("/fallback/models/:id/order", put(handlers::reorder_entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    fn create_test_state() -> AppState {
        AppState::builder().build()
    }

    async fn get_status(uri: &str) -> StatusCode {
        create_router(create_test_state())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        assert_eq!(get_status("/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_models_endpoint() {
        assert_eq!(get_status("/v1/models").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        assert_eq!(get_status("/v2/anything").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fallback_admin_without_engine() {
        assert_eq!(get_status("/admin/fallback").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let response = create_router(create_test_state())
            .oneshot(
                Request::builder()
                    .uri("/version")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }
}
