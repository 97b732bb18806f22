pub(crate) mod health;
pub(crate) mod invoke;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse as _, Response};

use crate::ProxyState;

/// Router for the service listener: health plus inference on every other
/// path.
pub fn make_service_router(state: ProxyState) -> Router {
    Router::new()
        .route("/health_check", axum::routing::any(health::health_check))
        .fallback(invoke::invoke)
        // request bodies are capped by the platform gateway, not here
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Router for the dedicated health listener.
pub fn make_health_router(state: ProxyState) -> Router {
    Router::new()
        .route("/health_check", axum::routing::any(health::health_check))
        .with_state(state)
}

/// The user-visible failure body: `{"status":"<message>"}`.
pub(crate) fn status_response(status: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "status": message }).to_string();
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt as _;

    use super::*;

    #[tokio::test]
    async fn status_response_carries_the_message() {
        let response = status_response(503, "service unavailable");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body.as_ref(), br#"{"status":"service unavailable"}"#);
    }

    #[tokio::test]
    async fn out_of_range_status_degrades_to_500() {
        let response = status_response(42, "odd");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
