use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse as _, Response};

use crate::ProxyState;
use crate::runtime::RuntimeState;

/// Health as seen by the orchestrator: 200 while the runtime serves, 404
/// once it finished cleanly (scale-to-zero), 503 anywhere else.
pub(super) async fn health_check(State(state): State<ProxyState>) -> Response {
    let (status, body) = match state.runtime.state() {
        RuntimeState::Running => (StatusCode::OK, r#"{"status":"ok"}"#),
        RuntimeState::ExitedSuccess => (StatusCode::NOT_FOUND, r#"{"status":"service not found"}"#),
        _ => (StatusCode::SERVICE_UNAVAILABLE, r#"{"status":"service unavailable"}"#),
    };
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}
