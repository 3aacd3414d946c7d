use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

pub const QUOTAGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

/// A handler for a status check
pub async fn status_handler() -> Response {
    Json(json!({ "status": "ok", "version": QUOTAGATE_VERSION })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_handler() {
        let response = status_handler().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
