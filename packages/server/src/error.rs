// ABOUTME: HTTP error type shared by the server's handlers
// ABOUTME: Maps failures to status codes and a structured JSON error body

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use coderun_sandbox::Readiness;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Service not ready: {0:?}")]
    NotReady(Readiness),
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    readiness: Option<Readiness>,
}

impl AppError {
    fn to_status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotReady(_) => (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY"),
        }
    }

    fn to_user_message(&self) -> String {
        match self {
            AppError::NotReady(Readiness::Failed(reason)) => {
                format!("Language images could not be prepared: {}", reason)
            }
            AppError::NotReady(_) => "Language images are still being prepared".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status_code, error_code) = self.to_status_and_code();
        let message = self.to_user_message();

        let readiness = match self {
            AppError::NotReady(readiness) => {
                warn!(request_id = %request_id, readiness = ?readiness, "Request refused before ready");
                Some(readiness)
            }
        };

        let body = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: error_code,
                message,
                readiness,
            },
            request_id,
        };

        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_not_ready_maps_to_503() {
        let response = AppError::NotReady(Readiness::Preparing).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "NOT_READY");
        assert_eq!(body["error"]["readiness"]["status"], "preparing");
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_failed_preparation_reports_reason() {
        let response =
            AppError::NotReady(Readiness::Failed("pull of gcc:latest timed out".to_string()))
                .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(
            body["error"]["message"],
            "Language images could not be prepared: pull of gcc:latest timed out"
        );
        assert_eq!(body["error"]["readiness"]["status"], "failed");
    }
}
