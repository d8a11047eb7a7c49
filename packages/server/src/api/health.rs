// ABOUTME: Liveness and readiness endpoints
// ABOUTME: Readiness reflects whether every language image has been prepared

use axum::{extract::State, Json};
use coderun_sandbox::Readiness;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::AppState;

pub async fn root() -> Json<Value> {
    Json(json!({ "message": "Code Execution Engine API" }))
}

pub async fn ready(State(state): State<AppState>) -> Result<Json<Readiness>, AppError> {
    match state.readiness.get().await {
        Readiness::Ready => Ok(Json(Readiness::Ready)),
        other => Err(AppError::NotReady(other)),
    }
}
