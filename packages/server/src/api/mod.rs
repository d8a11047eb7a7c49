// ABOUTME: HTTP and WebSocket routes of the execution server
// ABOUTME: Builds the router over the shared application state

use axum::{routing::get, Router};

use crate::AppState;

pub mod execute;
pub mod health;
pub mod languages;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/ready", get(health::ready))
        .route("/languages", get(languages::list_languages))
        .route("/ws/execute", get(execute::execute_ws))
        .with_state(state)
}
