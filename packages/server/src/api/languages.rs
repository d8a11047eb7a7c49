// ABOUTME: Language catalog endpoint

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct LanguagesResponse {
    pub languages: Vec<String>,
}

pub async fn list_languages(State(state): State<AppState>) -> Json<LanguagesResponse> {
    let languages = state
        .manager
        .registry()
        .ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    Json(LanguagesResponse { languages })
}
