//! Turn handler

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use validator::Validate;

use crate::AppState;
use storesage_common::{errors::AppError, metrics::RequestMetrics};

/// One question, answered without any conversation state
#[derive(Debug, Deserialize, Validate)]
pub struct TurnRequest {
    #[validate(length(min = 1, max = 2000))]
    pub question: String,
}

/// Answer a question, or report why it could not be answered
pub async fn handle_turn(State(state): State<AppState>, Json(request): Json<TurnRequest>) -> Response {
    let metrics = RequestMetrics::start("POST", "/v1/turns");

    let response = match request.validate() {
        Err(e) => AppError::Validation {
            message: e.to_string(),
            field: Some("question".to_string()),
        }
        .into_response(),
        Ok(()) => match state.orchestrator.handle_turn(&request.question).await {
            Ok(answer) => (StatusCode::OK, Json(answer)).into_response(),
            Err(report) => report.into_response(),
        },
    };

    metrics.finish(response.status().as_u16());
    response
}
