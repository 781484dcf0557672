//! Catalog handler

use axum::{extract::State, Json};
use storesage_common::SchemaCatalog;

use crate::AppState;

/// Tables, relations and the model contract the orchestrator plans against
pub async fn get_catalog(State(state): State<AppState>) -> Json<SchemaCatalog> {
    Json(state.orchestrator.catalog().clone())
}
