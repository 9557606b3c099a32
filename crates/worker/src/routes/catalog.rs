//! Event catalog inspection.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use event_bus::EventCatalogEntry;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct CatalogResponse {
    pub entries: Vec<EventCatalogEntry>,
    /// Declared event types nobody consumes.
    pub orphans: Vec<String>,
    /// Deprecated event types that still have consumers.
    pub deprecated_in_use: Vec<String>,
}

/// GET /catalog
pub async fn get(State(state): State<Arc<AppState>>) -> Json<CatalogResponse> {
    Json(CatalogResponse {
        entries: state.catalog.entries(),
        orphans: state.catalog.orphans(),
        deprecated_in_use: state.catalog.deprecated_in_use(),
    })
}
