//! The admin read API (spec.md §4.J "Read API"). The dashboard UI itself is
//! out of scope; this is only the data contract it would consume.

use crate::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use protocol::{AdminStateUpdate, SubjectId};
use std::sync::Arc;

pub async fn snapshot_handler(State(state): State<Arc<AppState>>) -> Json<AdminStateUpdate> {
    Json(state.coordinator.admin.snapshot().await)
}

pub async fn console_log_handler(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> impl IntoResponse {
    let subject_id = SubjectId::from(subject_id);
    let lines = state.coordinator.admin.console_log_for(&subject_id).await;
    if lines.is_empty() {
        (StatusCode::NOT_FOUND, Json(Vec::<String>::new()))
    } else {
        (StatusCode::OK, Json(lines))
    }
}
