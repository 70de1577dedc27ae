//! # REST API Endpoints
//!
//! Provides HTTP API endpoints for querying gateway state.
//! Currently only exposes a list of ONLINE sessions.

use axum::{extract::State, Json};

use crate::state::{AppState, SessionStatus};
use crate::storage::SessionRecord;

/// `GET /api/sessions` — Returns a JSON array of all ONLINE sessions.
///
/// This endpoint can be used by external tools or dashboards to discover
/// which sessions are live and available for monitoring.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionRecord>> {
    let sessions: Vec<SessionRecord> = state
        .registry
        .list()
        .iter()
        .map(|session| SessionRecord::of(session, SessionStatus::Online, None))
        .collect();
    Json(sessions)
}
