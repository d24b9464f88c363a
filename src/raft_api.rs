use crate::daemon::Daemon;
use crate::replicator::TypeConfig;
use crate::types::MemberId;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use openraft::raft::{
    AppendEntriesRequest, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest,
};
use std::sync::Arc;

// Routed through the daemon rather than a captured Gateway so that a join,
// which replaces the Raft instance, is picked up transparently.
pub fn create_raft_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/raft/vote", post(handle_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .route("/raft/elect", post(handle_elect))
        .with_state(daemon)
}

async fn handle_vote(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<VoteRequest<MemberId>>,
) -> impl IntoResponse {
    match daemon.gateway().raft().vote(req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_append_entries(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> impl IntoResponse {
    match daemon.gateway().raft().append_entries(req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_install_snapshot(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> impl IntoResponse {
    let resp: Result<InstallSnapshotResponse<MemberId>, _> =
        daemon.gateway().raft().install_snapshot(req).await;
    match resp {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// Leader-transfer primitive: the current leader asks a voter to campaign.
async fn handle_elect(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    match daemon.gateway().raft().trigger().elect().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
