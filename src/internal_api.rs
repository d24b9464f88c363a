use crate::daemon::{Daemon, TrustRequest};
use crate::error::{ApiError, ApiResult};
use crate::heartbeat::{HeartbeatPayload, HeartbeatReply};
use crate::membership::AcceptRequest;
use crate::rebalance::{self, AssignRequest, HandoverRequest};
use crate::replicator::Replicator;
use crate::types::ClusterCommand;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post},
    Json, Router as AxumRouter,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub fn create_internal_router(daemon: Arc<Daemon>) -> AxumRouter {
    AxumRouter::new()
        .route("/internal/cluster/accept", post(cluster_accept))
        .route("/internal/cluster/assign", post(cluster_assign))
        .route("/internal/cluster/handover", post(cluster_handover))
        .route("/internal/cluster/rebalance", post(cluster_rebalance))
        .route("/internal/cluster/trust", post(cluster_trust))
        .route("/internal/cluster/heartbeat", post(cluster_heartbeat))
        .route("/internal/cluster/command", post(cluster_command))
        .route("/internal/cluster/disable", post(cluster_disable))
        .route(
            "/internal/cluster/raft-node/:address",
            delete(raft_node_delete),
        )
        .with_state(daemon)
}

// Endpoints that mutate the Raft configuration proxy to the leader rather
// than redirect, so the response is consumed on the original connection.
async fn proxy_to_leader(
    daemon: &Arc<Daemon>,
    path: &str,
    body: serde_json::Value,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let leader = daemon
        .gateway()
        .leader_address()
        .ok_or_else(|| ApiError::unavailable("Cluster has no leader"))?;

    let (status, body) = daemon
        .router()
        .proxy(&leader, reqwest::Method::POST, path, Some(body))
        .await?;
    Ok((status, Json(body)))
}

async fn cluster_accept(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<AcceptRequest>,
) -> ApiResult<impl IntoResponse> {
    if !daemon.gateway().is_leader() {
        let body = serde_json::to_value(&req).map_err(|e| ApiError::Internal(e.into()))?;
        let (status, body) = proxy_to_leader(&daemon, "/internal/cluster/accept", body).await?;
        return Ok((status, body).into_response());
    }

    let response = daemon.accept(&req).await?;
    Ok(Json(response).into_response())
}

// Target-side role notification: refresh the cached Raft node list so a
// restart reconnects to the right peers.
async fn cluster_assign(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<AssignRequest>,
) -> ApiResult<impl IntoResponse> {
    info!("Assigned raft role {} to this member", req.role);

    daemon
        .gateway()
        .register_peers(&req.raft_nodes);
    daemon
        .local_store()
        .set_raft_nodes(&req.raft_nodes)
        .map_err(ApiError::Internal)?;

    Ok(StatusCode::OK)
}

async fn cluster_handover(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<HandoverRequest>,
) -> ApiResult<impl IntoResponse> {
    let gateway = daemon.gateway();
    if !gateway.is_leader() {
        let body = serde_json::to_value(&req).map_err(|e| ApiError::Internal(e.into()))?;
        let (status, body) = proxy_to_leader(&daemon, "/internal/cluster/handover", body).await?;
        return Ok((status, body).into_response());
    }

    let result = {
        let _guard = daemon.membership_mu.lock().await;
        rebalance::handover(&gateway, daemon.router().client(), &req).await
    };

    match result {
        Ok(()) => {
            daemon.notify_heartbeat();
            Ok(StatusCode::OK.into_response())
        }
        Err(ApiError::NotLeader { leader: Some(_) }) => {
            // Leadership moved (the departing member was the leader); retry
            // against whoever holds it now.
            let body = serde_json::to_value(&req).map_err(|e| ApiError::Internal(e.into()))?;
            let (status, body) =
                proxy_to_leader(&daemon, "/internal/cluster/handover", body).await?;
            Ok((status, body).into_response())
        }
        Err(e) => Err(e),
    }
}

async fn cluster_rebalance(State(daemon): State<Arc<Daemon>>) -> ApiResult<impl IntoResponse> {
    let gateway = daemon.gateway();
    if !gateway.is_leader() {
        let (status, body) =
            proxy_to_leader(&daemon, "/internal/cluster/rebalance", serde_json::Value::Null)
                .await?;
        return Ok((status, body).into_response());
    }

    let changed = {
        let _guard = daemon.membership_mu.lock().await;
        rebalance::rebalance(&gateway, daemon.router().client()).await?
    };

    if changed {
        daemon.notify_heartbeat();
    }

    Ok(Json(serde_json::json!({ "changed": changed })).into_response())
}

async fn cluster_trust(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<TrustRequest>,
) -> ApiResult<impl IntoResponse> {
    if !daemon.gateway().is_leader() {
        let body = serde_json::to_value(&req).map_err(|e| ApiError::Internal(e.into()))?;
        let (status, body) = proxy_to_leader(&daemon, "/internal/cluster/trust", body).await?;
        return Ok((status, body).into_response());
    }

    let response = daemon.setup_trust(&req).await?;
    Ok(Json(response).into_response())
}

async fn cluster_heartbeat(
    State(daemon): State<Arc<Daemon>>,
    Json(payload): Json<HeartbeatPayload>,
) -> impl IntoResponse {
    daemon.heartbeats().observe(&payload.name);

    // Heartbeats carry the sender's view of the Raft configuration; cache
    // it so a restart can reconnect without asking around.
    if !payload.raft_nodes.is_empty() {
        daemon.gateway().register_peers(&payload.raft_nodes);
        if let Err(e) = daemon.local_store().set_raft_nodes(&payload.raft_nodes) {
            warn!("Failed to cache raft nodes from heartbeat: {}", e);
        }
    }

    Json(HeartbeatReply {
        name: daemon.server_name(),
        received_at: Utc::now(),
    })
}

// Write forwarding target: only the leader applies forwarded commands, and
// it never forwards again.
async fn cluster_command(
    State(daemon): State<Arc<Daemon>>,
    Json(command): Json<ClusterCommand>,
) -> ApiResult<impl IntoResponse> {
    let gateway = daemon.gateway();
    if !gateway.is_leader() {
        return Err(ApiError::NotLeader {
            leader: gateway.leader_address(),
        });
    }

    gateway.apply(command).await?;
    Ok(StatusCode::OK)
}

// Callback from the leader after this member was removed from the cluster.
// The response goes out immediately; the actual reset waits until the
// self-removal lock is clear, i.e. until the original client got its
// answer.
async fn cluster_disable(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    info!("Cluster reset requested by the leader");

    let daemon_clone = daemon.clone();
    tokio::spawn(async move {
        daemon_clone.router().wait_disable_clear().await;
        if let Err(e) = daemon_clone.dissolve().await {
            warn!("Failed to reset member after removal: {}", e);
        }
    });

    StatusCode::OK
}

// Low-level recovery: drop a Raft node by address, without touching the
// members table.
async fn raft_node_delete(
    State(daemon): State<Arc<Daemon>>,
    Path(address): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let gateway = daemon.gateway();

    let node = gateway
        .raft_nodes()
        .into_iter()
        .find(|n| n.address == address)
        .ok_or_else(|| ApiError::not_found(format!("No raft node with address {}", address)))?;

    gateway
        .remove_node(node.id)
        .await
        .map_err(ApiError::Internal)?;

    Ok(StatusCode::OK)
}
