use crate::daemon::Daemon;
use crate::error::{ApiError, ApiResult};
use crate::membership::{self, member_etag};
use crate::operations::OperationClass;
use crate::replicator::Replicator;
use crate::router::Router;
use crate::types::*;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router as AxumRouter,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub fn create_router(daemon: Arc<Daemon>) -> AxumRouter {
    AxumRouter::new()
        .route("/1.0/cluster", get(cluster_get).put(cluster_put))
        .route(
            "/1.0/cluster/members",
            get(members_get).post(members_post),
        )
        .route(
            "/1.0/cluster/members/:name",
            get(member_get)
                .put(member_put)
                .patch(member_patch)
                .post(member_rename)
                .delete(member_delete),
        )
        .route(
            "/1.0/cluster/members/:name/state",
            get(member_state_get).post(member_state_post),
        )
        .route("/1.0/cluster/config", put(cluster_config_put))
        .route("/1.0/operations", get(operations_get))
        .route(
            "/1.0/operations/:id",
            get(operation_get).delete(operation_delete),
        )
        .with_state(daemon)
}

async fn cluster_get(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    Json(daemon.cluster_info())
}

async fn cluster_put(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<ClusterPut>,
) -> ApiResult<impl IntoResponse> {
    if !req.enabled {
        if !daemon.is_clustered() {
            return Err(ApiError::PreconditionFailed(
                "This server is not clustered".to_string(),
            ));
        }

        let op = daemon.registry().create(
            OperationClass::Task,
            "Disabling clustering",
            HashMap::new(),
        );
        match daemon.dissolve().await {
            Ok(()) => daemon.registry().succeed(&op.id),
            Err(e) => {
                daemon.registry().fail(&op.id, &e.to_string());
                return Err(e);
            }
        }
        return Ok((StatusCode::OK, Json(daemon.registry().get(&op.id))));
    }

    if req.cluster_address.is_empty() && req.cluster_token.is_empty() {
        // Bootstrap: first member of a fresh cluster.
        let name = if req.server_name.is_empty() {
            daemon.server_name()
        } else {
            req.server_name.clone()
        };
        let address = if req.server_address.is_empty() {
            daemon.listen_addr()
        } else {
            req.server_address.clone()
        };

        let op = daemon.registry().create(
            OperationClass::Task,
            "Creating cluster",
            HashMap::new(),
        );
        match daemon.bootstrap(&name, &address).await {
            Ok(()) => daemon.registry().succeed(&op.id),
            Err(e) => {
                daemon.registry().fail(&op.id, &e.to_string());
                return Err(e);
            }
        }
        return Ok((StatusCode::OK, Json(daemon.registry().get(&op.id))));
    }

    // Join: asynchronous, the caller polls the returned operation.
    let op = daemon.registry().create(
        OperationClass::Task,
        "Joining cluster",
        HashMap::new(),
    );
    let registry = daemon.registry().clone();
    let op_id = op.id.clone();
    let daemon_clone = daemon.clone();
    tokio::spawn(async move {
        match daemon_clone.join(&req).await {
            Ok(()) => registry.succeed(&op_id),
            Err(e) => {
                warn!("Join failed: {}", e);
                registry.fail(&op_id, &e.to_string());
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(Some(op))))
}

#[derive(Debug, Serialize)]
struct MemberView {
    server_name: String,
    url: String,
    database: bool,
    status: String,
    message: String,
    architecture: String,
    roles: Vec<String>,
    failure_domain: String,
    groups: Vec<String>,
    config: HashMap<String, String>,
    description: String,
}

fn member_view(daemon: &Daemon, member: &Member) -> MemberView {
    let status = daemon.member_status(member).to_string();
    let message = match status.as_str() {
        "online" => "Fully operational".to_string(),
        "offline" => "No heartbeat received".to_string(),
        "evacuated" => "Unavailable due to maintenance".to_string(),
        _ => "Waiting for join to complete".to_string(),
    };

    MemberView {
        server_name: member.name.clone(),
        url: format!("/1.0/cluster/members/{}", member.name),
        database: member.is_database(),
        status,
        message,
        architecture: member.architecture.clone(),
        roles: member.roles.clone(),
        failure_domain: member.failure_domain.clone(),
        groups: member.groups.clone(),
        config: member.config.clone(),
        description: member.description.clone(),
    }
}

async fn members_get(
    State(daemon): State<Arc<Daemon>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let state = daemon.gateway().snapshot();
    let filter = params.get("filter").map(String::as_str).unwrap_or("");

    let members: Vec<&Member> = state
        .members_sorted()
        .into_iter()
        .filter(|m| filter.is_empty() || m.name.contains(filter))
        .collect();

    if params.get("recursion").map(String::as_str) == Some("1") {
        let views: Vec<MemberView> = members
            .into_iter()
            .map(|m| member_view(&daemon, m))
            .collect();
        return Json(serde_json::json!(views));
    }

    let urls: Vec<String> = members
        .into_iter()
        .map(|m| format!("/1.0/cluster/members/{}", m.name))
        .collect();
    Json(serde_json::json!(urls))
}

#[derive(Debug, Deserialize)]
struct MembersPostRequest {
    server_name: String,
}

async fn members_post(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<MembersPostRequest>,
) -> ApiResult<impl IntoResponse> {
    if !daemon.is_clustered() {
        return Err(ApiError::PreconditionFailed(
            "This server is not clustered".to_string(),
        ));
    }

    // Join tokens live on the leader; proxy so the operation is recorded
    // there.
    let gateway = daemon.gateway();
    if !gateway.is_leader() {
        let leader = gateway
            .leader_address()
            .ok_or_else(|| ApiError::unavailable("Cluster has no leader"))?;
        let (status, body) = daemon
            .router()
            .proxy(
                &leader,
                reqwest::Method::POST,
                "/1.0/cluster/members",
                Some(serde_json::json!({ "server_name": req.server_name })),
            )
            .await?;
        return Ok((status, Json(body)));
    }

    let (token, op) = daemon.issue_token(&req.server_name)?;

    let mut metadata = op.metadata.clone();
    metadata.insert(
        "token".to_string(),
        serde_json::json!(token.encode().map_err(ApiError::Internal)?),
    );
    daemon.registry().update_metadata(&op.id, metadata);

    let op = daemon.registry().get(&op.id);
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!(op))))
}

async fn member_get(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let state = daemon.gateway().snapshot();
    let member = state
        .member_by_name(&name)
        .ok_or_else(|| ApiError::not_found(format!("Member {} not found", name)))?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = member_etag(member).parse() {
        headers.insert(axum::http::header::ETAG, value);
    }

    Ok((headers, Json(member_view(&daemon, member))))
}

#[derive(Debug, Deserialize, Default)]
struct MemberUpdateRequest {
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    failure_domain: Option<String>,
    #[serde(default)]
    groups: Option<Vec<String>>,
    #[serde(default)]
    config: Option<HashMap<String, String>>,
    #[serde(default)]
    description: Option<String>,
}

async fn apply_member_update(
    daemon: &Arc<Daemon>,
    name: &str,
    headers: &HeaderMap,
    req: MemberUpdateRequest,
    patch: bool,
) -> Result<(), ApiError> {
    let gateway = daemon.gateway();
    let state = gateway.snapshot();
    let member = state
        .member_by_name(name)
        .ok_or_else(|| ApiError::not_found(format!("Member {} not found", name)))?;

    if let Some(expected) = headers.get(axum::http::header::IF_MATCH) {
        let actual = member_etag(member);
        if expected.to_str().map(|v| v != actual).unwrap_or(true) {
            return Err(ApiError::PreconditionFailed("ETag mismatch".to_string()));
        }
    }

    let roles = match (patch, req.roles) {
        (_, Some(roles)) => roles,
        (true, None) => member.roles.clone(),
        (false, None) => Vec::new(),
    };
    let groups = match (patch, req.groups) {
        (_, Some(groups)) => groups,
        (true, None) => member.groups.clone(),
        (false, None) => Vec::new(),
    };
    let config = match (patch, req.config) {
        (_, Some(config)) if patch => {
            let mut merged = member.config.clone();
            merged.extend(config);
            merged
        }
        (_, Some(config)) => config,
        (true, None) => member.config.clone(),
        (false, None) => HashMap::new(),
    };
    let failure_domain = req
        .failure_domain
        .unwrap_or_else(|| member.failure_domain.clone());
    let description = req
        .description
        .unwrap_or_else(|| member.description.clone());

    membership::update_member(
        gateway.as_ref(),
        name,
        roles,
        failure_domain,
        groups,
        config,
        description,
    )
    .await
}

async fn member_put(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<MemberUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    apply_member_update(&daemon, &name, &headers, req, false).await?;
    Ok(StatusCode::OK)
}

async fn member_patch(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<MemberUpdateRequest>,
) -> ApiResult<impl IntoResponse> {
    apply_member_update(&daemon, &name, &headers, req, true).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct MemberRenameRequest {
    server_name: String,
}

async fn member_rename(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
    Json(req): Json<MemberRenameRequest>,
) -> ApiResult<impl IntoResponse> {
    let gateway = daemon.gateway();

    if !gateway.is_leader() {
        let leader = gateway
            .leader_address()
            .ok_or_else(|| ApiError::unavailable("Cluster has no leader"))?;
        return Err(ApiError::NotLeader {
            leader: Some(format!("http://{}/1.0/cluster/members/{}", leader, name)),
        });
    }

    membership::rename(gateway.as_ref(), &name, &req.server_name).await?;
    info!("Renamed cluster member {} to {}", name, req.server_name);
    Ok(StatusCode::OK)
}

async fn member_delete(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let force = params.get("force").map(String::as_str) == Some("1");
    let pending = params.get("pending").map(String::as_str) == Some("1");

    let gateway = daemon.gateway();
    let leader = gateway
        .leader_address()
        .ok_or_else(|| ApiError::unavailable("Cluster has no leader"))?;
    let removing_self = name == daemon.server_name();

    // A member deleting itself takes the self-removal lock before anything
    // is forwarded; the leader's disable callback will block on it until
    // our response to the original client is out.
    let guard = if removing_self {
        Some(daemon.router().acquire_disable_guard().await)
    } else {
        None
    };

    let path = format!(
        "/1.0/cluster/members/{}?force={}&pending={}",
        name,
        if force { "1" } else { "0" },
        if pending { "1" } else { "0" }
    );

    if leader != gateway.local_address() {
        let (status, body) = daemon
            .router()
            .proxy(&leader, reqwest::Method::DELETE, &path, None)
            .await?;

        if let Some(guard) = guard {
            Router::release_after_response(guard);
        }
        return Ok((status, Json(body)));
    }

    let result = {
        let _mu = daemon.membership_mu.lock().await;
        membership::leave(&gateway, &name, force, pending).await
    };

    let address = match result {
        Ok(address) => address,
        Err(ApiError::NotLeader { leader: Some(new_leader) }) => {
            // Leadership was handed off mid-removal (we were deleting the
            // leader). Retry against the new leader.
            let (status, body) = daemon
                .router()
                .proxy(&new_leader, reqwest::Method::DELETE, &path, None)
                .await?;
            if let Some(guard) = guard {
                Router::release_after_response(guard);
            }
            return Ok((status, Json(body)));
        }
        Err(e) => return Err(e),
    };

    daemon.trigger_rebalance();

    // Ask the removed member to reset itself to stand-alone.
    if !pending {
        let url = format!("http://{}/internal/cluster/disable", address);
        if let Err(e) = daemon.router().client().post(&url).send().await {
            if force {
                warn!("Failed to request reset of removed member: {}", e);
            } else {
                return Err(ApiError::unavailable(format!(
                    "Failed to clean up removed member: {}",
                    e
                )));
            }
        }
    }

    if let Some(guard) = guard {
        Router::release_after_response(guard);
    }

    Ok((StatusCode::OK, Json(serde_json::Value::Null)))
}

async fn member_state_get(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let gateway = daemon.gateway();
    let state = gateway.snapshot();

    let owner = Router::resolve_owner(&state, &name)?;
    if owner != gateway.local_address() {
        let (status, body) = daemon
            .router()
            .proxy(
                &owner,
                reqwest::Method::GET,
                &format!("/1.0/cluster/members/{}/state", name),
                None,
            )
            .await?;
        return Ok((status, Json(body)));
    }

    let member = state
        .member_by_name(&name)
        .ok_or_else(|| ApiError::not_found(format!("Member {} not found", name)))?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "status": daemon.member_status(member),
            "instances": state.instances_on(&name).len(),
        })),
    ))
}

async fn member_state_post(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
    Json(req): Json<MemberStatePost>,
) -> ApiResult<impl IntoResponse> {
    let gateway = daemon.gateway();
    let state = gateway.snapshot();

    let owner = Router::resolve_owner(&state, &name)?;
    if owner != gateway.local_address() {
        let (status, body) = daemon
            .router()
            .proxy(
                &owner,
                reqwest::Method::POST,
                &format!("/1.0/cluster/members/{}/state", name),
                Some(serde_json::to_value(&req).map_err(|e| ApiError::Internal(e.into()))?),
            )
            .await?;
        return Ok((status, Json(body)));
    }

    let mode = match req.mode.as_deref() {
        Some(mode) => Some(
            mode.parse::<EvacuateMode>()
                .map_err(|e| ApiError::PreconditionFailed(e.to_string()))?,
        ),
        None => None,
    };

    let description = match req.action.as_str() {
        "evacuate" => format!("Evacuating member {}", name),
        "restore" => format!("Restoring member {}", name),
        other => {
            return Err(ApiError::PreconditionFailed(format!(
                "Invalid action: {}",
                other
            )));
        }
    };

    let op = daemon
        .registry()
        .create(OperationClass::Task, &description, HashMap::new());
    let registry = daemon.registry().clone();
    let op_id = op.id.clone();
    let evacuator = daemon.evacuator();
    let action = req.action.clone();
    let member_name = name.clone();

    tokio::spawn(async move {
        let result = match action.as_str() {
            "evacuate" => evacuator.evacuate(&member_name, mode).await,
            _ => evacuator.restore(&member_name).await,
        };

        match result {
            Ok(report) => {
                let mut metadata = HashMap::new();
                metadata.insert(
                    "report".to_string(),
                    serde_json::to_value(&report).unwrap_or_default(),
                );
                registry.update_metadata(&op_id, metadata);
                registry.succeed(&op_id);
            }
            Err(e) => registry.fail(&op_id, &e.to_string()),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!(op))))
}

#[derive(Debug, Deserialize)]
struct ClusterConfigPut {
    config: HashMap<String, String>,
}

async fn cluster_config_put(
    State(daemon): State<Arc<Daemon>>,
    Json(req): Json<ClusterConfigPut>,
) -> ApiResult<impl IntoResponse> {
    let gateway = daemon.gateway();
    membership::set_cluster_config(gateway.as_ref(), req.config).await?;
    Ok(StatusCode::OK)
}

async fn operations_get(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    Json(daemon.registry().list())
}

async fn operation_get(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let op = daemon
        .registry()
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("Operation {} not found", id)))?;
    Ok(Json(op))
}

async fn operation_delete(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    daemon
        .registry()
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("Operation {} not found", id)))?;
    daemon.registry().cancel(&id);
    Ok(StatusCode::OK)
}
