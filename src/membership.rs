use crate::error::ApiError;
use crate::local_store::LocalStore;
use crate::replicator::{ClusterState, Gateway, Replicator};
use crate::types::*;
use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

// Pool config keys that legitimately differ between members and are
// excluded from the accept-time compatibility comparison.
const NODE_SPECIFIC_POOL_KEYS: &[&str] = &[
    "source",
    "size",
    "zfs.pool_name",
    "lvm.vg_name",
    "lvm.thinpool_name",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub name: String,
    pub address: String,
    pub schema_version: u64,
    pub api_extensions: u64,
    pub architecture: String,
    pub secret: String,
    #[serde(default)]
    pub storage_pools: Vec<StoragePoolInfo>,
    #[serde(default)]
    pub networks: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptResponse {
    pub member_id: MemberId,
    pub raft_nodes: Vec<RaftNodeInfo>,
    pub cluster_certificate: String,
    pub cluster_key: String,
}

pub fn validate_accept(state: &ClusterState, req: &AcceptRequest) -> Result<(), ApiError> {
    for member in state.members.values() {
        if member.name == req.name {
            return Err(ApiError::conflict(format!(
                "The cluster already has a member with name {}",
                req.name
            )));
        }
        if member.address == req.address {
            return Err(ApiError::conflict(format!(
                "The cluster already has a member with address {}",
                req.address
            )));
        }
    }

    let min_schema = state.members.values().map(|m| m.schema_version).min();
    if let Some(min_schema) = min_schema {
        if req.schema_version < min_schema {
            return Err(ApiError::PreconditionFailed(format!(
                "The joining server version is too old (schema {} < {})",
                req.schema_version, min_schema
            )));
        }
    }

    let min_api = state.members.values().map(|m| m.api_extensions).min();
    if let Some(min_api) = min_api {
        if req.api_extensions < min_api {
            return Err(ApiError::PreconditionFailed(format!(
                "The joining server API is too old ({} extensions < {})",
                req.api_extensions, min_api
            )));
        }
    }

    check_storage_pools_match(state, &req.storage_pools)?;
    check_networks_match(state, &req.networks)?;

    Ok(())
}

fn check_storage_pools_match(
    state: &ClusterState,
    declared: &[StoragePoolInfo],
) -> Result<(), ApiError> {
    for pool in state.storage_pools.values() {
        if pool.status == "pending" {
            continue;
        }

        let found = declared.iter().find(|p| p.name == pool.name);
        let Some(found) = found else {
            return Err(ApiError::PreconditionFailed(format!(
                "Missing storage pool {}",
                pool.name
            )));
        };

        if found.driver != pool.driver {
            return Err(ApiError::PreconditionFailed(format!(
                "Mismatching driver for storage pool {}",
                pool.name
            )));
        }

        for (key, value) in &pool.config {
            if NODE_SPECIFIC_POOL_KEYS.contains(&key.as_str()) {
                continue;
            }
            if found.config.get(key) != Some(value) {
                return Err(ApiError::PreconditionFailed(format!(
                    "Mismatching config key {} for storage pool {}",
                    key, pool.name
                )));
            }
        }
    }

    Ok(())
}

fn check_networks_match(state: &ClusterState, declared: &[NetworkInfo]) -> Result<(), ApiError> {
    for network in state.networks.values() {
        if network.kind == "ovn" {
            continue;
        }

        let found = declared.iter().find(|n| n.name == network.name);
        let Some(found) = found else {
            return Err(ApiError::PreconditionFailed(format!(
                "Missing network {}",
                network.name
            )));
        };

        if found.kind != network.kind {
            return Err(ApiError::PreconditionFailed(format!(
                "Mismatching type for network {}",
                network.name
            )));
        }
    }

    Ok(())
}

pub fn validate_member_update(
    current: &Member,
    roles: &[String],
    groups: &[String],
    config: &HashMap<String, String>,
) -> Result<(), ApiError> {
    let had_db = current.roles.iter().any(|r| r == "database");
    let wants_db = roles.iter().any(|r| r == "database");
    if had_db != wants_db {
        return Err(ApiError::PreconditionFailed(
            "The database role is managed by the cluster and cannot be changed directly"
                .to_string(),
        ));
    }

    if groups.is_empty() {
        return Err(ApiError::PreconditionFailed(
            "Cluster members need to belong to at least one group".to_string(),
        ));
    }

    for (key, value) in config {
        if key.starts_with("user.") {
            continue;
        }

        match key.as_str() {
            "scheduler.instance" => {
                if !matches!(value.as_str(), "all" | "group" | "manual") {
                    return Err(ApiError::PreconditionFailed(format!(
                        "Invalid value for scheduler.instance: {}",
                        value
                    )));
                }
            }
            other => {
                return Err(ApiError::PreconditionFailed(format!(
                    "Unknown member configuration key: {}",
                    other
                )));
            }
        }
    }

    Ok(())
}

pub fn member_etag(member: &Member) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(member).unwrap_or_default());
    hex::encode(hasher.finalize())
}

// Installs this node as the first member of a fresh cluster.
pub async fn bootstrap(
    gateway: &Gateway,
    local_store: &LocalStore,
    name: &str,
    address: &str,
    architecture: &str,
) -> Result<(), ApiError> {
    if address.is_empty() {
        return Err(ApiError::PreconditionFailed(
            "No cluster address set on this member".to_string(),
        ));
    }

    let state = gateway.snapshot();
    if !state.members.is_empty() {
        return Err(ApiError::conflict("This server is already clustered"));
    }

    // A stand-alone daemon already runs a single-node Raft; only a truly
    // fresh node needs the initial configuration written.
    if gateway.raft_nodes().is_empty() {
        gateway
            .initialize_single(name)
            .await
            .context("Failed to initialize Raft")?;
    }
    gateway.wait_leadership().await?;

    let member = Member {
        id: 0,
        name: name.to_string(),
        address: address.to_string(),
        architecture: architecture.to_string(),
        schema_version: crate::SCHEMA_VERSION,
        api_extensions: crate::API_EXTENSIONS,
        raft_role: RaftRole::Voter,
        state: MemberState::Created,
        heartbeat_at: Utc::now(),
        roles: vec!["database".to_string()],
        failure_domain: String::new(),
        groups: vec![DEFAULT_GROUP.to_string()],
        config: HashMap::new(),
        description: String::new(),
    };

    gateway.apply(ClusterCommand::AddMember(member)).await?;
    gateway
        .apply(ClusterCommand::MarkCreated {
            name: name.to_string(),
        })
        .await?;

    local_store
        .set_cluster_address(address)
        .context("Failed to store cluster address")?;
    local_store
        .set_server_name(name)
        .context("Failed to store server name")?;
    local_store
        .set_raft_nodes(&gateway.raft_nodes())
        .context("Failed to cache raft nodes")?;

    info!("Bootstrapped cluster with founding member {}", name);
    Ok(())
}

// Leader-side half of the join protocol: records the joiner as a pending
// member and attaches it to the Raft configuration as a learner so the log
// starts flowing before the joiner flips to created.
pub async fn accept(gateway: &Gateway, req: &AcceptRequest) -> Result<AcceptResponse, ApiError> {
    if !gateway.is_leader() {
        return Err(ApiError::NotLeader {
            leader: gateway.leader_address(),
        });
    }

    let state = gateway.snapshot();
    validate_accept(&state, req)?;

    let member = Member {
        id: 0,
        name: req.name.clone(),
        address: req.address.clone(),
        architecture: req.architecture.clone(),
        schema_version: req.schema_version,
        api_extensions: req.api_extensions,
        raft_role: RaftRole::Spare,
        state: MemberState::Pending,
        heartbeat_at: Utc::now(),
        roles: Vec::new(),
        failure_domain: String::new(),
        groups: vec![DEFAULT_GROUP.to_string()],
        config: HashMap::new(),
        description: String::new(),
    };

    gateway.apply(ClusterCommand::AddMember(member)).await?;

    let member_id = gateway
        .snapshot()
        .member_by_name(&req.name)
        .map(|m| m.id)
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("Accepted member row not found")))?;

    gateway
        .add_standby(member_id, req.address.clone(), req.name.clone())
        .await
        .context("Failed to attach joiner to the Raft configuration")?;

    info!(
        "Accepted member {} (id {}) at {}",
        req.name, member_id, req.address
    );

    Ok(AcceptResponse {
        member_id,
        raft_nodes: gateway.raft_nodes(),
        cluster_certificate: String::new(),
        cluster_key: String::new(),
    })
}

// Joiner-side completion: the local Raft instance is already part of the
// configuration, so wait for the log to catch up until our own pending row
// is visible, then flip it to created.
pub async fn join(
    gateway: &Gateway,
    local_store: &LocalStore,
    name: &str,
    address: &str,
    raft_nodes: &[RaftNodeInfo],
) -> Result<(), ApiError> {
    gateway.register_peers(raft_nodes);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        if gateway.snapshot().member_by_name(name).is_some() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            return Err(ApiError::unavailable(
                "Timed out waiting for the cluster log to replicate",
            ));
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    gateway
        .apply(ClusterCommand::MarkCreated {
            name: name.to_string(),
        })
        .await?;

    local_store
        .set_cluster_address(address)
        .context("Failed to store cluster address")?;
    local_store
        .set_server_name(name)
        .context("Failed to store server name")?;
    local_store
        .set_raft_nodes(raft_nodes)
        .context("Failed to cache raft nodes")?;

    info!("Joined cluster as member {}", name);
    Ok(())
}

// Leader-side removal. Returns the address of the removed member so the
// caller can request a reset on it.
pub async fn leave(
    gateway: &Gateway,
    name: &str,
    force: bool,
    pending: bool,
) -> Result<String, ApiError> {
    if !gateway.is_leader() {
        return Err(ApiError::NotLeader {
            leader: gateway.leader_address(),
        });
    }

    let state = gateway.snapshot();
    let member = state
        .member_by_name(name)
        .ok_or_else(|| ApiError::not_found(format!("Member {} not found", name)))?
        .clone();

    if pending {
        if member.state != MemberState::Pending {
            return Err(ApiError::conflict(format!(
                "Member {} is not pending",
                name
            )));
        }

        if let Err(e) = gateway.remove_node(member.id).await {
            warn!("Failed to drop pending member {} from Raft: {}", name, e);
        }
        purge(gateway, name).await?;
        return Ok(member.address);
    }

    if !force {
        let instances = state.instances_on(name);
        if !instances.is_empty() {
            return Err(ApiError::conflict(format!(
                "Member {} still has {} instances; evacuate it or use force",
                name,
                instances.len()
            )));
        }
    }

    // Removing the leader itself: hand leadership off first, then make the
    // caller retry against the new leader.
    if member.id == gateway.node_id() {
        gateway
            .transfer_leadership()
            .await
            .context("Failed to transfer leadership away from the departing member")?;
        return Err(ApiError::NotLeader {
            leader: gateway.leader_address(),
        });
    }

    match gateway.remove_node(member.id).await {
        Ok(()) => {}
        Err(e) if force => {
            warn!("Failed to remove member {} from Raft (forced): {}", name, e);
        }
        Err(e) => {
            return Err(ApiError::Internal(
                anyhow::Error::from(e).context("Failed to remove member from Raft"),
            ));
        }
    }

    purge(gateway, name).await?;
    info!("Removed member {} from the cluster", name);
    Ok(member.address)
}

// Row removal only. Valid once Raft has confirmed the member is out of the
// configuration (or never had it, for pending members).
pub async fn purge(gateway: &Gateway, name: &str) -> Result<(), ApiError> {
    gateway
        .apply(ClusterCommand::RemoveMember {
            name: name.to_string(),
        })
        .await?;
    Ok(())
}

pub async fn rename<R: Replicator + ?Sized>(
    replicator: &R,
    old: &str,
    new: &str,
) -> Result<(), ApiError> {
    let state = replicator.snapshot();

    if state.member_by_name(old).is_none() {
        return Err(ApiError::not_found(format!("Member {} not found", old)));
    }
    if state.member_by_name(new).is_some() {
        return Err(ApiError::conflict(format!(
            "A member named {} already exists",
            new
        )));
    }

    replicator
        .apply(ClusterCommand::RenameMember {
            old: old.to_string(),
            new: new.to_string(),
        })
        .await?;
    Ok(())
}

pub async fn update_member<R: Replicator + ?Sized>(
    replicator: &R,
    name: &str,
    roles: Vec<String>,
    failure_domain: String,
    groups: Vec<String>,
    config: HashMap<String, String>,
    description: String,
) -> Result<(), ApiError> {
    let state = replicator.snapshot();
    let member = state
        .member_by_name(name)
        .ok_or_else(|| ApiError::not_found(format!("Member {} not found", name)))?;

    validate_member_update(member, &roles, &groups, &config)?;

    replicator
        .apply(ClusterCommand::UpdateMember {
            name: name.to_string(),
            roles,
            failure_domain,
            groups,
            config,
            description,
        })
        .await?;
    Ok(())
}

pub async fn set_cluster_config<R: Replicator + ?Sized>(
    replicator: &R,
    values: HashMap<String, String>,
) -> Result<(), ApiError> {
    crate::config::ClusterConfig::validate(&values)
        .map_err(|e| ApiError::PreconditionFailed(e.to_string()))?;

    replicator
        .apply(ClusterCommand::SetClusterConfig { values })
        .await?;
    Ok(())
}
