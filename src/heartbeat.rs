use crate::replicator::{Gateway, Replicator};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub name: String,
    pub address: String,
    pub schema_version: u64,
    pub api_extensions: u64,
    pub raft_nodes: Vec<RaftNodeInfo>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub name: String,
    pub received_at: DateTime<Utc>,
}

// Local record of when each peer was last heard from. This is the node's
// own view; the cluster-wide offline decision is derived from the leader's
// replicated heartbeat timestamps, not from any follower's clock.
#[derive(Clone, Default)]
pub struct HeartbeatView {
    inner: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl HeartbeatView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, name: &str) {
        self.inner
            .write()
            .unwrap()
            .insert(name.to_string(), Utc::now());
    }

    pub fn last_seen(&self, name: &str) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap().get(name).copied()
    }
}

pub struct RoundOutcome {
    pub reachable: Vec<String>,
    pub unreachable: Vec<String>,
}

impl RoundOutcome {
    // A rebalance is worth scheduling when a voter or stand-by dropped off.
    pub fn lost_database_member(&self, state: &crate::replicator::ClusterState) -> bool {
        self.unreachable.iter().any(|name| {
            state
                .member_by_name(name)
                .map(|m| m.is_database())
                .unwrap_or(false)
        })
    }
}

// One heartbeat fan-out to every other member. On the leader the replies
// feed the replicated heartbeat timestamps that the offline view and the
// rebalancer read.
pub async fn heartbeat_round(
    gateway: &Gateway,
    client: &reqwest::Client,
    local_name: &str,
    local_address: &str,
) -> RoundOutcome {
    let state = gateway.snapshot();
    let payload = HeartbeatPayload {
        name: local_name.to_string(),
        address: local_address.to_string(),
        schema_version: crate::SCHEMA_VERSION,
        api_extensions: crate::API_EXTENSIONS,
        raft_nodes: gateway.raft_nodes(),
        sent_at: Utc::now(),
    };

    let mut outcome = RoundOutcome {
        reachable: Vec::new(),
        unreachable: Vec::new(),
    };

    for member in state.members_sorted() {
        if member.name == local_name || member.state == MemberState::Pending {
            continue;
        }

        let url = format!("http://{}/internal/cluster/heartbeat", member.address);
        let sent = tokio::time::timeout(
            HEARTBEAT_TIMEOUT,
            client.post(&url).json(&payload).send(),
        )
        .await;

        match sent {
            Ok(Ok(response)) if response.status().is_success() => {
                outcome.reachable.push(member.name.clone());
            }
            Ok(Ok(response)) => {
                debug!(
                    "Heartbeat to {} returned {}",
                    member.name,
                    response.status()
                );
                outcome.unreachable.push(member.name.clone());
            }
            Ok(Err(e)) => {
                debug!("Heartbeat to {} failed: {}", member.name, e);
                outcome.unreachable.push(member.name.clone());
            }
            Err(_) => {
                debug!("Heartbeat to {} timed out", member.name);
                outcome.unreachable.push(member.name.clone());
            }
        }
    }

    if gateway.is_leader() {
        let now = Utc::now();
        let mut seen = outcome.reachable.clone();
        seen.push(local_name.to_string());

        for name in seen {
            if let Err(e) = gateway
                .apply(ClusterCommand::MemberSeen { name, at: now })
                .await
            {
                warn!("Failed to record heartbeat timestamp: {}", e);
                break;
            }
        }
    }

    outcome
}
