use crate::error::ApiError;
use crate::replicator::{ClusterState, Gateway, Replicator};
use crate::types::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleChange {
    // Offline voter dropped from the configuration without being contacted.
    DemoteOffline { name: String },
    PromoteToVoter { name: String },
    DemoteToStandby { name: String },
    PromoteToStandby { name: String },
    DemoteToSpare { name: String },
}

impl RoleChange {
    pub fn member_name(&self) -> &str {
        match self {
            RoleChange::DemoteOffline { name }
            | RoleChange::PromoteToVoter { name }
            | RoleChange::DemoteToStandby { name }
            | RoleChange::PromoteToStandby { name }
            | RoleChange::DemoteToSpare { name } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub name: String,
    pub role: RaftRole,
    pub raft_nodes: Vec<RaftNodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoverRequest {
    pub name: String,
    pub address: String,
}

pub fn voter_target(reachable: usize, max_voters: usize) -> usize {
    let mut want = reachable.min(max_voters);
    if want % 2 == 0 {
        want = want.saturating_sub(1);
    }
    want.max(1)
}

pub fn standby_target(reachable: usize, want_voters: usize, max_standbys: usize) -> usize {
    reachable.saturating_sub(want_voters).min(max_standbys)
}

fn domain_counts<'a>(members: impl Iterator<Item = &'a Member>) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for member in members {
        *counts.entry(member.failure_domain.clone()).or_insert(0) += 1;
    }
    counts
}

fn promotion_candidate<'a>(
    candidates: &[&'a Member],
    current_domains: &HashMap<String, usize>,
) -> Option<&'a Member> {
    let mut pool: Vec<&Member> = candidates.to_vec();
    pool.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.name.cmp(&b.name)));

    // Prefer a candidate whose failure domain is not yet represented; fall
    // back to any candidate when the domain rule cannot be satisfied.
    pool.iter()
        .find(|m| current_domains.get(&m.failure_domain).copied().unwrap_or(0) == 0)
        .copied()
        .or_else(|| pool.first().copied())
}

fn demotion_candidate<'a>(pool: &[&'a Member], leader_name: &str) -> Option<&'a Member> {
    let eligible: Vec<&Member> = pool
        .iter()
        .filter(|m| m.name != leader_name)
        .copied()
        .collect();
    if eligible.is_empty() {
        return None;
    }

    let counts = domain_counts(pool.iter().copied());
    let max_count = eligible
        .iter()
        .map(|m| counts.get(&m.failure_domain).copied().unwrap_or(0))
        .max()
        .unwrap_or(0);

    eligible
        .into_iter()
        .filter(|m| counts.get(&m.failure_domain).copied().unwrap_or(0) == max_count)
        .max_by_key(|m| m.id)
}

// Computes the role changes needed to converge on the voter and stand-by
// targets. Pure over a snapshot; the caller executes the changes and runs
// the planner again on the next trigger.
pub fn plan_rebalance(
    state: &ClusterState,
    leader_name: &str,
    now: DateTime<Utc>,
) -> Vec<RoleChange> {
    let threshold = state.config.offline_threshold();
    let max_voters = state.config.max_voters();
    let max_standbys = state.config.max_standbys();

    let mut roles: HashMap<String, RaftRole> = state
        .members
        .values()
        .map(|m| (m.name.clone(), m.raft_role))
        .collect();

    let eligible: Vec<&Member> = state
        .members_sorted()
        .into_iter()
        .filter(|m| m.state != MemberState::Pending)
        .collect();
    let reachable: Vec<&Member> = eligible
        .iter()
        .filter(|m| !m.is_offline(threshold, now))
        .copied()
        .collect();

    let want_voters = voter_target(reachable.len(), max_voters);
    let want_standbys = standby_target(reachable.len(), want_voters, max_standbys);

    let mut changes = Vec::new();

    loop {
        let voters: Vec<&Member> = eligible
            .iter()
            .filter(|m| roles[&m.name] == RaftRole::Voter)
            .copied()
            .collect();
        let standbys: Vec<&Member> = eligible
            .iter()
            .filter(|m| roles[&m.name] == RaftRole::Standby)
            .copied()
            .collect();
        let spares: Vec<&Member> = eligible
            .iter()
            .filter(|m| matches!(roles[&m.name], RaftRole::Spare | RaftRole::None))
            .copied()
            .collect();

        let reachable_standbys: Vec<&Member> = standbys
            .iter()
            .filter(|m| !m.is_offline(threshold, now))
            .copied()
            .collect();
        let reachable_spares: Vec<&Member> = spares
            .iter()
            .filter(|m| !m.is_offline(threshold, now))
            .copied()
            .collect();

        // Offline voters go first, as long as a replacement exists.
        let offline_voter = voters
            .iter()
            .find(|m| m.is_offline(threshold, now))
            .copied();
        if let Some(victim) = offline_voter {
            if !reachable_standbys.is_empty() || !reachable_spares.is_empty() {
                roles.insert(victim.name.clone(), RaftRole::Spare);
                changes.push(RoleChange::DemoteOffline {
                    name: victim.name.clone(),
                });
                continue;
            }
        }

        if voters.len() < want_voters {
            let domains = domain_counts(voters.iter().copied());
            if let Some(candidate) = promotion_candidate(&reachable_standbys, &domains) {
                roles.insert(candidate.name.clone(), RaftRole::Voter);
                changes.push(RoleChange::PromoteToVoter {
                    name: candidate.name.clone(),
                });
                continue;
            }
            // Voters are only drawn from stand-bys; pull a spare up one
            // step and promote it on the next pass.
            if let Some(candidate) = promotion_candidate(&reachable_spares, &domains) {
                roles.insert(candidate.name.clone(), RaftRole::Standby);
                changes.push(RoleChange::PromoteToStandby {
                    name: candidate.name.clone(),
                });
                continue;
            }
        }

        if voters.len() > want_voters {
            if let Some(victim) = demotion_candidate(&voters, leader_name) {
                if victim.is_offline(threshold, now) {
                    roles.insert(victim.name.clone(), RaftRole::Spare);
                    changes.push(RoleChange::DemoteOffline {
                        name: victim.name.clone(),
                    });
                } else {
                    roles.insert(victim.name.clone(), RaftRole::Standby);
                    changes.push(RoleChange::DemoteToStandby {
                        name: victim.name.clone(),
                    });
                }
                continue;
            }
        }

        if standbys.len() < want_standbys {
            let domains = domain_counts(voters.iter().chain(standbys.iter()).copied());
            if let Some(candidate) = promotion_candidate(&reachable_spares, &domains) {
                roles.insert(candidate.name.clone(), RaftRole::Standby);
                changes.push(RoleChange::PromoteToStandby {
                    name: candidate.name.clone(),
                });
                continue;
            }
        }

        if standbys.len() > want_standbys {
            if let Some(victim) = standbys.iter().max_by_key(|m| m.id) {
                roles.insert(victim.name.clone(), RaftRole::Spare);
                changes.push(RoleChange::DemoteToSpare {
                    name: victim.name.clone(),
                });
                continue;
            }
        }

        break;
    }

    changes
}

async fn notify_assign(
    client: &reqwest::Client,
    member: &Member,
    role: RaftRole,
    raft_nodes: Vec<RaftNodeInfo>,
) {
    let url = format!("http://{}/internal/cluster/assign", member.address);
    let req = AssignRequest {
        name: member.name.clone(),
        role,
        raft_nodes,
    };
    if let Err(e) = client.post(&url).json(&req).send().await {
        warn!("Failed to notify {} of role change: {}", member.name, e);
    }
}

async fn execute_change(
    gateway: &Gateway,
    client: &reqwest::Client,
    state: &ClusterState,
    change: &RoleChange,
) -> Result<()> {
    let member = state
        .member_by_name(change.member_name())
        .context("Member disappeared during rebalance")?
        .clone();

    match change {
        RoleChange::DemoteOffline { .. } => {
            gateway.demote_offline_node(member.id).await?;
            gateway.remove_node(member.id).await?;
            gateway
                .apply(ClusterCommand::SetRaftRole {
                    name: member.name.clone(),
                    role: RaftRole::Spare,
                })
                .await?;
        }
        RoleChange::PromoteToVoter { .. } => {
            if !gateway.has_connectivity(&member.address).await {
                anyhow::bail!("Member {} is not reachable", member.name);
            }
            gateway
                .add_voter(member.id, member.address.clone(), member.name.clone())
                .await?;
            gateway
                .apply(ClusterCommand::SetRaftRole {
                    name: member.name.clone(),
                    role: RaftRole::Voter,
                })
                .await?;
            notify_assign(client, &member, RaftRole::Voter, gateway.raft_nodes()).await;
        }
        RoleChange::DemoteToStandby { .. } => {
            gateway.demote_voter(member.id).await?;
            gateway
                .apply(ClusterCommand::SetRaftRole {
                    name: member.name.clone(),
                    role: RaftRole::Standby,
                })
                .await?;
            notify_assign(client, &member, RaftRole::Standby, gateway.raft_nodes()).await;
        }
        RoleChange::PromoteToStandby { .. } => {
            if !gateway.has_connectivity(&member.address).await {
                anyhow::bail!("Member {} is not reachable", member.name);
            }
            gateway
                .add_standby(member.id, member.address.clone(), member.name.clone())
                .await?;
            gateway
                .apply(ClusterCommand::SetRaftRole {
                    name: member.name.clone(),
                    role: RaftRole::Standby,
                })
                .await?;
            notify_assign(client, &member, RaftRole::Standby, gateway.raft_nodes()).await;
        }
        RoleChange::DemoteToSpare { .. } => {
            gateway.remove_node(member.id).await?;
            gateway
                .apply(ClusterCommand::SetRaftRole {
                    name: member.name.clone(),
                    role: RaftRole::Spare,
                })
                .await?;
            notify_assign(client, &member, RaftRole::Spare, gateway.raft_nodes()).await;
        }
    }

    Ok(())
}

// One full rebalance pass. Returns true when at least one role changed.
// Raft errors are logged and retried on the next trigger rather than
// propagated.
pub async fn rebalance(gateway: &Gateway, client: &reqwest::Client) -> Result<bool, ApiError> {
    if !gateway.is_leader() {
        return Err(ApiError::NotLeader {
            leader: gateway.leader_address(),
        });
    }

    let state = gateway.snapshot();
    let leader_name = state
        .member_by_id(gateway.node_id())
        .map(|m| m.name.clone())
        .unwrap_or_default();

    let changes = plan_rebalance(&state, &leader_name, Utc::now());
    if changes.is_empty() {
        return Ok(false);
    }

    info!("Rebalancing member roles: {} change(s)", changes.len());

    let mut applied = false;
    for change in &changes {
        let current = gateway.snapshot();
        match execute_change(gateway, client, &current, change).await {
            Ok(()) => applied = true,
            Err(e) => {
                warn!("Failed to apply role change {:?}: {}", change, e);
            }
        }
    }

    Ok(applied)
}

// Handover runs on the leader on behalf of a departing voter: promote a
// replacement using the rebalance selection rule, then demote the departing
// member. Both steps are idempotent.
pub async fn handover(
    gateway: &Gateway,
    client: &reqwest::Client,
    req: &HandoverRequest,
) -> Result<(), ApiError> {
    if !gateway.is_leader() {
        return Err(ApiError::NotLeader {
            leader: gateway.leader_address(),
        });
    }

    // The departing member may be us. Hand leadership off and let the
    // caller retry against the new leader.
    if req.address == gateway.local_address() {
        gateway
            .transfer_leadership()
            .await
            .context("Failed to transfer leadership before handover")?;
        return Err(ApiError::NotLeader {
            leader: gateway.leader_address(),
        });
    }

    let state = gateway.snapshot();
    let departing = state
        .member_by_name(&req.name)
        .ok_or_else(|| ApiError::not_found(format!("Member {} not found", req.name)))?
        .clone();

    if departing.raft_role != RaftRole::Voter {
        return Ok(());
    }

    let threshold = state.config.offline_threshold();
    let now = Utc::now();
    let voters: Vec<&Member> = state
        .voters()
        .into_iter()
        .filter(|m| m.name != departing.name)
        .collect();
    let domains = domain_counts(voters.iter().copied());
    let candidates: Vec<&Member> = state
        .members_sorted()
        .into_iter()
        .filter(|m| {
            m.state != MemberState::Pending
                && m.name != departing.name
                && m.raft_role != RaftRole::Voter
                && !m.is_offline(threshold, now)
        })
        .collect();

    if let Some(replacement) = promotion_candidate(&candidates, &domains) {
        let change = RoleChange::PromoteToVoter {
            name: replacement.name.clone(),
        };
        execute_change(gateway, client, &state, &change)
            .await
            .context("Failed to promote replacement voter")?;
    }

    let change = RoleChange::DemoteToStandby {
        name: departing.name.clone(),
    };
    execute_change(gateway, client, &state, &change)
        .await
        .context("Failed to demote departing voter")?;

    Ok(())
}
