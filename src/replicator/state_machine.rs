use crate::config::ClusterConfig;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustEntry {
    pub name: String,
    pub cert_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterState {
    pub members: HashMap<String, Member>,
    pub config: ClusterConfig,
    pub trusted_certs: HashMap<String, TrustEntry>,
    pub instances: HashMap<InstanceName, InstanceRecord>,
    pub volumes: HashMap<String, VolumeRecord>,
    pub storage_pools: HashMap<String, StoragePoolInfo>,
    pub networks: HashMap<String, NetworkInfo>,
    pub next_member_id: MemberId,
    pub last_applied_index: u64,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            next_member_id: 1,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, command: &ClusterCommand) {
        match command {
            ClusterCommand::AddMember(member) => {
                let mut member = member.clone();
                member.id = self.next_member_id;
                self.next_member_id += 1;
                self.members.insert(member.name.clone(), member);
            }
            ClusterCommand::MarkCreated { name } => {
                if let Some(member) = self.members.get_mut(name) {
                    member.state = MemberState::Created;
                    if member.groups.is_empty() {
                        member.groups.push(DEFAULT_GROUP.to_string());
                    }
                    member.heartbeat_at = Utc::now();
                }
            }
            ClusterCommand::SetMemberState { name, state } => {
                if let Some(member) = self.members.get_mut(name) {
                    member.state = *state;
                }
            }
            ClusterCommand::SetRaftRole { name, role } => {
                if let Some(member) = self.members.get_mut(name) {
                    member.raft_role = *role;
                    let has_db_role = member.roles.iter().any(|r| r == "database");
                    let wants_db_role =
                        matches!(role, RaftRole::Voter | RaftRole::Standby);
                    if wants_db_role && !has_db_role {
                        member.roles.push("database".to_string());
                    } else if !wants_db_role && has_db_role {
                        member.roles.retain(|r| r != "database");
                    }
                }
            }
            ClusterCommand::RenameMember { old, new } => {
                if let Some(mut member) = self.members.remove(old) {
                    member.name = new.clone();
                    self.members.insert(new.clone(), member);
                }
            }
            ClusterCommand::RemoveMember { name } => {
                self.members.remove(name);
            }
            ClusterCommand::UpdateMember {
                name,
                roles,
                failure_domain,
                groups,
                config,
                description,
            } => {
                if let Some(member) = self.members.get_mut(name) {
                    member.roles = roles.clone();
                    member.failure_domain = failure_domain.clone();
                    member.groups = groups.clone();
                    member.config = config.clone();
                    member.description = description.clone();
                }
            }
            ClusterCommand::MemberSeen { name, at } => {
                if let Some(member) = self.members.get_mut(name) {
                    if *at > member.heartbeat_at {
                        member.heartbeat_at = *at;
                    }
                }
            }
            ClusterCommand::SetClusterConfig { values } => {
                self.config.patch(values.clone());
            }
            ClusterCommand::AddTrustedCert {
                name,
                fingerprint,
                cert_pem,
            } => {
                self.trusted_certs.insert(
                    fingerprint.clone(),
                    TrustEntry {
                        name: name.clone(),
                        cert_pem: cert_pem.clone(),
                    },
                );
            }
            ClusterCommand::RemoveTrustedCert { fingerprint } => {
                self.trusted_certs.remove(fingerprint);
            }
            ClusterCommand::PutInstance(record) => {
                self.instances.insert(record.name.clone(), record.clone());
            }
            ClusterCommand::SetInstanceLocation { name, member } => {
                if let Some(instance) = self.instances.get_mut(name) {
                    instance.member = member.clone();
                }
            }
            ClusterCommand::SetInstancePower { name, running } => {
                if let Some(instance) = self.instances.get_mut(name) {
                    instance.running = *running;
                }
            }
            ClusterCommand::SetLastPowerState { name, power } => {
                if let Some(instance) = self.instances.get_mut(name) {
                    instance
                        .config
                        .insert("volatile.last_state.power".to_string(), power.clone());
                }
            }
            ClusterCommand::RemoveInstance { name } => {
                self.instances.remove(name);
            }
            ClusterCommand::PutVolume(record) => {
                self.volumes.insert(record.name.clone(), record.clone());
            }
            ClusterCommand::PutStoragePool(pool) => {
                self.storage_pools.insert(pool.name.clone(), pool.clone());
            }
            ClusterCommand::PutNetwork(network) => {
                self.networks.insert(network.name.clone(), network.clone());
            }
        }
    }

    pub fn member_by_name(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn member_by_address(&self, address: &str) -> Option<&Member> {
        self.members.values().find(|m| m.address == address)
    }

    pub fn member_by_id(&self, id: MemberId) -> Option<&Member> {
        self.members.values().find(|m| m.id == id)
    }

    pub fn members_sorted(&self) -> Vec<&Member> {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_by_key(|m| m.id);
        members
    }

    pub fn voters(&self) -> Vec<&Member> {
        self.members_sorted()
            .into_iter()
            .filter(|m| m.raft_role == RaftRole::Voter)
            .collect()
    }

    pub fn standbys(&self) -> Vec<&Member> {
        self.members_sorted()
            .into_iter()
            .filter(|m| m.raft_role == RaftRole::Standby)
            .collect()
    }

    pub fn online_members(&self, now: DateTime<Utc>) -> Vec<&Member> {
        let threshold = self.config.offline_threshold();
        self.members_sorted()
            .into_iter()
            .filter(|m| m.state == MemberState::Created && !m.is_offline(threshold, now))
            .collect()
    }

    pub fn instances_on(&self, member: &str) -> Vec<&InstanceRecord> {
        let mut instances: Vec<&InstanceRecord> = self
            .instances
            .values()
            .filter(|i| i.member == member)
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        instances
    }
}

#[derive(Clone)]
pub struct SharedState {
    inner: Arc<RwLock<ClusterState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ClusterState::new())),
        }
    }

    pub fn apply(&self, command: &ClusterCommand) {
        let mut state = self.inner.write().unwrap();
        state.apply(command);
    }

    pub fn snapshot(&self) -> ClusterState {
        self.inner.read().unwrap().clone()
    }

    pub fn set_last_applied(&self, index: u64) {
        self.inner.write().unwrap().last_applied_index = index;
    }

    pub fn last_applied(&self) -> u64 {
        self.inner.read().unwrap().last_applied_index
    }

    pub fn restore(&self, state: ClusterState) {
        *self.inner.write().unwrap() = state;
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
