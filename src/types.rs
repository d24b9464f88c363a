use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type MemberId = u64;
pub type InstanceName = String;

pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum RaftRole {
    Voter,
    #[serde(rename = "stand-by")]
    Standby,
    Spare,
    None,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Voter => write!(f, "voter"),
            RaftRole::Standby => write!(f, "stand-by"),
            RaftRole::Spare => write!(f, "spare"),
            RaftRole::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Pending,
    Created,
    Evacuated,
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Pending => write!(f, "pending"),
            MemberState::Created => write!(f, "created"),
            MemberState::Evacuated => write!(f, "evacuated"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    pub address: String,
    pub architecture: String,
    pub schema_version: u64,
    pub api_extensions: u64,
    pub raft_role: RaftRole,
    pub state: MemberState,
    pub heartbeat_at: DateTime<Utc>,
    pub roles: Vec<String>,
    pub failure_domain: String,
    pub groups: Vec<String>,
    pub config: HashMap<String, String>,
    pub description: String,
}

impl Member {
    pub fn is_offline(&self, threshold_secs: u64, now: DateTime<Utc>) -> bool {
        now - self.heartbeat_at > Duration::seconds(threshold_secs as i64)
    }

    pub fn is_database(&self) -> bool {
        matches!(self.raft_role, RaftRole::Voter | RaftRole::Standby)
    }

    pub fn scheduler_policy(&self) -> &str {
        self.config
            .get("scheduler.instance")
            .map(String::as_str)
            .unwrap_or("all")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinToken {
    pub server_name: String,
    pub secret: String,
    pub fingerprint: String,
    pub addresses: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl JoinToken {
    pub fn encode(&self) -> anyhow::Result<String> {
        let raw = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(raw))
    }

    pub fn decode(token: &str) -> anyhow::Result<Self> {
        let raw = base64::engine::general_purpose::STANDARD.decode(token.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EvacuateMode {
    #[default]
    Auto,
    Stop,
    StatefulStop,
    ForceStop,
    Migrate,
    LiveMigrate,
}

impl std::str::FromStr for EvacuateMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(EvacuateMode::Auto),
            "stop" => Ok(EvacuateMode::Stop),
            "stateful-stop" => Ok(EvacuateMode::StatefulStop),
            "force-stop" => Ok(EvacuateMode::ForceStop),
            "migrate" => Ok(EvacuateMode::Migrate),
            "live-migrate" => Ok(EvacuateMode::LiveMigrate),
            other => anyhow::bail!("Invalid evacuation mode: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    Container,
    VirtualMachine,
}

impl InstanceKind {
    pub fn supports_live_migration(&self) -> bool {
        matches!(self, InstanceKind::VirtualMachine)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub name: InstanceName,
    pub member: String,
    pub kind: InstanceKind,
    pub architecture: String,
    pub config: HashMap<String, String>,
    pub running: bool,
}

impl InstanceRecord {
    pub fn autostart(&self) -> bool {
        self.config.get("boot.autostart").map(String::as_str) == Some("true")
    }

    pub fn was_running(&self) -> bool {
        self.config.get("volatile.last_state.power").map(String::as_str) == Some("running")
    }

    pub fn snapshot_schedule(&self) -> Option<&str> {
        self.config
            .get("snapshots.schedule")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeRecord {
    pub name: String,
    pub config: HashMap<String, String>,
}

impl VolumeRecord {
    pub fn snapshot_schedule(&self) -> Option<&str> {
        self.config
            .get("snapshots.schedule")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoragePoolInfo {
    pub name: String,
    pub driver: String,
    pub status: String,
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInfo {
    pub name: String,
    pub kind: String,
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RaftNodeInfo {
    pub id: MemberId,
    pub address: String,
    pub role: RaftRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterCommand {
    AddMember(Member),
    MarkCreated {
        name: String,
    },
    SetMemberState {
        name: String,
        state: MemberState,
    },
    SetRaftRole {
        name: String,
        role: RaftRole,
    },
    RenameMember {
        old: String,
        new: String,
    },
    RemoveMember {
        name: String,
    },
    UpdateMember {
        name: String,
        roles: Vec<String>,
        failure_domain: String,
        groups: Vec<String>,
        config: HashMap<String, String>,
        description: String,
    },
    MemberSeen {
        name: String,
        at: DateTime<Utc>,
    },
    SetClusterConfig {
        values: HashMap<String, String>,
    },
    AddTrustedCert {
        name: String,
        fingerprint: String,
        cert_pem: String,
    },
    RemoveTrustedCert {
        fingerprint: String,
    },
    PutInstance(InstanceRecord),
    SetInstanceLocation {
        name: InstanceName,
        member: String,
    },
    SetInstancePower {
        name: InstanceName,
        running: bool,
    },
    SetLastPowerState {
        name: InstanceName,
        power: String,
    },
    RemoveInstance {
        name: InstanceName,
    },
    PutVolume(VolumeRecord),
    PutStoragePool(StoragePoolInfo),
    PutNetwork(NetworkInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub server_name: String,
    pub enabled: bool,
    pub member_config: Vec<MemberConfigKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfigKey {
    pub entity: String,
    pub name: String,
    pub key: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterPut {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cluster_address: String,
    #[serde(default)]
    pub cluster_certificate: String,
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub cluster_token: String,
    #[serde(default)]
    pub member_config: Vec<MemberConfigKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatePost {
    pub action: String,
    #[serde(default)]
    pub mode: Option<String>,
}
