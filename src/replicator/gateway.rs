use crate::replicator::network::ClusterNetworkFactory;
use crate::replicator::state_machine::SharedState;
use crate::replicator::storage::{create_storage, RaftMember, TypeConfig};
use crate::replicator::Replicator;
use crate::types::{ClusterCommand, MemberId, RaftNodeInfo, RaftRole};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use openraft::{ChangeMembers, Config, Raft, ServerState};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub type ClusterRaft = Raft<TypeConfig>;

pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Gateway {
    node_id: MemberId,
    address: String,
    raft: ClusterRaft,
    state: SharedState,
    network: ClusterNetworkFactory,
    client: reqwest::Client,
    global_db_path: PathBuf,
}

impl Gateway {
    pub async fn new<P: AsRef<Path>>(
        node_id: MemberId,
        address: String,
        data_dir: P,
    ) -> Result<Self> {
        let config = Config {
            heartbeat_interval: 500,
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            ..Default::default()
        };
        let config = Arc::new(config.validate()?);

        let state = SharedState::new();
        let global_db_path = data_dir.as_ref().join("database").join("global");
        std::fs::create_dir_all(&global_db_path)?;
        let (log_store, sm_store) = create_storage(&global_db_path, state.clone())?;
        let network = ClusterNetworkFactory::new();

        network.register_node(node_id, address.clone());

        let raft = Raft::new(node_id, config, network.clone(), log_store, sm_store).await?;

        let client = reqwest::Client::builder()
            .timeout(CONNECTIVITY_TIMEOUT)
            .build()?;

        info!(
            "Gateway initialized for member {} at {} (database {:?})",
            node_id, address, global_db_path
        );

        Ok(Self {
            node_id,
            address,
            raft,
            state,
            network,
            client,
            global_db_path,
        })
    }

    pub async fn initialize_single(&self, name: &str) -> Result<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            RaftMember {
                address: self.address.clone(),
                name: name.to_string(),
            },
        );
        self.raft.initialize(members).await?;
        Ok(())
    }

    // Joiner-side start: the node is already part of the configuration
    // returned by accept, so it only needs its peers registered and will
    // catch up from the leader's log.
    pub fn register_peers(&self, nodes: &[RaftNodeInfo]) {
        for node in nodes {
            self.network.register_node(node.id, node.address.clone());
        }
    }

    pub fn raft(&self) -> &ClusterRaft {
        &self.raft
    }

    pub fn node_id(&self) -> MemberId {
        self.node_id
    }

    pub fn local_address(&self) -> &str {
        &self.address
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }

    pub fn leader_id(&self) -> Option<MemberId> {
        self.raft.metrics().borrow().current_leader
    }

    pub fn leader_address(&self) -> Option<String> {
        let leader = self.leader_id()?;
        if leader == self.node_id {
            return Some(self.address.clone());
        }
        self.network
            .address_of(leader)
            .or_else(|| self.state.snapshot().member_by_id(leader).map(|m| m.address.clone()))
    }

    pub async fn wait_leadership(&self) -> Result<()> {
        self.raft
            .wait(Some(Duration::from_secs(60)))
            .state(ServerState::Leader, "wait for leadership")
            .await
            .context("Timed out waiting to become leader")?;
        Ok(())
    }

    pub fn raft_nodes(&self) -> Vec<RaftNodeInfo> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config;
        let voters: BTreeSet<MemberId> = membership.membership().voter_ids().collect();

        membership
            .membership()
            .nodes()
            .map(|(id, node)| RaftNodeInfo {
                id: *id,
                address: node.address.clone(),
                role: if voters.contains(id) {
                    RaftRole::Voter
                } else {
                    RaftRole::Standby
                },
            })
            .collect()
    }

    pub async fn add_voter(&self, id: MemberId, address: String, name: String) -> Result<()> {
        let node = RaftMember {
            address: address.clone(),
            name,
        };
        self.network.register_node(id, address);

        let in_config = self.raft_nodes().iter().any(|n| n.id == id);
        if !in_config {
            self.raft.add_learner(id, node, true).await?;
        }

        let mut ids = BTreeSet::new();
        ids.insert(id);
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(ids), false)
            .await?;
        Ok(())
    }

    pub async fn add_standby(&self, id: MemberId, address: String, name: String) -> Result<()> {
        let node = RaftMember {
            address: address.clone(),
            name,
        };
        self.network.register_node(id, address);
        self.raft.add_learner(id, node, true).await?;

        let voters: BTreeSet<MemberId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect();
        if voters.contains(&id) {
            let mut ids = BTreeSet::new();
            ids.insert(id);
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(ids), false)
                .await?;
        }
        Ok(())
    }

    pub async fn demote_voter(&self, id: MemberId) -> Result<()> {
        let mut ids = BTreeSet::new();
        ids.insert(id);
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(ids), false)
            .await?;
        Ok(())
    }

    // Removes an unreachable voter from the Raft configuration without
    // contacting it. Only valid once the member has been offline past the
    // cluster's offline threshold.
    pub async fn demote_offline_node(&self, id: MemberId) -> Result<()> {
        warn!("Demoting offline member {} from Raft configuration", id);
        self.demote_voter(id).await
    }

    pub async fn remove_node(&self, id: MemberId) -> Result<()> {
        let voters: BTreeSet<MemberId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect();

        if voters.contains(&id) {
            let mut ids = BTreeSet::new();
            ids.insert(id);
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(ids), false)
                .await?;
        }

        let mut ids = BTreeSet::new();
        ids.insert(id);
        self.raft
            .change_membership(ChangeMembers::RemoveNodes(ids), false)
            .await?;
        self.network.forget_node(id);
        Ok(())
    }

    pub async fn transfer_leadership(&self) -> Result<()> {
        let nodes = self.raft_nodes();
        let mut candidates: Vec<&RaftNodeInfo> = nodes
            .iter()
            .filter(|n| n.role == RaftRole::Voter && n.id != self.node_id)
            .collect();
        candidates.sort_by_key(|n| n.id);

        for candidate in candidates {
            if !self.has_connectivity(&candidate.address).await {
                continue;
            }

            let url = format!("http://{}/raft/elect", candidate.address);
            if let Err(e) = self.client.post(&url).send().await {
                warn!(
                    "Failed to ask {} to campaign for leadership: {}",
                    candidate.address, e
                );
                continue;
            }

            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while tokio::time::Instant::now() < deadline {
                if self.leader_id() != Some(self.node_id) {
                    info!("Leadership transferred to {}", candidate.address);
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }

        bail!("No reachable voter available to take over leadership")
    }

    pub async fn has_connectivity(&self, address: &str) -> bool {
        matches!(
            tokio::time::timeout(
                CONNECTIVITY_TIMEOUT,
                tokio::net::TcpStream::connect(address),
            )
            .await,
            Ok(Ok(_))
        )
    }

    pub async fn kill(&self) -> Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| anyhow!("Failed to stop Raft: {:?}", e))?;
        Ok(())
    }

    // Destructive: tears down the Raft instance and removes the global
    // database so the next daemon start comes up as a fresh stand-alone
    // node. Only called from dissolve.
    pub async fn reset(&self) -> Result<()> {
        warn!("Resetting member {} to stand-alone", self.node_id);
        self.kill().await?;
        std::fs::remove_dir_all(&self.global_db_path)
            .context("Failed to remove global database")?;
        Ok(())
    }

    async fn forward_command(&self, leader_addr: &str, command: &ClusterCommand) -> Result<()> {
        let url = format!("http://{}/internal/cluster/command", leader_addr);
        let response = self
            .client
            .post(&url)
            .json(command)
            .send()
            .await
            .with_context(|| format!("Failed to forward write to leader {}", leader_addr))?;

        if !response.status().is_success() {
            bail!(
                "Leader {} rejected forwarded write: {}",
                leader_addr,
                response.status()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Replicator for Gateway {
    async fn apply(&self, command: ClusterCommand) -> Result<()> {
        match self.raft.client_write(command.clone()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Some(forward) = e.forward_to_leader() {
                    let addr = forward
                        .leader_node
                        .as_ref()
                        .map(|n| n.address.clone())
                        .or_else(|| self.leader_address())
                        .ok_or_else(|| anyhow!("Cluster has no leader"))?;
                    return self.forward_command(&addr, &command).await;
                }
                Err(anyhow!("Raft write failed: {}", e))
            }
        }
    }

    fn snapshot(&self) -> crate::replicator::state_machine::ClusterState {
        self.state.snapshot()
    }

    fn is_leader(&self) -> bool {
        self.leader_id() == Some(self.node_id)
    }

    fn leader_address(&self) -> Option<String> {
        Gateway::leader_address(self)
    }
}
