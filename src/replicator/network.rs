use crate::replicator::storage::{RaftMember, TypeConfig};
use crate::types::MemberId;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Clone)]
pub struct ClusterNetworkFactory {
    addresses: Arc<RwLock<HashMap<MemberId, String>>>,
}

impl ClusterNetworkFactory {
    pub fn new() -> Self {
        Self {
            addresses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register_node(&self, member_id: MemberId, address: String) {
        self.addresses.write().unwrap().insert(member_id, address);
    }

    pub fn forget_node(&self, member_id: MemberId) {
        self.addresses.write().unwrap().remove(&member_id);
    }

    pub fn address_of(&self, member_id: MemberId) -> Option<String> {
        self.addresses.read().unwrap().get(&member_id).cloned()
    }
}

impl Default for ClusterNetworkFactory {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ClusterNetwork {
    target_addr: String,
    client: reqwest::Client,
}

impl ClusterNetwork {
    pub fn new(target_addr: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            target_addr,
            client,
        }
    }

    async fn send_rpc<Req, Resp, E>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Resp, RPCError<MemberId, RaftMember, RaftError<MemberId, E>>>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
        E: std::error::Error,
    {
        let url = format!("http://{}/raft/{}", self.target_addr, path);

        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        if !response.status().is_success() {
            return Err(RPCError::Network(NetworkError::new(&std::io::Error::other(
                format!("HTTP error: {}", response.status()),
            ))));
        }

        response
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))
    }
}

impl RaftNetworkFactory<TypeConfig> for ClusterNetworkFactory {
    type Network = ClusterNetwork;

    async fn new_client(&mut self, target: MemberId, node: &RaftMember) -> Self::Network {
        self.register_node(target, node.address.clone());
        ClusterNetwork::new(node.address.clone())
    }
}

impl RaftNetwork<TypeConfig> for ClusterNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<MemberId>, RPCError<MemberId, RaftMember, RaftError<MemberId>>>
    {
        self.send_rpc("append_entries", &req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<MemberId>,
        RPCError<MemberId, RaftMember, RaftError<MemberId, InstallSnapshotError>>,
    > {
        self.send_rpc("install_snapshot", &req).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<MemberId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<MemberId>, RPCError<MemberId, RaftMember, RaftError<MemberId>>> {
        self.send_rpc("vote", &req).await
    }
}
