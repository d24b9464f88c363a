use crate::config::NodeConfig;
use crate::error::ApiError;
use crate::evacuate::Evacuator;
use crate::heartbeat::{heartbeat_round, HeartbeatView};
use crate::instance::MemoryBackend;
use crate::local_store::LocalStore;
use crate::membership::{self, AcceptRequest, AcceptResponse};
use crate::operations::{Operation, OperationClass, OperationRegistry};
use crate::rebalance;
use crate::replicator::{Gateway, Replicator};
use crate::router::Router;
use crate::trust::{
    fingerprint_pem, ClusterCertificate, ServerCertificate, TokenManager,
};
use crate::types::*;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const REBALANCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRequest {
    pub name: String,
    pub secret: String,
    pub certificate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustResponse {
    pub cluster_certificate: String,
}

pub struct Daemon {
    config: NodeConfig,
    server_name: RwLock<String>,
    data_dir: PathBuf,
    local_store: Arc<LocalStore>,
    gateway: RwLock<Arc<Gateway>>,
    backend: Arc<MemoryBackend>,
    evacuator: RwLock<Arc<Evacuator>>,
    registry: OperationRegistry,
    tokens: TokenManager,
    router: Router,
    heartbeats: HeartbeatView,
    server_cert: ServerCertificate,
    // Leader-only critical section serializing accept, assign, handover and
    // rebalance. Never held across an RPC to a non-leader member.
    pub membership_mu: tokio::sync::Mutex<()>,
    // Guards the gateway swap and the local config snapshot; write-locked
    // for the whole of bootstrap, join and dissolve so concurrent cluster
    // PUTs cannot interleave.
    config_mu: tokio::sync::Mutex<()>,
    rebalance_notify: Arc<Notify>,
    heartbeat_notify: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    exit_code: AtomicI32,
}

impl Daemon {
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let data_dir = config.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        let local_store = Arc::new(
            LocalStore::open(data_dir.join("database").join("local"))
                .context("Fatal: cannot open local database")?,
        );

        let server_name = local_store
            .server_name()?
            .unwrap_or_else(|| config.effective_server_name());

        let server_cert = ServerCertificate::load_or_generate(
            &data_dir,
            &server_name,
            vec![config.listen_addr()],
        )
        .context("Fatal: cannot load server certificate")?;

        let member_id = local_store.member_id()?.unwrap_or(1);
        let address = local_store
            .cluster_address()?
            .unwrap_or_else(|| config.listen_addr());

        let gateway = Arc::new(Gateway::new(member_id, address, &data_dir).await?);

        // A restarting cluster member already knows its peers; re-register
        // them so Raft can reconnect without waiting for a heartbeat.
        let cached_nodes = local_store.raft_nodes()?;
        if !cached_nodes.is_empty() {
            gateway.register_peers(&cached_nodes);
        }

        let registry = OperationRegistry::new(local_store.clone())?;
        let tokens = TokenManager::new(registry.clone());
        let backend = Arc::new(MemoryBackend::new());
        let evacuator = Arc::new(Evacuator::new(gateway.clone(), backend.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            "Initialized daemon {} (member id {}) with data in {:?}",
            server_name, member_id, data_dir
        );

        Ok(Self {
            config,
            server_name: RwLock::new(server_name),
            data_dir,
            local_store,
            gateway: RwLock::new(gateway),
            backend,
            evacuator: RwLock::new(evacuator),
            registry,
            tokens,
            router: Router::new(),
            heartbeats: HeartbeatView::new(),
            server_cert,
            membership_mu: tokio::sync::Mutex::new(()),
            config_mu: tokio::sync::Mutex::new(()),
            rebalance_notify: Arc::new(Notify::new()),
            heartbeat_notify: Arc::new(Notify::new()),
            shutdown_tx,
            shutdown_rx,
            exit_code: AtomicI32::new(-1),
        })
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.read().unwrap().clone()
    }

    fn swap_gateway(&self, gateway: Arc<Gateway>) {
        let evacuator = Arc::new(Evacuator::new(gateway.clone(), self.backend.clone()));
        *self.evacuator.write().unwrap() = evacuator;
        *self.gateway.write().unwrap() = gateway;
    }

    pub fn evacuator(&self) -> Arc<Evacuator> {
        self.evacuator.read().unwrap().clone()
    }

    pub fn server_name(&self) -> String {
        self.server_name.read().unwrap().clone()
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn heartbeats(&self) -> &HeartbeatView {
        &self.heartbeats
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    pub fn server_certificate(&self) -> &ServerCertificate {
        &self.server_cert
    }

    pub fn listen_addr(&self) -> String {
        self.config.listen_addr()
    }

    pub fn is_clustered(&self) -> bool {
        !self.gateway().snapshot().members.is_empty()
    }

    pub fn exit_code(&self) -> Option<i32> {
        let code = self.exit_code.load(Ordering::SeqCst);
        (code >= 0).then_some(code)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn trigger_rebalance(&self) {
        self.rebalance_notify.notify_one();
    }

    // Role changes that must propagate immediately force an out-of-cycle
    // heartbeat round instead of waiting for the tick.
    pub fn notify_heartbeat(&self) {
        self.heartbeat_notify.notify_one();
    }

    pub async fn bootstrap(&self, name: &str, address: &str) -> Result<(), ApiError> {
        let _guard = self.config_mu.lock().await;

        let cluster_cert = ClusterCertificate::generate(name)
            .context("Failed to generate cluster certificate")?;
        cluster_cert
            .save(&self.data_dir)
            .context("Failed to store cluster certificate")?;

        let gateway = self.gateway();
        membership::bootstrap(
            &gateway,
            &self.local_store,
            name,
            address,
            &self.config.effective_architecture(),
        )
        .await?;

        self.local_store
            .set_member_id(gateway.node_id())
            .context("Failed to store member id")?;
        *self.server_name.write().unwrap() = name.to_string();

        Ok(())
    }

    pub fn issue_token(&self, server_name: &str) -> Result<(JoinToken, Operation), ApiError> {
        let state = self.gateway().snapshot();

        if state.member_by_name(server_name).is_some() {
            return Err(ApiError::conflict(format!(
                "The cluster already has a member with name {}",
                server_name
            )));
        }

        let now = Utc::now();
        let addresses: Vec<String> = state
            .online_members(now)
            .into_iter()
            .filter(|m| m.state != MemberState::Evacuated)
            .map(|m| m.address.clone())
            .collect();

        let cluster_cert =
            ClusterCertificate::load(&self.data_dir).context("Failed to load cluster certificate")?;
        let fingerprint = cluster_cert.fingerprint().context("Failed to fingerprint")?;

        self.tokens.issue(
            server_name,
            &fingerprint,
            addresses,
            state.config.join_token_expiry(),
        )
    }

    // Leader-side trust setup: a joiner presenting a valid token secret gets
    // its server certificate added to the replicated trust store.
    pub async fn setup_trust(&self, req: &TrustRequest) -> Result<TrustResponse, ApiError> {
        self.tokens.validate(&req.name, &req.secret)?;

        let fingerprint =
            fingerprint_pem(&req.certificate).context("Failed to parse joiner certificate")?;

        self.gateway()
            .apply(ClusterCommand::AddTrustedCert {
                name: req.name.clone(),
                fingerprint,
                cert_pem: req.certificate.clone(),
            })
            .await?;

        let cluster_cert =
            ClusterCertificate::load(&self.data_dir).context("Failed to load cluster certificate")?;

        Ok(TrustResponse {
            cluster_certificate: cluster_cert.cert_pem,
        })
    }

    pub async fn accept(&self, req: &AcceptRequest) -> Result<AcceptResponse, ApiError> {
        let _guard = self.membership_mu.lock().await;

        // The secret authorizes the accept; it is consumed afterwards no
        // matter how the rest of the join goes.
        let token_op = self.tokens.validate(&req.name, &req.secret)?;

        let gateway = self.gateway();
        let mut response = membership::accept(&gateway, req).await?;

        self.tokens.consume(&token_op.id);

        let cluster_cert =
            ClusterCertificate::load(&self.data_dir).context("Failed to load cluster certificate")?;
        response.cluster_certificate = cluster_cert.cert_pem.clone();
        response.cluster_key = cluster_cert.key_pem();

        self.trigger_rebalance();
        self.notify_heartbeat();

        Ok(response)
    }

    // Joiner-side join workflow, driven by PUT /1.0/cluster with a token.
    pub async fn join(&self, req: &ClusterPut) -> Result<(), ApiError> {
        let _guard = self.config_mu.lock().await;

        let token = JoinToken::decode(&req.cluster_token)
            .map_err(|_| ApiError::unauthorized("Malformed join token"))?;

        if token.is_expired(Utc::now()) {
            return Err(ApiError::unauthorized("Join token has expired"));
        }

        let name = if req.server_name.is_empty() {
            token.server_name.clone()
        } else {
            req.server_name.clone()
        };
        let address = if req.server_address.is_empty() {
            self.config.listen_addr()
        } else {
            req.server_address.clone()
        };

        let accept = self
            .join_remote(&token, &name, &address)
            .await
            .map_err(|e| match e.downcast::<ApiError>() {
                Ok(api) => api,
                Err(e) => ApiError::Internal(e),
            })?;

        let cluster_cert = ClusterCertificate::from_pem(
            &accept.cluster_certificate,
            &accept.cluster_key,
        )
        .context("Failed to parse cluster certificate from accept response")?;
        cluster_cert
            .save(&self.data_dir)
            .context("Failed to store cluster certificate")?;

        // Start over with a clean global database: the log now comes from
        // the leader, under the member id it assigned.
        let old_gateway = self.gateway();
        old_gateway.reset().await.context("Failed to reset Raft")?;

        let gateway = Arc::new(
            Gateway::new(accept.member_id, address.clone(), &self.data_dir)
                .await
                .context("Failed to start clustered Raft")?,
        );

        membership::join(&gateway, &self.local_store, &name, &address, &accept.raft_nodes)
            .await?;

        self.local_store
            .set_member_id(accept.member_id)
            .context("Failed to store member id")?;
        *self.server_name.write().unwrap() = name.clone();
        self.swap_gateway(gateway);

        info!("Member {} joined the cluster at {}", name, address);
        Ok(())
    }

    async fn join_remote(
        &self,
        token: &JoinToken,
        name: &str,
        address: &str,
    ) -> Result<AcceptResponse> {
        let client = self.router.client();

        let mut last_err = anyhow!("The join token contains no usable addresses");
        for target in &token.addresses {
            match self
                .join_remote_one(client, token, name, address, target)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("Join attempt via {} failed: {:#}", target, e);
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    async fn join_remote_one(
        &self,
        client: &reqwest::Client,
        token: &JoinToken,
        name: &str,
        address: &str,
        target: &str,
    ) -> Result<AcceptResponse> {
        let trust_req = TrustRequest {
            name: name.to_string(),
            secret: token.secret.clone(),
            certificate: self.server_cert.cert_pem.clone(),
        };

        let url = format!("http://{}/internal/cluster/trust", target);
        let response = client.post(&url).json(&trust_req).send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            bail!(ApiError::unauthorized("Cluster rejected the join token"));
        }
        if !response.status().is_success() {
            bail!("Trust setup failed with {}", response.status());
        }
        let trust: TrustResponse = response.json().await?;

        // The certificate presented by the cluster must match the
        // fingerprint the token was bound to.
        let fingerprint = fingerprint_pem(&trust.cluster_certificate)?;
        if fingerprint != token.fingerprint {
            bail!(ApiError::unauthorized(
                "Cluster certificate fingerprint mismatch",
            ));
        }

        let accept_req = AcceptRequest {
            name: name.to_string(),
            address: address.to_string(),
            schema_version: crate::SCHEMA_VERSION,
            api_extensions: crate::API_EXTENSIONS,
            architecture: self.config.effective_architecture(),
            secret: token.secret.clone(),
            storage_pools: self
                .gateway()
                .snapshot()
                .storage_pools
                .values()
                .cloned()
                .collect(),
            networks: self.gateway().snapshot().networks.values().cloned().collect(),
        };

        let url = format!("http://{}/internal/cluster/accept", target);
        let response = client.post(&url).json(&accept_req).send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            bail!(ApiError::unauthorized("Cluster rejected the join secret"));
        }
        if !response.status().is_success() {
            bail!("Accept failed with {}", response.status());
        }

        Ok(response.json().await?)
    }

    // Dissolves cluster participation on this node: Raft is stopped and
    // wiped, the cluster certificate removed, and the process exits 0 so a
    // socket-activated restart brings it back stand-alone.
    pub async fn dissolve(&self) -> Result<(), ApiError> {
        let _guard = self.config_mu.lock().await;

        info!("Disabling clustering on this member");

        let gateway = self.gateway();
        gateway.reset().await.context("Failed to reset Raft")?;

        ClusterCertificate::remove(&self.data_dir)
            .context("Failed to remove cluster certificate")?;
        self.local_store
            .set_cluster_address("")
            .context("Failed to clear cluster address")?;
        self.local_store
            .wipe_cluster_state()
            .context("Failed to clear raft cache")?;

        self.exit_code.store(0, Ordering::SeqCst);
        self.shutdown();
        Ok(())
    }

    pub fn cluster_info(&self) -> ClusterInfo {
        ClusterInfo {
            server_name: self.server_name(),
            enabled: self.is_clustered(),
            member_config: vec![MemberConfigKey {
                entity: "storage-pool".to_string(),
                name: "default".to_string(),
                key: "source".to_string(),
                description: "Path to the block device or directory".to_string(),
            }],
        }
    }

    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!("Starting daemon {}", self.server_name());

        // A fresh node gets a single-node Raft so the global store can
        // serve reads and writes before any clustering is configured.
        let gateway = self.gateway();
        if gateway.raft_nodes().is_empty() && self.local_store.raft_nodes()?.is_empty() {
            debug!("Initializing single-node Raft for stand-alone operation");
            gateway.initialize_single(&self.server_name()).await?;
        }

        let heartbeat_handle = self.spawn_heartbeat_loop();
        let rebalance_handle = self.spawn_rebalance_loop();
        let sweep_handle = self.spawn_token_sweep_loop();

        info!("Daemon running on {}", self.config.listen_addr());

        tokio::select! {
            _ = heartbeat_handle => {
                error!("Heartbeat loop exited unexpectedly");
            }
            _ = rebalance_handle => {
                error!("Rebalance loop exited unexpectedly");
            }
            _ = sweep_handle => {
                error!("Token sweep loop exited unexpectedly");
            }
            _ = self.wait_for_shutdown() => {
                info!("Shutdown signal received");
            }
        }

        // A voter leaving gracefully hands its seat over before the Raft
        // instance goes away; a dissolve already gave the seat up.
        if self.exit_code().is_none() {
            self.handover_voter_seat().await;
        }

        let gateway = self.gateway();
        if let Err(e) = gateway.kill().await {
            debug!("Raft shutdown: {}", e);
        }

        Ok(())
    }

    async fn handover_voter_seat(&self) {
        let gateway = self.gateway();
        let state = gateway.snapshot();
        let name = self.server_name();

        let is_voter = state
            .member_by_name(&name)
            .map(|m| m.raft_role == RaftRole::Voter)
            .unwrap_or(false);
        if !is_voter || state.members.len() < 2 {
            return;
        }

        let Some(leader) = gateway.leader_address() else {
            return;
        };

        let req = crate::rebalance::HandoverRequest {
            name,
            address: gateway.local_address().to_string(),
        };
        let url = format!("http://{}/internal/cluster/handover", leader);
        match self.router.client().post(&url).json(&req).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Handed over voter seat before shutdown");
            }
            Ok(response) => {
                warn!("Voter handover refused: {}", response.status());
            }
            Err(e) => {
                warn!("Voter handover failed: {}", e);
            }
        }
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let daemon = self.clone();
        let interval = self.config.heartbeat_interval_secs;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = daemon.heartbeat_notify.notified() => {
                        debug!("Out-of-cycle heartbeat round");
                    }
                    _ = shutdown_rx.changed() => break,
                }

                if !daemon.is_clustered() {
                    continue;
                }

                let gateway = daemon.gateway();
                let name = daemon.server_name();
                let address = gateway.local_address().to_string();
                let outcome =
                    heartbeat_round(&gateway, daemon.router.client(), &name, &address).await;

                if gateway.is_leader() && outcome.lost_database_member(&gateway.snapshot()) {
                    daemon.trigger_rebalance();
                }
            }
        })
    }

    fn spawn_rebalance_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let daemon = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REBALANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = daemon.rebalance_notify.notified() => {}
                    _ = shutdown_rx.changed() => break,
                }

                let gateway = daemon.gateway();
                if !daemon.is_clustered() || !gateway.is_leader() {
                    continue;
                }

                let _guard = daemon.membership_mu.lock().await;
                match rebalance::rebalance(&gateway, daemon.router.client()).await {
                    Ok(true) => daemon.notify_heartbeat(),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to rebalance member roles: {}", e),
                }
            }
        })
    }

    fn spawn_token_sweep_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let daemon = self.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TOKEN_SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        daemon.tokens.sweep_expired();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            let _ = rx.changed().await;
        }
    }

    // Leader-side: state snapshot enriched with the derived offline view,
    // for the members listing.
    pub fn member_status(&self, member: &Member) -> &'static str {
        let state = self.gateway().snapshot();
        let threshold = state.config.offline_threshold();
        match member.state {
            MemberState::Pending => "pending",
            MemberState::Evacuated => "evacuated",
            MemberState::Created => {
                if member.is_offline(threshold, Utc::now()) {
                    "offline"
                } else {
                    "online"
                }
            }
        }
    }

}
