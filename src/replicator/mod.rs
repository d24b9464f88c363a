mod gateway;
mod network;
mod state_machine;
mod storage;

pub use gateway::*;
pub use network::*;
pub use state_machine::*;
pub use storage::*;

use crate::types::ClusterCommand;
use async_trait::async_trait;

#[async_trait]
pub trait Replicator: Send + Sync {
    async fn apply(&self, command: ClusterCommand) -> anyhow::Result<()>;
    fn snapshot(&self) -> ClusterState;
    fn is_leader(&self) -> bool;
    fn leader_address(&self) -> Option<String>;
}

// Replicator that applies commands straight to a shared state, with no Raft
// underneath. Used by the test harness and by tooling that inspects a state
// snapshot offline.
#[derive(Clone, Default)]
pub struct DirectReplicator {
    state: SharedState,
    local_address: Option<String>,
}

impl DirectReplicator {
    pub fn new() -> Self {
        Self {
            state: SharedState::new(),
            local_address: None,
        }
    }

    pub fn with_address(address: &str) -> Self {
        Self {
            state: SharedState::new(),
            local_address: Some(address.to_string()),
        }
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }
}

#[async_trait]
impl Replicator for DirectReplicator {
    async fn apply(&self, command: ClusterCommand) -> anyhow::Result<()> {
        self.state.apply(&command);
        Ok(())
    }

    fn snapshot(&self) -> ClusterState {
        self.state.snapshot()
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader_address(&self) -> Option<String> {
        self.local_address.clone()
    }
}
