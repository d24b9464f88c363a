use crate::local_store::LocalStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Task,
    Token,
    Websocket,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub class: OperationClass,
    pub description: String,
    pub state: OperationState,
    pub metadata: HashMap<String, serde_json::Value>,
    pub err: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Clone)]
pub struct OperationRegistry {
    ops: Arc<RwLock<HashMap<String, Operation>>>,
    store: Arc<LocalStore>,
}

impl OperationRegistry {
    pub fn new(store: Arc<LocalStore>) -> Result<Self> {
        let mut ops = HashMap::new();

        // Operations that were in flight when the daemon last stopped are
        // surfaced as failed rather than silently dropped.
        for raw in store.operations()? {
            match serde_json::from_slice::<Operation>(&raw) {
                Ok(mut op) => {
                    if !op.state.is_final() {
                        op.state = OperationState::Failed;
                        op.err = Some("Daemon stopped while the operation was running".to_string());
                        op.updated_at = Utc::now();
                    }
                    ops.insert(op.id.clone(), op);
                }
                Err(e) => warn!("Discarding unreadable operation record: {}", e),
            }
        }

        Ok(Self {
            ops: Arc::new(RwLock::new(ops)),
            store,
        })
    }

    pub fn create(
        &self,
        class: OperationClass,
        description: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Operation {
        let now = Utc::now();
        let op = Operation {
            id: uuid::Uuid::new_v4().to_string(),
            class,
            description: description.to_string(),
            state: OperationState::Running,
            metadata,
            err: None,
            created_at: now,
            updated_at: now,
        };

        self.ops.write().unwrap().insert(op.id.clone(), op.clone());
        self.persist(&op);
        op
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.ops.read().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self.ops.read().unwrap().values().cloned().collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        ops
    }

    pub fn running_by_class(&self, class: OperationClass) -> Vec<Operation> {
        self.list()
            .into_iter()
            .filter(|op| op.class == class && op.state == OperationState::Running)
            .collect()
    }

    pub fn update_metadata(&self, id: &str, metadata: HashMap<String, serde_json::Value>) {
        let mut ops = self.ops.write().unwrap();
        if let Some(op) = ops.get_mut(id) {
            op.metadata.extend(metadata);
            op.updated_at = Utc::now();
            let op = op.clone();
            drop(ops);
            self.persist(&op);
        }
    }

    pub fn succeed(&self, id: &str) {
        self.finish(id, OperationState::Succeeded, None);
    }

    pub fn fail(&self, id: &str, err: &str) {
        self.finish(id, OperationState::Failed, Some(err.to_string()));
    }

    pub fn cancel(&self, id: &str) {
        self.finish(id, OperationState::Cancelled, None);
    }

    pub fn remove(&self, id: &str) {
        self.ops.write().unwrap().remove(id);
        if let Err(e) = self.store.remove_operation(id) {
            warn!("Failed to delete operation record {}: {}", id, e);
        }
    }

    fn finish(&self, id: &str, state: OperationState, err: Option<String>) {
        let mut ops = self.ops.write().unwrap();
        if let Some(op) = ops.get_mut(id) {
            if op.state.is_final() {
                return;
            }
            op.state = state;
            op.err = err;
            op.updated_at = Utc::now();
            let op = op.clone();
            drop(ops);
            self.persist(&op);
        }
    }

    fn persist(&self, op: &Operation) {
        match serde_json::to_vec(op) {
            Ok(raw) => {
                if let Err(e) = self.store.put_operation(&op.id, &raw) {
                    warn!("Failed to persist operation {}: {}", op.id, e);
                }
            }
            Err(e) => warn!("Failed to encode operation {}: {}", op.id, e),
        }
    }
}
