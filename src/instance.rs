use crate::replicator::ClusterState;
use crate::types::*;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// The core treats workloads as opaque handles behind this capability set;
// container and VM drivers differ only in what InstanceKind reports for
// live migration.
#[async_trait]
pub trait InstanceBackend: Send + Sync {
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str, force: bool) -> Result<()>;
    async fn shutdown(&self, name: &str) -> Result<()>;
    async fn stateful_stop(&self, name: &str) -> Result<()>;
    async fn migrate(&self, name: &str, target_member: &str, live: bool) -> Result<()>;
    fn is_running(&self, name: &str) -> bool;
    fn expanded_config(&self, name: &str) -> HashMap<String, String>;
}

#[derive(Debug, Clone, Default)]
pub struct BackendInstance {
    pub running: bool,
    pub member: String,
    pub kind: Option<InstanceKind>,
    pub config: HashMap<String, String>,
    pub stateful: bool,
}

// In-memory backend standing in for the real container/VM drivers, which
// live outside the cluster core. Also what the test suite drives.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    instances: Arc<RwLock<HashMap<String, BackendInstance>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, instance: BackendInstance) {
        self.instances
            .write()
            .unwrap()
            .insert(name.to_string(), instance);
    }

    pub fn get(&self, name: &str) -> Option<BackendInstance> {
        self.instances.read().unwrap().get(name).cloned()
    }

    fn with_instance<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut BackendInstance) -> T,
    ) -> Result<T> {
        let mut instances = self.instances.write().unwrap();
        match instances.get_mut(name) {
            Some(instance) => Ok(f(instance)),
            None => bail!("Instance {} not found", name),
        }
    }
}

#[async_trait]
impl InstanceBackend for MemoryBackend {
    async fn start(&self, name: &str) -> Result<()> {
        self.with_instance(name, |i| {
            i.running = true;
            i.stateful = false;
        })
    }

    async fn stop(&self, name: &str, _force: bool) -> Result<()> {
        self.with_instance(name, |i| i.running = false)
    }

    async fn shutdown(&self, name: &str) -> Result<()> {
        self.with_instance(name, |i| i.running = false)
    }

    async fn stateful_stop(&self, name: &str) -> Result<()> {
        self.with_instance(name, |i| {
            i.running = false;
            i.stateful = true;
        })
    }

    async fn migrate(&self, name: &str, target_member: &str, live: bool) -> Result<()> {
        let target = target_member.to_string();
        self.with_instance(name, |i| {
            if live && i.kind.map(|k| !k.supports_live_migration()).unwrap_or(true) {
                bail!("Instance {} does not support live migration", name);
            }
            i.member = target;
            Ok(())
        })?
    }

    fn is_running(&self, name: &str) -> bool {
        self.instances
            .read()
            .unwrap()
            .get(name)
            .map(|i| i.running)
            .unwrap_or(false)
    }

    fn expanded_config(&self, name: &str) -> HashMap<String, String> {
        self.instances
            .read()
            .unwrap()
            .get(name)
            .map(|i| i.config.clone())
            .unwrap_or_default()
    }
}

// Placement rule used by evacuation: a reachable, non-evacuated member of
// the same architecture whose scheduler policy allows automatic placement.
// Ties break towards the member with the fewest instances, then by name.
pub fn pick_migration_target<'a>(
    state: &'a ClusterState,
    instance: &InstanceRecord,
    now: DateTime<Utc>,
) -> Option<&'a Member> {
    let threshold = state.config.offline_threshold();
    let source = state.member_by_name(&instance.member);

    let mut candidates: Vec<&Member> = state
        .members_sorted()
        .into_iter()
        .filter(|m| {
            m.state == MemberState::Created
                && m.name != instance.member
                && !m.is_offline(threshold, now)
                && m.architecture == instance.architecture
        })
        .filter(|m| match m.scheduler_policy() {
            "manual" => false,
            "group" => source
                .map(|s| m.groups.iter().any(|g| s.groups.contains(g)))
                .unwrap_or(false),
            _ => true,
        })
        .collect();

    candidates.sort_by(|a, b| {
        let load_a = state.instances_on(&a.name).len();
        let load_b = state.instances_on(&b.name).len();
        load_a.cmp(&load_b).then_with(|| a.name.cmp(&b.name))
    });

    candidates.first().copied()
}
