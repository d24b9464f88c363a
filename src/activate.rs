use crate::local_store::LocalStore;
use crate::replicator::GlobalStorage;
use anyhow::Result;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationDecision {
    StayDown,
    Activate { reason: String },
}

// Short-running probe that decides whether the daemon needs to start,
// without starting it. It reads the local database and the global store
// directly; opening the global store here is the one sanctioned path that
// bypasses the Gateway, and it must never write.
pub fn check_activation<P: AsRef<Path>>(data_dir: P) -> Result<ActivationDecision> {
    let data_dir = data_dir.as_ref();

    let local_path = data_dir.join("database").join("local");
    if !local_path.exists() {
        debug!("No local database, so no need to start the daemon now");
        return Ok(ActivationDecision::StayDown);
    }

    let local = LocalStore::open(&local_path)?;

    if local.cluster_address()?.is_some() {
        return Ok(ActivationDecision::Activate {
            reason: "network address configured".to_string(),
        });
    }

    let global_path = data_dir.join("database").join("global");
    if !global_path.exists() {
        debug!("No global database, so no need to start the daemon now");
        return Ok(ActivationDecision::StayDown);
    }

    let state = GlobalStorage::read_state_direct(&global_path)?;
    let server_name = local.server_name()?;

    let local_instances: Vec<_> = match &server_name {
        Some(name) => state.instances_on(name),
        None => state.instances.values().collect(),
    };

    for instance in local_instances {
        if instance.autostart() {
            return Ok(ActivationDecision::Activate {
                reason: format!("instance {} has boot.autostart", instance.name),
            });
        }

        if instance.was_running() {
            return Ok(ActivationDecision::Activate {
                reason: format!("instance {} was running at last shutdown", instance.name),
            });
        }

        if instance.snapshot_schedule().is_some() {
            return Ok(ActivationDecision::Activate {
                reason: format!("instance {} has scheduled snapshots", instance.name),
            });
        }
    }

    for volume in state.volumes.values() {
        if volume.snapshot_schedule().is_some() {
            return Ok(ActivationDecision::Activate {
                reason: format!("volume {} has scheduled snapshots", volume.name),
            });
        }
    }

    debug!("No need to start the daemon now");
    Ok(ActivationDecision::StayDown)
}
