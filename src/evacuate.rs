use crate::error::ApiError;
use crate::instance::{pick_migration_target, InstanceBackend};
use crate::replicator::Replicator;
use crate::types::*;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const EVACUATE_WORKERS: usize = 4;
const START_ATTEMPTS: u32 = 3;
const START_RETRY_GAP: Duration = Duration::from_secs(5);
const START_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvacuationReport {
    pub migrated: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    pub failed: Vec<FailedInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedInstance {
    pub instance: String,
    pub error: String,
}

pub struct Evacuator {
    replicator: Arc<dyn Replicator>,
    backend: Arc<dyn InstanceBackend>,
    // Evacuate and restore are the only transitions into and out of the
    // evacuated state; this keeps them mutually exclusive per member.
    member_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Evacuator {
    pub fn new(replicator: Arc<dyn Replicator>, backend: Arc<dyn InstanceBackend>) -> Self {
        Self {
            replicator,
            backend,
            member_locks: Mutex::new(HashMap::new()),
        }
    }

    fn member_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.member_locks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub async fn evacuate(
        &self,
        name: &str,
        requested_mode: Option<EvacuateMode>,
    ) -> Result<EvacuationReport, ApiError> {
        let lock = self.member_lock(name);
        let _guard = lock.try_lock().map_err(|_| {
            ApiError::conflict(format!("Member {} is already being evacuated", name))
        })?;

        let state = self.replicator.snapshot();
        let member = state
            .member_by_name(name)
            .ok_or_else(|| ApiError::not_found(format!("Member {} not found", name)))?;

        match member.state {
            MemberState::Created => {}
            MemberState::Evacuated => {
                return Err(ApiError::conflict(format!(
                    "Member {} is already evacuated",
                    name
                )));
            }
            MemberState::Pending => {
                return Err(ApiError::conflict(format!(
                    "Member {} has not finished joining",
                    name
                )));
            }
        }

        // Flip the member state first: placement must stop considering this
        // member before the first instance moves.
        self.replicator
            .apply(ClusterCommand::SetMemberState {
                name: name.to_string(),
                state: MemberState::Evacuated,
            })
            .await?;

        info!("Evacuating member {}", name);

        let default_mode = state.config.evacuate_mode();
        let instances: Vec<InstanceRecord> = state
            .instances_on(name)
            .into_iter()
            .cloned()
            .collect();

        let report = Arc::new(Mutex::new(EvacuationReport::default()));
        let semaphore = Arc::new(Semaphore::new(EVACUATE_WORKERS));
        let mut handles = Vec::new();

        for instance in instances {
            let mode = resolve_mode(&instance, requested_mode, default_mode);
            let replicator = self.replicator.clone();
            let backend = self.backend.clone();
            let semaphore = semaphore.clone();
            let report = report.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let name = instance.name.clone();
                match evacuate_instance(replicator, backend, instance, mode).await {
                    Ok(outcome) => {
                        let mut report = report.lock().unwrap();
                        match outcome {
                            InstanceOutcome::Migrated => report.migrated.push(name),
                            InstanceOutcome::Stopped => report.stopped.push(name),
                        }
                    }
                    Err(e) => {
                        warn!("Failed to evacuate instance {}: {:#}", name, e);
                        report.lock().unwrap().failed.push(FailedInstance {
                            instance: name,
                            error: format!("{:#}", e),
                        });
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let report = Arc::try_unwrap(report)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();
        info!(
            "Evacuated member {}: {} migrated, {} stopped, {} failed",
            name,
            report.migrated.len(),
            report.stopped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    pub async fn restore(&self, name: &str) -> Result<EvacuationReport, ApiError> {
        let lock = self.member_lock(name);
        let _guard = lock.try_lock().map_err(|_| {
            ApiError::conflict(format!("Member {} is already being restored", name))
        })?;

        let state = self.replicator.snapshot();
        let member = state
            .member_by_name(name)
            .ok_or_else(|| ApiError::not_found(format!("Member {} not found", name)))?;

        if member.state != MemberState::Evacuated {
            return Err(ApiError::conflict(format!(
                "Member {} is not evacuated",
                name
            )));
        }

        self.replicator
            .apply(ClusterCommand::SetMemberState {
                name: name.to_string(),
                state: MemberState::Created,
            })
            .await?;

        info!("Restoring member {}", name);

        let mut report = EvacuationReport::default();
        for instance in state.instances_on(name) {
            if !instance.was_running() || instance.running {
                continue;
            }

            match start_with_retry(self.backend.as_ref(), &instance.name).await {
                Ok(()) => {
                    self.replicator
                        .apply(ClusterCommand::SetInstancePower {
                            name: instance.name.clone(),
                            running: true,
                        })
                        .await?;
                    report.restarted.push(instance.name.clone());
                }
                Err(e) => {
                    warn!("Failed to restart instance {}: {:#}", instance.name, e);
                    report.failed.push(FailedInstance {
                        instance: instance.name.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        Ok(report)
    }
}

fn resolve_mode(
    instance: &InstanceRecord,
    requested: Option<EvacuateMode>,
    cluster_default: EvacuateMode,
) -> EvacuateMode {
    if let Some(mode) = requested {
        return mode;
    }
    instance
        .config
        .get("cluster.evacuate")
        .and_then(|v| v.parse().ok())
        .unwrap_or(cluster_default)
}

enum InstanceOutcome {
    Migrated,
    Stopped,
}

// The mode picks the stop mechanism; every mode still moves the instance
// off the evacuated member.
async fn stop_for_mode(
    backend: &dyn InstanceBackend,
    name: &str,
    mode: EvacuateMode,
) -> Result<()> {
    match mode {
        EvacuateMode::ForceStop => backend.stop(name, true).await,
        EvacuateMode::StatefulStop => backend.stateful_stop(name).await,
        _ => backend.shutdown(name).await,
    }
}

async fn evacuate_instance(
    replicator: Arc<dyn Replicator>,
    backend: Arc<dyn InstanceBackend>,
    instance: InstanceRecord,
    mode: EvacuateMode,
) -> Result<InstanceOutcome> {
    let was_running = backend.is_running(&instance.name);

    // Record the pre-evacuation power state so restore knows what to bring
    // back up.
    replicator
        .apply(ClusterCommand::SetLastPowerState {
            name: instance.name.clone(),
            power: if was_running { "running" } else { "stopped" }.to_string(),
        })
        .await?;

    let state = replicator.snapshot();
    let target = pick_migration_target(&state, &instance, Utc::now());

    let Some(target) = target else {
        // Only the strict migrate modes fail without a target; the rest
        // leave the instance stopped in place.
        if matches!(mode, EvacuateMode::Migrate | EvacuateMode::LiveMigrate) {
            anyhow::bail!("No suitable member to migrate {} to", instance.name);
        }
        if was_running {
            stop_for_mode(backend.as_ref(), &instance.name, mode).await?;
            mark_stopped(&replicator, &instance.name).await?;
        }
        return Ok(InstanceOutcome::Stopped);
    };
    let target_name = target.name.clone();

    let try_live = was_running
        && match mode {
            EvacuateMode::LiveMigrate => true,
            EvacuateMode::Auto => instance.kind.supports_live_migration(),
            _ => false,
        };

    if try_live {
        match backend.migrate(&instance.name, &target_name, true).await {
            Ok(()) => {
                replicator
                    .apply(ClusterCommand::SetInstanceLocation {
                        name: instance.name.clone(),
                        member: target_name,
                    })
                    .await?;
                return Ok(InstanceOutcome::Migrated);
            }
            Err(e) if mode == EvacuateMode::LiveMigrate => return Err(e),
            Err(e) => {
                warn!(
                    "Live migration of {} failed, falling back to cold: {:#}",
                    instance.name, e
                );
            }
        }
    }

    if was_running {
        stop_for_mode(backend.as_ref(), &instance.name, mode)
            .await
            .context("Failed to stop instance before migration")?;
        replicator
            .apply(ClusterCommand::SetInstancePower {
                name: instance.name.clone(),
                running: false,
            })
            .await?;
    }

    backend
        .migrate(&instance.name, &target_name, false)
        .await
        .context("Failed to migrate instance")?;
    replicator
        .apply(ClusterCommand::SetInstanceLocation {
            name: instance.name.clone(),
            member: target_name,
        })
        .await?;

    // A stateful stop carries its saved state to the target and stays down
    // until restore; everything else comes back up over there.
    if was_running && mode != EvacuateMode::StatefulStop {
        start_with_retry(backend.as_ref(), &instance.name)
            .await
            .context("Failed to start instance on the target member")?;
        replicator
            .apply(ClusterCommand::SetInstancePower {
                name: instance.name.clone(),
                running: true,
            })
            .await?;
        replicator
            .apply(ClusterCommand::SetLastPowerState {
                name: instance.name.clone(),
                power: "running".to_string(),
            })
            .await?;
    }

    Ok(InstanceOutcome::Migrated)
}

async fn mark_stopped(replicator: &Arc<dyn Replicator>, name: &str) -> Result<()> {
    replicator
        .apply(ClusterCommand::SetInstancePower {
            name: name.to_string(),
            running: false,
        })
        .await
}

// Instance starts get three attempts with a fixed gap; Unavailable errors
// (the target can answer but cannot serve yet) do not count against the
// attempt budget, only against the overall deadline.
pub async fn start_with_retry(backend: &dyn InstanceBackend, name: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + START_DEADLINE;
    let mut attempts = 0;

    loop {
        match backend.start(name).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let unavailable = matches!(
                    e.downcast_ref::<ApiError>(),
                    Some(ApiError::Unavailable(_))
                );
                if !unavailable {
                    attempts += 1;
                }
                if attempts >= START_ATTEMPTS || tokio::time::Instant::now() >= deadline {
                    return Err(e);
                }
                tokio::time::sleep(START_RETRY_GAP).await;
            }
        }
    }
}
