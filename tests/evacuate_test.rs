use chrono::Utc;
use paddock::evacuate::Evacuator;
use paddock::instance::{pick_migration_target, BackendInstance, InstanceBackend, MemoryBackend};
use paddock::replicator::{DirectReplicator, Replicator};
use paddock::*;
use std::collections::HashMap;
use std::sync::Arc;

fn created_member(name: &str, address: &str) -> Member {
    Member {
        id: 0,
        name: name.to_string(),
        address: address.to_string(),
        architecture: "x86_64".to_string(),
        schema_version: SCHEMA_VERSION,
        api_extensions: API_EXTENSIONS,
        raft_role: RaftRole::Voter,
        state: MemberState::Created,
        heartbeat_at: Utc::now(),
        roles: Vec::new(),
        failure_domain: String::new(),
        groups: vec![DEFAULT_GROUP.to_string()],
        config: HashMap::new(),
        description: String::new(),
    }
}

fn instance_record(name: &str, member: &str, running: bool) -> InstanceRecord {
    InstanceRecord {
        name: name.to_string(),
        member: member.to_string(),
        kind: InstanceKind::Container,
        architecture: "x86_64".to_string(),
        config: HashMap::new(),
        running,
    }
}

async fn two_member_setup() -> (Arc<DirectReplicator>, Arc<MemoryBackend>, Evacuator) {
    let replicator = Arc::new(DirectReplicator::new());
    let backend = Arc::new(MemoryBackend::new());

    for (name, addr) in [("n1", "10.0.0.1:8443"), ("n2", "10.0.0.2:8443")] {
        replicator
            .apply(ClusterCommand::AddMember(created_member(name, addr)))
            .await
            .unwrap();
    }

    let evacuator = Evacuator::new(replicator.clone(), backend.clone());
    (replicator, backend, evacuator)
}

async fn add_instance(
    replicator: &DirectReplicator,
    backend: &MemoryBackend,
    name: &str,
    member: &str,
    running: bool,
) {
    replicator
        .apply(ClusterCommand::PutInstance(instance_record(
            name, member, running,
        )))
        .await
        .unwrap();
    backend.insert(
        name,
        BackendInstance {
            running,
            member: member.to_string(),
            kind: Some(InstanceKind::Container),
            config: HashMap::new(),
            stateful: false,
        },
    );
}

#[tokio::test]
async fn test_evacuate_migrates_running_instance() {
    let (replicator, backend, evacuator) = two_member_setup().await;
    add_instance(&replicator, &backend, "i1", "n2", true).await;

    let report = evacuator
        .evacuate("n2", Some(EvacuateMode::Migrate))
        .await
        .unwrap();

    assert_eq!(report.migrated, vec!["i1".to_string()]);
    assert!(report.failed.is_empty());

    let state = replicator.snapshot();
    assert_eq!(state.member_by_name("n2").unwrap().state, MemberState::Evacuated);

    let i1 = state.instances.get("i1").unwrap();
    assert_eq!(i1.member, "n1");
    assert!(i1.running);
    assert!(i1.was_running());

    assert_eq!(backend.get("i1").unwrap().member, "n1");
    assert!(backend.is_running("i1"));
}

#[tokio::test]
async fn test_evacuate_then_restore_leaves_migrated_instance_in_place() {
    let (replicator, backend, evacuator) = two_member_setup().await;
    add_instance(&replicator, &backend, "i1", "n2", true).await;

    evacuator
        .evacuate("n2", Some(EvacuateMode::Migrate))
        .await
        .unwrap();
    let report = evacuator.restore("n2").await.unwrap();

    // Restore re-enables placement but does not migrate i1 back.
    assert!(report.restarted.is_empty());

    let state = replicator.snapshot();
    assert_eq!(state.member_by_name("n2").unwrap().state, MemberState::Created);
    assert_eq!(state.instances.get("i1").unwrap().member, "n1");
}

#[tokio::test]
async fn test_evacuate_stop_mode_stops_then_migrates() {
    let (replicator, backend, evacuator) = two_member_setup().await;
    add_instance(&replicator, &backend, "i1", "n2", true).await;
    add_instance(&replicator, &backend, "i2", "n2", false).await;

    let report = evacuator
        .evacuate("n2", Some(EvacuateMode::Stop))
        .await
        .unwrap();

    // The mode only changes how instances stop; both still move off n2.
    let mut migrated = report.migrated.clone();
    migrated.sort();
    assert_eq!(migrated, vec!["i1".to_string(), "i2".to_string()]);
    assert!(report.stopped.is_empty());
    assert!(report.failed.is_empty());

    let state = replicator.snapshot();
    let i1 = state.instances.get("i1").unwrap();
    assert_eq!(i1.member, "n1");
    assert!(i1.running);
    assert!(i1.was_running());

    let i2 = state.instances.get("i2").unwrap();
    assert_eq!(i2.member, "n1");
    assert!(!i2.running);

    assert_eq!(backend.get("i1").unwrap().member, "n1");
    assert!(backend.is_running("i1"));
    assert!(!backend.is_running("i2"));
}

#[tokio::test]
async fn test_evacuate_stateful_stop_migrates_without_restart() {
    let (replicator, backend, evacuator) = two_member_setup().await;
    add_instance(&replicator, &backend, "i1", "n2", true).await;

    let report = evacuator
        .evacuate("n2", Some(EvacuateMode::StatefulStop))
        .await
        .unwrap();

    assert_eq!(report.migrated, vec!["i1".to_string()]);

    // The saved state travels to the target; the instance stays down there
    // until restore brings it back.
    let state = replicator.snapshot();
    let i1 = state.instances.get("i1").unwrap();
    assert_eq!(i1.member, "n1");
    assert!(!i1.running);
    assert!(i1.was_running());

    let stored = backend.get("i1").unwrap();
    assert_eq!(stored.member, "n1");
    assert!(stored.stateful);
    assert!(!stored.running);
}

#[tokio::test]
async fn test_evacuate_auto_falls_back_to_stop_without_target() {
    let replicator = Arc::new(DirectReplicator::new());
    let backend = Arc::new(MemoryBackend::new());

    // Single member: nowhere to migrate to.
    replicator
        .apply(ClusterCommand::AddMember(created_member(
            "n1",
            "10.0.0.1:8443",
        )))
        .await
        .unwrap();
    add_instance(&replicator, &backend, "i1", "n1", true).await;

    let evacuator = Evacuator::new(replicator.clone(), backend.clone());

    let report = evacuator
        .evacuate("n1", Some(EvacuateMode::Auto))
        .await
        .unwrap();

    assert_eq!(report.stopped, vec!["i1".to_string()]);
    assert!(report.failed.is_empty());
    assert!(!backend.is_running("i1"));

    // The instance stayed in place, so restore brings it back up here.
    let report = evacuator.restore("n1").await.unwrap();
    assert_eq!(report.restarted, vec!["i1".to_string()]);
    assert!(backend.is_running("i1"));
    assert!(replicator.snapshot().instances.get("i1").unwrap().running);
}

#[tokio::test]
async fn test_evacuate_migrate_mode_fails_without_target() {
    let replicator = Arc::new(DirectReplicator::new());
    let backend = Arc::new(MemoryBackend::new());

    replicator
        .apply(ClusterCommand::AddMember(created_member(
            "n1",
            "10.0.0.1:8443",
        )))
        .await
        .unwrap();
    add_instance(&replicator, &backend, "i1", "n1", false).await;

    let evacuator = Evacuator::new(replicator.clone(), backend.clone());

    let report = evacuator
        .evacuate("n1", Some(EvacuateMode::Migrate))
        .await
        .unwrap();

    // Per-instance failures are recorded, the operation itself completes.
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].instance, "i1");
}

#[tokio::test]
async fn test_evacuate_twice_conflicts() {
    let (replicator, _backend, evacuator) = two_member_setup().await;
    let _ = replicator;

    evacuator.evacuate("n2", None).await.unwrap();
    let err = evacuator.evacuate("n2", None).await.unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_restore_requires_evacuated_state() {
    let (_replicator, _backend, evacuator) = two_member_setup().await;

    let err = evacuator.restore("n2").await.unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_evacuate_unknown_member() {
    let (_replicator, _backend, evacuator) = two_member_setup().await;

    let err = evacuator.evacuate("ghost", None).await.unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
}

#[test]
fn test_placement_skips_evacuated_and_wrong_architecture() {
    let mut state = paddock::replicator::ClusterState::new();

    let mut n1 = created_member("n1", "10.0.0.1:8443");
    n1.id = 1;
    let mut n2 = created_member("n2", "10.0.0.2:8443");
    n2.id = 2;
    n2.state = MemberState::Evacuated;
    let mut n3 = created_member("n3", "10.0.0.3:8443");
    n3.id = 3;
    n3.architecture = "aarch64".to_string();

    for m in [n1, n2, n3] {
        state.members.insert(m.name.clone(), m);
    }

    let instance = instance_record("i1", "n4", true);
    let target = pick_migration_target(&state, &instance, Utc::now()).unwrap();
    assert_eq!(target.name, "n1");
}

#[test]
fn test_placement_respects_manual_scheduler_policy() {
    let mut state = paddock::replicator::ClusterState::new();

    let mut n1 = created_member("n1", "10.0.0.1:8443");
    n1.id = 1;
    n1.config
        .insert("scheduler.instance".to_string(), "manual".to_string());
    state.members.insert(n1.name.clone(), n1);

    let instance = instance_record("i1", "n2", true);
    assert!(pick_migration_target(&state, &instance, Utc::now()).is_none());
}

#[test]
fn test_placement_prefers_least_loaded_member() {
    let mut state = paddock::replicator::ClusterState::new();

    let mut n1 = created_member("n1", "10.0.0.1:8443");
    n1.id = 1;
    let mut n3 = created_member("n3", "10.0.0.3:8443");
    n3.id = 3;
    for m in [n1, n3] {
        state.members.insert(m.name.clone(), m);
    }

    state.apply(&ClusterCommand::PutInstance(instance_record(
        "busy1", "n1", true,
    )));
    state.apply(&ClusterCommand::PutInstance(instance_record(
        "busy2", "n1", true,
    )));

    let instance = instance_record("i1", "n2", true);
    let target = pick_migration_target(&state, &instance, Utc::now()).unwrap();
    assert_eq!(target.name, "n3");
}
