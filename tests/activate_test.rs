use paddock::activate::{check_activation, ActivationDecision};
use paddock::local_store::LocalStore;
use paddock::replicator::ClusterState;
use paddock::*;
use std::collections::HashMap;
use tempfile::TempDir;

fn write_global_snapshot(data_dir: &std::path::Path, state: &ClusterState) {
    let db = sled::open(data_dir.join("database").join("global")).unwrap();
    let meta = db.open_tree("raft_meta").unwrap();
    meta.insert(b"state_snapshot", serde_json::to_vec(state).unwrap())
        .unwrap();
    meta.flush().unwrap();
}

fn local_store(data_dir: &std::path::Path) -> LocalStore {
    LocalStore::open(data_dir.join("database").join("local")).unwrap()
}

fn instance(name: &str, member: &str, config: HashMap<String, String>) -> InstanceRecord {
    InstanceRecord {
        name: name.to_string(),
        member: member.to_string(),
        kind: InstanceKind::Container,
        architecture: "x86_64".to_string(),
        config,
        running: false,
    }
}

#[test]
fn test_no_local_database_stays_down() {
    let dir = TempDir::new().unwrap();
    assert_eq!(
        check_activation(dir.path()).unwrap(),
        ActivationDecision::StayDown
    );
}

#[test]
fn test_network_address_triggers_activation() {
    let dir = TempDir::new().unwrap();
    let store = local_store(dir.path());
    store.set_cluster_address("10.0.0.1:8443").unwrap();
    drop(store);

    match check_activation(dir.path()).unwrap() {
        ActivationDecision::Activate { reason } => {
            assert!(reason.contains("network address"));
        }
        other => panic!("expected activation, got {:?}", other),
    }
}

#[test]
fn test_quiet_databases_stay_down() {
    let dir = TempDir::new().unwrap();
    let store = local_store(dir.path());
    store.set_server_name("n1").unwrap();
    drop(store);

    let mut state = ClusterState::new();
    state
        .instances
        .insert("idle".to_string(), instance("idle", "n1", HashMap::new()));
    write_global_snapshot(dir.path(), &state);

    assert_eq!(
        check_activation(dir.path()).unwrap(),
        ActivationDecision::StayDown
    );
}

#[test]
fn test_autostart_instance_triggers_activation() {
    let dir = TempDir::new().unwrap();
    let store = local_store(dir.path());
    store.set_server_name("n1").unwrap();
    drop(store);

    let mut config = HashMap::new();
    config.insert("boot.autostart".to_string(), "true".to_string());
    let mut state = ClusterState::new();
    state
        .instances
        .insert("web".to_string(), instance("web", "n1", config));
    write_global_snapshot(dir.path(), &state);

    match check_activation(dir.path()).unwrap() {
        ActivationDecision::Activate { reason } => assert!(reason.contains("boot.autostart")),
        other => panic!("expected activation, got {:?}", other),
    }
}

#[test]
fn test_previously_running_instance_triggers_activation() {
    let dir = TempDir::new().unwrap();
    let store = local_store(dir.path());
    store.set_server_name("n1").unwrap();
    drop(store);

    let mut config = HashMap::new();
    config.insert(
        "volatile.last_state.power".to_string(),
        "running".to_string(),
    );
    let mut state = ClusterState::new();
    state
        .instances
        .insert("web".to_string(), instance("web", "n1", config));
    write_global_snapshot(dir.path(), &state);

    match check_activation(dir.path()).unwrap() {
        ActivationDecision::Activate { reason } => assert!(reason.contains("running")),
        other => panic!("expected activation, got {:?}", other),
    }
}

#[test]
fn test_instances_on_other_members_are_ignored() {
    let dir = TempDir::new().unwrap();
    let store = local_store(dir.path());
    store.set_server_name("n1").unwrap();
    drop(store);

    let mut config = HashMap::new();
    config.insert("boot.autostart".to_string(), "true".to_string());
    let mut state = ClusterState::new();
    state
        .instances
        .insert("web".to_string(), instance("web", "n2", config));
    write_global_snapshot(dir.path(), &state);

    assert_eq!(
        check_activation(dir.path()).unwrap(),
        ActivationDecision::StayDown
    );
}

#[test]
fn test_volume_snapshot_schedule_triggers_activation() {
    let dir = TempDir::new().unwrap();
    let store = local_store(dir.path());
    store.set_server_name("n1").unwrap();
    drop(store);

    let mut config = HashMap::new();
    config.insert("snapshots.schedule".to_string(), "@daily".to_string());
    let mut state = ClusterState::new();
    state.volumes.insert(
        "backups".to_string(),
        VolumeRecord {
            name: "backups".to_string(),
            config,
        },
    );
    write_global_snapshot(dir.path(), &state);

    match check_activation(dir.path()).unwrap() {
        ActivationDecision::Activate { reason } => assert!(reason.contains("backups")),
        other => panic!("expected activation, got {:?}", other),
    }
}

#[test]
fn test_local_store_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = local_store(dir.path());

    assert!(store.cluster_address().unwrap().is_none());
    store.set_cluster_address("10.0.0.1:8443").unwrap();
    assert_eq!(
        store.cluster_address().unwrap().as_deref(),
        Some("10.0.0.1:8443")
    );

    store.set_member_id(7).unwrap();
    assert_eq!(store.member_id().unwrap(), Some(7));

    let nodes = vec![RaftNodeInfo {
        id: 1,
        address: "10.0.0.1:8443".to_string(),
        role: RaftRole::Voter,
    }];
    store.set_raft_nodes(&nodes).unwrap();
    assert_eq!(store.raft_nodes().unwrap(), nodes);

    // Clearing the cluster address removes the key entirely.
    store.set_cluster_address("").unwrap();
    assert!(store.cluster_address().unwrap().is_none());

    store.wipe_cluster_state().unwrap();
    assert!(store.raft_nodes().unwrap().is_empty());
}
