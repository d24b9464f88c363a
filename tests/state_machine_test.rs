use chrono::{Duration, Utc};
use paddock::replicator::ClusterState;
use paddock::*;
use std::collections::HashMap;

fn new_member(name: &str, address: &str) -> Member {
    Member {
        id: 0,
        name: name.to_string(),
        address: address.to_string(),
        architecture: "x86_64".to_string(),
        schema_version: SCHEMA_VERSION,
        api_extensions: API_EXTENSIONS,
        raft_role: RaftRole::Spare,
        state: MemberState::Pending,
        heartbeat_at: Utc::now(),
        roles: Vec::new(),
        failure_domain: String::new(),
        groups: vec![DEFAULT_GROUP.to_string()],
        config: HashMap::new(),
        description: String::new(),
    }
}

#[test]
fn test_cluster_state_new() {
    let state = ClusterState::new();
    assert!(state.members.is_empty());
    assert!(state.instances.is_empty());
    assert!(state.trusted_certs.is_empty());
    assert_eq!(state.next_member_id, 1);
    assert_eq!(state.last_applied_index, 0);
}

#[test]
fn test_add_member_assigns_monotonic_ids() {
    let mut state = ClusterState::new();

    state.apply(&ClusterCommand::AddMember(new_member("n1", "10.0.0.1:8443")));
    state.apply(&ClusterCommand::AddMember(new_member("n2", "10.0.0.2:8443")));

    assert_eq!(state.member_by_name("n1").unwrap().id, 1);
    assert_eq!(state.member_by_name("n2").unwrap().id, 2);

    // Ids are never reused, even after a purge.
    state.apply(&ClusterCommand::RemoveMember {
        name: "n2".to_string(),
    });
    state.apply(&ClusterCommand::AddMember(new_member("n3", "10.0.0.3:8443")));
    assert_eq!(state.member_by_name("n3").unwrap().id, 3);
}

#[test]
fn test_mark_created() {
    let mut state = ClusterState::new();
    state.apply(&ClusterCommand::AddMember(new_member("n1", "10.0.0.1:8443")));

    state.apply(&ClusterCommand::MarkCreated {
        name: "n1".to_string(),
    });

    let member = state.member_by_name("n1").unwrap();
    assert_eq!(member.state, MemberState::Created);
    assert!(!member.groups.is_empty());
}

#[test]
fn test_set_raft_role_shadows_database_role() {
    let mut state = ClusterState::new();
    state.apply(&ClusterCommand::AddMember(new_member("n1", "10.0.0.1:8443")));

    state.apply(&ClusterCommand::SetRaftRole {
        name: "n1".to_string(),
        role: RaftRole::Voter,
    });
    let member = state.member_by_name("n1").unwrap();
    assert!(member.roles.iter().any(|r| r == "database"));
    assert!(member.is_database());

    state.apply(&ClusterCommand::SetRaftRole {
        name: "n1".to_string(),
        role: RaftRole::Spare,
    });
    let member = state.member_by_name("n1").unwrap();
    assert!(!member.roles.iter().any(|r| r == "database"));
    assert!(!member.is_database());
}

#[test]
fn test_rename_member() {
    let mut state = ClusterState::new();
    state.apply(&ClusterCommand::AddMember(new_member("n1", "10.0.0.1:8443")));

    state.apply(&ClusterCommand::RenameMember {
        old: "n1".to_string(),
        new: "edge-1".to_string(),
    });

    assert!(state.member_by_name("n1").is_none());
    let renamed = state.member_by_name("edge-1").unwrap();
    assert_eq!(renamed.name, "edge-1");
    assert_eq!(renamed.id, 1);
}

#[test]
fn test_member_seen_is_monotonic() {
    let mut state = ClusterState::new();
    state.apply(&ClusterCommand::AddMember(new_member("n1", "10.0.0.1:8443")));

    let future = Utc::now() + Duration::seconds(30);
    state.apply(&ClusterCommand::MemberSeen {
        name: "n1".to_string(),
        at: future,
    });
    assert_eq!(state.member_by_name("n1").unwrap().heartbeat_at, future);

    // An older timestamp never rolls the clock back.
    state.apply(&ClusterCommand::MemberSeen {
        name: "n1".to_string(),
        at: future - Duration::seconds(60),
    });
    assert_eq!(state.member_by_name("n1").unwrap().heartbeat_at, future);
}

#[test]
fn test_offline_is_derived_not_stored() {
    let mut state = ClusterState::new();
    state.apply(&ClusterCommand::AddMember(new_member("n1", "10.0.0.1:8443")));
    state.apply(&ClusterCommand::MarkCreated {
        name: "n1".to_string(),
    });

    let member = state.member_by_name("n1").unwrap();
    let now = Utc::now();
    assert!(!member.is_offline(20, now));
    assert!(member.is_offline(20, now + Duration::seconds(21)));
    assert_eq!(member.state, MemberState::Created);
}

#[test]
fn test_cluster_config_patch() {
    let mut state = ClusterState::new();

    let mut values = HashMap::new();
    values.insert("cluster.max_voters".to_string(), "5".to_string());
    state.apply(&ClusterCommand::SetClusterConfig { values });
    assert_eq!(state.config.max_voters(), 5);

    // Empty value deletes the key, falling back to the default.
    let mut values = HashMap::new();
    values.insert("cluster.max_voters".to_string(), String::new());
    state.apply(&ClusterCommand::SetClusterConfig { values });
    assert_eq!(state.config.max_voters(), 3);
}

#[test]
fn test_trusted_certs() {
    let mut state = ClusterState::new();

    state.apply(&ClusterCommand::AddTrustedCert {
        name: "n2".to_string(),
        fingerprint: "abcd".to_string(),
        cert_pem: "---cert---".to_string(),
    });
    assert_eq!(state.trusted_certs.len(), 1);
    assert_eq!(state.trusted_certs.get("abcd").unwrap().name, "n2");

    state.apply(&ClusterCommand::RemoveTrustedCert {
        fingerprint: "abcd".to_string(),
    });
    assert!(state.trusted_certs.is_empty());
}

#[test]
fn test_instance_commands() {
    let mut state = ClusterState::new();

    let mut config = HashMap::new();
    config.insert("boot.autostart".to_string(), "true".to_string());
    state.apply(&ClusterCommand::PutInstance(InstanceRecord {
        name: "web1".to_string(),
        member: "n1".to_string(),
        kind: InstanceKind::Container,
        architecture: "x86_64".to_string(),
        config,
        running: true,
    }));

    assert_eq!(state.instances_on("n1").len(), 1);
    assert!(state.instances.get("web1").unwrap().autostart());

    state.apply(&ClusterCommand::SetInstanceLocation {
        name: "web1".to_string(),
        member: "n2".to_string(),
    });
    assert!(state.instances_on("n1").is_empty());
    assert_eq!(state.instances_on("n2").len(), 1);

    state.apply(&ClusterCommand::SetInstancePower {
        name: "web1".to_string(),
        running: false,
    });
    state.apply(&ClusterCommand::SetLastPowerState {
        name: "web1".to_string(),
        power: "running".to_string(),
    });
    let instance = state.instances.get("web1").unwrap();
    assert!(!instance.running);
    assert!(instance.was_running());
}

#[test]
fn test_online_members_filters_pending_and_offline() {
    let mut state = ClusterState::new();
    state.apply(&ClusterCommand::AddMember(new_member("n1", "10.0.0.1:8443")));
    state.apply(&ClusterCommand::AddMember(new_member("n2", "10.0.0.2:8443")));
    state.apply(&ClusterCommand::MarkCreated {
        name: "n1".to_string(),
    });

    // n2 stays pending; n1 is created and fresh.
    let online = state.online_members(Utc::now());
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].name, "n1");

    let later = Utc::now() + Duration::seconds(120);
    assert!(state.online_members(later).is_empty());
}
