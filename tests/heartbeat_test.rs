use chrono::Utc;
use paddock::heartbeat::{HeartbeatView, RoundOutcome};
use paddock::replicator::ClusterState;
use paddock::*;
use std::collections::HashMap;

fn member_with_role(name: &str, role: RaftRole) -> Member {
    Member {
        id: 1,
        name: name.to_string(),
        address: "10.0.0.1:8443".to_string(),
        architecture: "x86_64".to_string(),
        schema_version: SCHEMA_VERSION,
        api_extensions: API_EXTENSIONS,
        raft_role: role,
        state: MemberState::Created,
        heartbeat_at: Utc::now(),
        roles: Vec::new(),
        failure_domain: String::new(),
        groups: vec![DEFAULT_GROUP.to_string()],
        config: HashMap::new(),
        description: String::new(),
    }
}

#[test]
fn test_heartbeat_view_tracks_last_seen() {
    let view = HeartbeatView::new();
    assert!(view.last_seen("n2").is_none());

    let before = Utc::now();
    view.observe("n2");

    let seen = view.last_seen("n2").unwrap();
    assert!(seen >= before);
    assert!(view.last_seen("n3").is_none());
}

#[test]
fn test_lost_database_member_triggers_on_voter() {
    let mut state = ClusterState::new();
    let voter = member_with_role("n2", RaftRole::Voter);
    state.members.insert(voter.name.clone(), voter);

    let outcome = RoundOutcome {
        reachable: Vec::new(),
        unreachable: vec!["n2".to_string()],
    };
    assert!(outcome.lost_database_member(&state));
}

#[test]
fn test_lost_spare_member_does_not_trigger() {
    let mut state = ClusterState::new();
    let spare = member_with_role("n3", RaftRole::Spare);
    state.members.insert(spare.name.clone(), spare);

    let outcome = RoundOutcome {
        reachable: Vec::new(),
        unreachable: vec!["n3".to_string(), "unknown".to_string()],
    };
    assert!(!outcome.lost_database_member(&state));
}
