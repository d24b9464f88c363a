use chrono::{DateTime, Duration, Utc};
use paddock::rebalance::{plan_rebalance, standby_target, voter_target, RoleChange};
use paddock::replicator::ClusterState;
use paddock::*;
use std::collections::HashMap;

fn member(id: u64, name: &str, role: RaftRole, domain: &str, seen: DateTime<Utc>) -> Member {
    Member {
        id,
        name: name.to_string(),
        address: format!("10.0.0.{}:8443", id),
        architecture: "x86_64".to_string(),
        schema_version: SCHEMA_VERSION,
        api_extensions: API_EXTENSIONS,
        raft_role: role,
        state: MemberState::Created,
        heartbeat_at: seen,
        roles: Vec::new(),
        failure_domain: domain.to_string(),
        groups: vec![DEFAULT_GROUP.to_string()],
        config: HashMap::new(),
        description: String::new(),
    }
}

fn state_of(members: Vec<Member>) -> ClusterState {
    let mut state = ClusterState::new();
    for m in members {
        state.members.insert(m.name.clone(), m);
    }
    state
}

#[test]
fn test_voter_target_rounds_down_to_odd() {
    assert_eq!(voter_target(1, 3), 1);
    assert_eq!(voter_target(2, 3), 1);
    assert_eq!(voter_target(3, 3), 3);
    assert_eq!(voter_target(4, 3), 3);
    assert_eq!(voter_target(10, 5), 5);
    assert_eq!(voter_target(10, 4), 3);
    assert_eq!(voter_target(0, 3), 1);
}

#[test]
fn test_standby_target() {
    assert_eq!(standby_target(2, 1, 2), 1);
    assert_eq!(standby_target(3, 3, 2), 0);
    assert_eq!(standby_target(5, 3, 2), 2);
    assert_eq!(standby_target(8, 3, 2), 2);
}

#[test]
fn test_two_members_one_voter_one_standby() {
    let now = Utc::now();
    let state = state_of(vec![
        member(1, "n1", RaftRole::Voter, "", now),
        member(2, "n2", RaftRole::Spare, "", now),
    ]);

    let changes = plan_rebalance(&state, "n1", now);
    assert_eq!(
        changes,
        vec![RoleChange::PromoteToStandby {
            name: "n2".to_string()
        }]
    );
}

#[test]
fn test_three_members_converge_to_three_voters() {
    let now = Utc::now();
    let state = state_of(vec![
        member(1, "n1", RaftRole::Voter, "", now),
        member(2, "n2", RaftRole::Standby, "", now),
        member(3, "n3", RaftRole::Spare, "", now),
    ]);

    let changes = plan_rebalance(&state, "n1", now);

    // n2 is promoted directly; n3 steps through stand-by first.
    assert!(changes.contains(&RoleChange::PromoteToVoter {
        name: "n2".to_string()
    }));
    assert!(changes.contains(&RoleChange::PromoteToStandby {
        name: "n3".to_string()
    }));
    assert!(changes.contains(&RoleChange::PromoteToVoter {
        name: "n3".to_string()
    }));
}

#[test]
fn test_five_members_three_voters_two_standbys() {
    let now = Utc::now();
    let state = state_of(vec![
        member(1, "n1", RaftRole::Voter, "", now),
        member(2, "n2", RaftRole::Voter, "", now),
        member(3, "n3", RaftRole::Voter, "", now),
        member(4, "n4", RaftRole::Spare, "", now),
        member(5, "n5", RaftRole::Spare, "", now),
    ]);

    let changes = plan_rebalance(&state, "n1", now);
    assert_eq!(
        changes,
        vec![
            RoleChange::PromoteToStandby {
                name: "n4".to_string()
            },
            RoleChange::PromoteToStandby {
                name: "n5".to_string()
            },
        ]
    );
}

#[test]
fn test_balanced_cluster_is_a_noop() {
    let now = Utc::now();
    let state = state_of(vec![
        member(1, "n1", RaftRole::Voter, "", now),
        member(2, "n2", RaftRole::Voter, "", now),
        member(3, "n3", RaftRole::Voter, "", now),
        member(4, "n4", RaftRole::Standby, "", now),
        member(5, "n5", RaftRole::Standby, "", now),
    ]);

    assert!(plan_rebalance(&state, "n1", now).is_empty());
}

#[test]
fn test_offline_voter_is_demoted_when_replacement_exists() {
    let now = Utc::now();
    let stale = now - Duration::seconds(120);
    let state = state_of(vec![
        member(1, "n1", RaftRole::Voter, "", now),
        member(2, "n2", RaftRole::Voter, "", now),
        member(3, "n3", RaftRole::Voter, "", stale),
        member(4, "n4", RaftRole::Spare, "", now),
    ]);

    let changes = plan_rebalance(&state, "n1", now);

    assert_eq!(
        changes.first(),
        Some(&RoleChange::DemoteOffline {
            name: "n3".to_string()
        })
    );
    // The spare takes the vacated seat via the stand-by stepping stone.
    assert!(changes.contains(&RoleChange::PromoteToVoter {
        name: "n4".to_string()
    }));
}

#[test]
fn test_leader_is_never_demoted() {
    let now = Utc::now();
    // Two voters, target is one: someone has to go, and it must not be the
    // leader even though it has the highest id.
    let state = state_of(vec![
        member(1, "n1", RaftRole::Voter, "", now),
        member(2, "n2", RaftRole::Voter, "", now),
    ]);

    let changes = plan_rebalance(&state, "n2", now);
    assert_eq!(
        changes,
        vec![RoleChange::DemoteToStandby {
            name: "n1".to_string()
        }]
    );
}

#[test]
fn test_promotion_prefers_unrepresented_failure_domain() {
    let now = Utc::now();
    let state = state_of(vec![
        member(1, "n1", RaftRole::Voter, "rack1", now),
        member(2, "n2", RaftRole::Voter, "rack1", now),
        member(3, "n3", RaftRole::Standby, "rack1", now),
        member(4, "n4", RaftRole::Standby, "rack2", now),
        member(5, "n5", RaftRole::Spare, "rack1", now),
    ]);

    let changes = plan_rebalance(&state, "n1", now);

    // n4 is picked ahead of the lower-id n3 because rack2 has no voter yet.
    assert_eq!(
        changes.first(),
        Some(&RoleChange::PromoteToVoter {
            name: "n4".to_string()
        })
    );
}

#[test]
fn test_domain_rule_relaxed_when_unsatisfiable() {
    let now = Utc::now();
    let state = state_of(vec![
        member(1, "n1", RaftRole::Voter, "rack1", now),
        member(2, "n2", RaftRole::Standby, "rack1", now),
        member(3, "n3", RaftRole::Standby, "rack1", now),
    ]);

    let changes = plan_rebalance(&state, "n1", now);

    // All candidates share the voter's domain; the lowest id still wins.
    assert_eq!(
        changes.first(),
        Some(&RoleChange::PromoteToVoter {
            name: "n2".to_string()
        })
    );
}

#[test]
fn test_pending_members_are_ignored() {
    let now = Utc::now();
    let mut pending = member(2, "n2", RaftRole::Spare, "", now);
    pending.state = MemberState::Pending;

    let state = state_of(vec![member(1, "n1", RaftRole::Voter, "", now), pending]);

    assert!(plan_rebalance(&state, "n1", now).is_empty());
}

#[test]
fn test_leader_removal_leaves_one_voter_one_standby() {
    // After a three-member cluster loses its leader, the two survivors
    // settle on a single voter plus one stand-by.
    let now = Utc::now();
    let state = state_of(vec![
        member(2, "n2", RaftRole::Voter, "", now),
        member(3, "n3", RaftRole::Voter, "", now),
    ]);

    let changes = plan_rebalance(&state, "n2", now);
    assert_eq!(
        changes,
        vec![RoleChange::DemoteToStandby {
            name: "n3".to_string()
        }]
    );
}
