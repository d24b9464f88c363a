use chrono::Duration;
use paddock::config::{parse_expiry, ClusterConfig, NodeConfig};
use paddock::types::EvacuateMode;
use std::collections::HashMap;

fn config_with(key: &str, value: &str) -> ClusterConfig {
    let mut values = HashMap::new();
    values.insert(key.to_string(), value.to_string());
    ClusterConfig::new(values)
}

#[test]
fn test_defaults() {
    let config = ClusterConfig::default();
    assert_eq!(config.offline_threshold(), 20);
    assert_eq!(config.max_voters(), 3);
    assert_eq!(config.max_standbys(), 2);
    assert_eq!(config.join_token_expiry(), Duration::hours(3));
    assert_eq!(config.evacuate_mode(), EvacuateMode::Auto);
    assert!(config.https_address().is_none());
}

#[test]
fn test_typed_getters() {
    assert_eq!(
        config_with("cluster.offline_threshold", "40").offline_threshold(),
        40
    );
    assert_eq!(config_with("cluster.max_voters", "5").max_voters(), 5);
    assert_eq!(
        config_with("cluster.evacuate", "live-migrate").evacuate_mode(),
        EvacuateMode::LiveMigrate
    );
    assert_eq!(
        config_with("cluster.https_address", "10.0.0.1:8443").https_address(),
        Some("10.0.0.1:8443")
    );
}

#[test]
fn test_validate_offline_threshold_minimum() {
    let mut values = HashMap::new();
    values.insert("cluster.offline_threshold".to_string(), "5".to_string());
    assert!(ClusterConfig::validate(&values).is_err());

    values.insert("cluster.offline_threshold".to_string(), "10".to_string());
    assert!(ClusterConfig::validate(&values).is_ok());
}

#[test]
fn test_validate_max_voters_must_be_odd() {
    let mut values = HashMap::new();
    values.insert("cluster.max_voters".to_string(), "2".to_string());
    assert!(ClusterConfig::validate(&values).is_err());

    values.insert("cluster.max_voters".to_string(), "0".to_string());
    assert!(ClusterConfig::validate(&values).is_err());

    values.insert("cluster.max_voters".to_string(), "5".to_string());
    assert!(ClusterConfig::validate(&values).is_ok());
}

#[test]
fn test_validate_unknown_key_rejected_user_keys_pass() {
    let mut values = HashMap::new();
    values.insert("cluster.bogus".to_string(), "1".to_string());
    assert!(ClusterConfig::validate(&values).is_err());

    let mut values = HashMap::new();
    values.insert("user.anything".to_string(), "goes".to_string());
    assert!(ClusterConfig::validate(&values).is_ok());
}

#[test]
fn test_validate_evacuate_mode() {
    let mut values = HashMap::new();
    values.insert("cluster.evacuate".to_string(), "stateful-stop".to_string());
    assert!(ClusterConfig::validate(&values).is_ok());

    values.insert("cluster.evacuate".to_string(), "sideways".to_string());
    assert!(ClusterConfig::validate(&values).is_err());
}

#[test]
fn test_patch_and_delete() {
    let mut config = ClusterConfig::default();

    let mut values = HashMap::new();
    values.insert("cluster.max_standbys".to_string(), "4".to_string());
    config.patch(values);
    assert_eq!(config.max_standbys(), 4);

    let mut values = HashMap::new();
    values.insert("cluster.max_standbys".to_string(), String::new());
    config.patch(values);
    assert_eq!(config.max_standbys(), 2);
}

#[test]
fn test_parse_expiry() {
    assert_eq!(parse_expiry("3H").unwrap(), Duration::hours(3));
    assert_eq!(parse_expiry("30M").unwrap(), Duration::minutes(30));
    assert_eq!(parse_expiry("45S").unwrap(), Duration::seconds(45));
    assert_eq!(parse_expiry("2d").unwrap(), Duration::days(2));
    assert_eq!(parse_expiry("90").unwrap(), Duration::seconds(90));
    assert!(parse_expiry("").is_err());
    assert!(parse_expiry("soon").is_err());
}

#[test]
fn test_node_config_defaults() {
    let config = NodeConfig::default();
    assert_eq!(config.bind_port, 8443);
    assert_eq!(config.heartbeat_interval_secs, 10);
    assert_eq!(config.listen_addr(), "0.0.0.0:8443");
    assert!(!config.effective_architecture().is_empty());
}

#[test]
fn test_node_config_save_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("paddock.toml");

    let mut config = NodeConfig::default();
    config.server_name = Some("n1".to_string());
    config.bind_port = 9443;
    config.save(&path).unwrap();

    let loaded = NodeConfig::load(&path).unwrap();
    assert_eq!(loaded.server_name.as_deref(), Some("n1"));
    assert_eq!(loaded.listen_addr(), "0.0.0.0:9443");
}
