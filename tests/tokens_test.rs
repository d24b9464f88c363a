use chrono::{Duration, Utc};
use paddock::local_store::LocalStore;
use paddock::operations::{OperationClass, OperationRegistry, OperationState};
use paddock::trust::TokenManager;
use paddock::types::JoinToken;
use std::sync::Arc;
use tempfile::TempDir;

fn token_manager() -> (TokenManager, OperationRegistry, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalStore::open(dir.path().join("local")).unwrap());
    let registry = OperationRegistry::new(store).unwrap();
    (TokenManager::new(registry.clone()), registry, dir)
}

fn addresses() -> Vec<String> {
    vec!["10.0.0.1:8443".to_string()]
}

#[test]
fn test_issue_token() {
    let (tokens, registry, _dir) = token_manager();

    let (token, op) = tokens
        .issue("n2", "fp", addresses(), Duration::hours(3))
        .unwrap();

    assert_eq!(token.server_name, "n2");
    assert_eq!(token.fingerprint, "fp");
    assert_eq!(token.addresses, addresses());
    // 32 bytes of entropy, hex encoded.
    assert_eq!(token.secret.len(), 64);
    assert!(token.expires_at > Utc::now());

    let op = registry.get(&op.id).unwrap();
    assert_eq!(op.class, OperationClass::Token);
    assert_eq!(op.state, OperationState::Running);
    assert_eq!(op.metadata_str("serverName"), Some("n2"));
}

#[test]
fn test_issue_requires_online_members() {
    let (tokens, _registry, _dir) = token_manager();

    let err = tokens
        .issue("n2", "fp", Vec::new(), Duration::hours(3))
        .unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
}

#[test]
fn test_validate_token() {
    let (tokens, _registry, _dir) = token_manager();
    let (token, op) = tokens
        .issue("n2", "fp", addresses(), Duration::hours(3))
        .unwrap();

    let found = tokens.validate("n2", &token.secret).unwrap();
    assert_eq!(found.id, op.id);
}

#[test]
fn test_validate_wrong_secret() {
    let (tokens, _registry, _dir) = token_manager();
    tokens
        .issue("n2", "fp", addresses(), Duration::hours(3))
        .unwrap();

    let err = tokens.validate("n2", "bogus").unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
}

#[test]
fn test_validate_unknown_name() {
    let (tokens, _registry, _dir) = token_manager();

    let err = tokens.validate("nobody", "whatever").unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
}

#[test]
fn test_validate_expired_token() {
    let (tokens, _registry, _dir) = token_manager();
    let (token, _op) = tokens
        .issue("n2", "fp", addresses(), Duration::seconds(-1))
        .unwrap();

    let err = tokens.validate("n2", &token.secret).unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    assert!(err.to_string().contains("expired"));
}

#[test]
fn test_validate_failure_does_not_consume() {
    let (tokens, _registry, _dir) = token_manager();
    let (token, _op) = tokens
        .issue("n2", "fp", addresses(), Duration::hours(3))
        .unwrap();

    assert!(tokens.validate("n2", "bogus").is_err());

    // A retry with the right secret still works within the expiry window.
    assert!(tokens.validate("n2", &token.secret).is_ok());
}

#[test]
fn test_duplicate_issue_cancels_previous() {
    let (tokens, registry, _dir) = token_manager();

    let (first, first_op) = tokens
        .issue("n4", "fp", addresses(), Duration::hours(3))
        .unwrap();
    let (second, _op) = tokens
        .issue("n4", "fp", addresses(), Duration::hours(3))
        .unwrap();

    assert_eq!(
        registry.get(&first_op.id).unwrap().state,
        OperationState::Cancelled
    );

    // Only the second token is usable now.
    assert!(tokens.validate("n4", &first.secret).is_err());
    assert!(tokens.validate("n4", &second.secret).is_ok());
}

#[test]
fn test_consume_token() {
    let (tokens, registry, _dir) = token_manager();
    let (token, op) = tokens
        .issue("n2", "fp", addresses(), Duration::hours(3))
        .unwrap();

    tokens.consume(&op.id);

    assert_eq!(
        registry.get(&op.id).unwrap().state,
        OperationState::Cancelled
    );
    assert!(tokens.validate("n2", &token.secret).is_err());
}

#[test]
fn test_sweep_removes_expired_tokens() {
    let (tokens, registry, _dir) = token_manager();
    let (_expired, expired_op) = tokens
        .issue("old", "fp", addresses(), Duration::seconds(-1))
        .unwrap();
    let (_fresh, fresh_op) = tokens
        .issue("new", "fp", addresses(), Duration::hours(3))
        .unwrap();

    tokens.sweep_expired();

    assert!(registry.get(&expired_op.id).is_none());
    assert_eq!(
        registry.get(&fresh_op.id).unwrap().state,
        OperationState::Running
    );
}

#[test]
fn test_tokens_are_independent_per_name() {
    let (tokens, _registry, _dir) = token_manager();
    let (t2, _) = tokens
        .issue("n2", "fp", addresses(), Duration::hours(3))
        .unwrap();
    let (t3, _) = tokens
        .issue("n3", "fp", addresses(), Duration::hours(3))
        .unwrap();

    assert_ne!(t2.secret, t3.secret);
    assert!(tokens.validate("n2", &t2.secret).is_ok());
    assert!(tokens.validate("n3", &t3.secret).is_ok());
}

#[test]
fn test_token_wire_encoding() {
    let token = JoinToken {
        server_name: "n2".to_string(),
        secret: "aa".repeat(32),
        fingerprint: "fp".to_string(),
        addresses: vec!["10.0.0.1:8443".to_string()],
        expires_at: Utc::now() + Duration::hours(1),
    };

    let encoded = token.encode().unwrap();
    let decoded = JoinToken::decode(&encoded).unwrap();
    assert_eq!(decoded, token);
    assert!(!decoded.is_expired(Utc::now()));

    assert!(JoinToken::decode("not a token").is_err());
}
