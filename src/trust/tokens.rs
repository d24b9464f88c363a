use crate::error::ApiError;
use crate::operations::{Operation, OperationClass, OperationRegistry};
use crate::types::JoinToken;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

pub const JOIN_SECRET_BYTES: usize = 32;

pub struct TokenManager {
    registry: OperationRegistry,
    // Serializes issuance so two concurrent requests for the same server
    // name cannot both end up with a running token.
    issue_mu: Mutex<()>,
}

impl TokenManager {
    pub fn new(registry: OperationRegistry) -> Self {
        Self {
            registry,
            issue_mu: Mutex::new(()),
        }
    }

    pub fn issue(
        &self,
        server_name: &str,
        fingerprint: &str,
        addresses: Vec<String>,
        expiry: Duration,
    ) -> Result<(JoinToken, Operation), ApiError> {
        if addresses.is_empty() {
            return Err(ApiError::unavailable("There are no online cluster members"));
        }

        let _guard = self.issue_mu.lock().unwrap();

        // A fresh token replaces any running one for the same name, so at
        // most one join credential per prospective member is live and it
        // carries the most recent address list.
        for op in self.registry.running_by_class(OperationClass::Token) {
            if op.metadata_str("serverName") == Some(server_name) {
                warn!(
                    "Cancelling duplicate join token operation {} for {}",
                    op.id, server_name
                );
                self.registry.cancel(&op.id);
            }
        }

        let mut secret_bytes = [0u8; JOIN_SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = hex::encode(secret_bytes);

        let expires_at = Utc::now() + expiry;
        let token = JoinToken {
            server_name: server_name.to_string(),
            secret,
            fingerprint: fingerprint.to_string(),
            addresses,
            expires_at,
        };

        let mut metadata = HashMap::new();
        metadata.insert(
            "serverName".to_string(),
            serde_json::json!(token.server_name),
        );
        metadata.insert("secret".to_string(), serde_json::json!(token.secret));
        metadata.insert(
            "fingerprint".to_string(),
            serde_json::json!(token.fingerprint),
        );
        metadata.insert("addresses".to_string(), serde_json::json!(token.addresses));
        metadata.insert("expiresAt".to_string(), serde_json::json!(token.expires_at));

        let op = self.registry.create(
            OperationClass::Token,
            &format!("Join token for {}", server_name),
            metadata,
        );

        info!("Issued join token for {} (operation {})", server_name, op.id);
        Ok((token, op))
    }

    // Checks a presented (name, secret) pair against the running token
    // operations. Failures leave the token untouched so the joiner can retry
    // within the expiry window.
    pub fn validate(&self, server_name: &str, secret: &str) -> Result<Operation, ApiError> {
        let now = Utc::now();

        for op in self.registry.running_by_class(OperationClass::Token) {
            if op.metadata_str("serverName") != Some(server_name) {
                continue;
            }

            let expires_at = op
                .metadata
                .get("expiresAt")
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());
            if let Some(expires_at) = expires_at {
                if now > expires_at {
                    return Err(ApiError::unauthorized("Join token has expired"));
                }
            }

            if op.metadata_str("secret") != Some(secret) {
                return Err(ApiError::unauthorized("Join token secret mismatch"));
            }

            return Ok(op);
        }

        Err(ApiError::unauthorized(format!(
            "No join token issued for {}",
            server_name
        )))
    }

    // The token is one-shot: consumed on use, whether or not the join that
    // presented it goes on to succeed.
    pub fn consume(&self, op_id: &str) {
        self.registry.cancel(op_id);
    }

    // Periodic sweep removing expired token operations.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        for op in self.registry.running_by_class(OperationClass::Token) {
            let expired = op
                .metadata
                .get("expiresAt")
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
                .map(|t| now > t)
                .unwrap_or(true);

            if expired {
                info!("Removing expired join token operation {}", op.id);
                self.registry.cancel(&op.id);
                self.registry.remove(&op.id);
            }
        }
    }
}
