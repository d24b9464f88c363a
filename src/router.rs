use crate::error::ApiError;
use crate::replicator::ClusterState;
use anyhow::Context;
use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// Grace period between answering the original client and letting the
// disable path proceed, so the response is flushed before the daemon is
// replaced.
const DISABLE_RELEASE_GRACE: Duration = Duration::from_secs(1);

pub struct Router {
    client: reqwest::Client,
    disable_mu: Arc<tokio::sync::Mutex<()>>,
}

impl Router {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            disable_mu: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    // Proxies a mutating request to another member and relays status and
    // body. Used for the endpoints that must consume the response on the
    // original connection instead of redirecting.
    pub async fn proxy(
        &self,
        target: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, serde_json::Value), ApiError> {
        let url = format!("http://{}{}", target, path);
        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach member at {}", target))
            .map_err(|e| ApiError::unavailable(format!("{:#}", e)))?;

        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);

        Ok((status, body))
    }

    // Per-member state endpoints are served by the member that owns the
    // state, not the leader.
    pub fn resolve_owner(state: &ClusterState, name: &str) -> Result<String, ApiError> {
        state
            .member_by_name(name)
            .map(|m| m.address.clone())
            .ok_or_else(|| ApiError::not_found(format!("Member {} not found", name)))
    }

    // Self-removal lock. The member about to be removed takes the guard
    // before forwarding the delete to the leader; the leader's disable
    // callback blocks on the same mutex, so the daemon cannot be replaced
    // until the original response has gone out.
    pub async fn acquire_disable_guard(&self) -> tokio::sync::OwnedMutexGuard<()> {
        info!("Acquired cluster self removal lock");
        self.disable_mu.clone().lock_owned().await
    }

    pub fn release_after_response(guard: tokio::sync::OwnedMutexGuard<()>) {
        tokio::spawn(async move {
            tokio::time::sleep(DISABLE_RELEASE_GRACE).await;
            info!("Releasing cluster self removal lock");
            drop(guard);
        });
    }

    pub async fn wait_disable_clear(&self) {
        let _ = self.disable_mu.lock().await;
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
