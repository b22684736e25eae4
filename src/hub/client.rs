// Hub-side connection to one instance's JSON-RPC endpoint
//
// Connections are created lazily and survive transient failures with
// exponential backoff: after a transport error the connection is unhealthy
// and refuses calls until its retry window elapses, doubling the window on
// every consecutive failure (capped at 30s).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};

use super::HubError;

/// Initial retry window after a failure.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Retry window cap.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Health-check request timeout.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

struct Backoff {
    healthy: bool,
    current: Duration,
    retry_at: Option<Instant>,
}

pub struct InstanceClient {
    pub instance_id: String,
    base_url: String,
    client: reqwest::Client,
    backoff: Mutex<Backoff>,
}

impl InstanceClient {
    pub fn new(instance_id: String, port: u16) -> Self {
        Self {
            instance_id,
            base_url: format!("http://127.0.0.1:{port}/mcp"),
            client: reqwest::Client::new(),
            backoff: Mutex::new(Backoff {
                healthy: true,
                current: BACKOFF_INITIAL,
                retry_at: None,
            }),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.backoff.lock().unwrap().healthy
    }

    /// Whether a call may be attempted now (healthy, or the retry window
    /// has elapsed).
    fn may_attempt(&self) -> bool {
        let backoff = self.backoff.lock().unwrap();
        if backoff.healthy {
            return true;
        }
        backoff
            .retry_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(true)
    }

    fn mark_success(&self) {
        let mut backoff = self.backoff.lock().unwrap();
        backoff.healthy = true;
        backoff.current = BACKOFF_INITIAL;
        backoff.retry_at = None;
    }

    fn mark_failure(&self) {
        let mut backoff = self.backoff.lock().unwrap();
        backoff.healthy = false;
        backoff.retry_at = Some(Instant::now() + backoff.current);
        backoff.current = (backoff.current * 2).min(BACKOFF_MAX);
    }

    /// Forward one request over HTTP JSON-RPC.
    pub async fn call(
        &self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, HubError> {
        if !self.may_attempt() {
            return Err(HubError::Unhealthy(self.instance_id.clone()));
        }

        let result = self
            .client
            .post(&self.base_url)
            .header("accept", "application/json")
            .timeout(timeout)
            .json(request)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.mark_failure();
                tracing::warn!(instance = %self.instance_id, "instance call failed: {e}");
                return Err(HubError::Unhealthy(self.instance_id.clone()));
            }
        };

        match response.json::<JsonRpcResponse>().await {
            Ok(parsed) => {
                self.mark_success();
                Ok(parsed)
            }
            Err(e) => {
                self.mark_failure();
                Err(HubError::Transport(format!(
                    "instance '{}' returned an unparsable response: {e}",
                    self.instance_id
                )))
            }
        }
    }

    /// Ping with the health-check timeout. Updates the backoff state.
    pub async fn health_check(&self) -> bool {
        let ping = JsonRpcRequest::new(serde_json::json!("health"), "ping", None);
        self.call(&ping, HEALTH_TIMEOUT).await.is_ok()
    }
}
