// Repl gateway - dispatches JavaScript to an injected browser session
//
// The injected monitoring script long-polls `/api/repl/poll` for queued
// commands and posts evaluation results to `/api/repl/result`. `execute`
// bridges the two: it queues a command on the session's control channel and
// parks the caller on a oneshot until the browser answers or the deadline
// expires.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

/// Code queued for one browser session.
#[derive(Debug, Clone, Serialize)]
pub struct ReplCommand {
    pub id: String,
    pub code: String,
}

/// Evaluation result posted back by the browser agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplResult {
    pub id: String,
    pub ok: bool,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum ReplError {
    #[error("no active telemetry session")]
    NoSession,
    #[error("browser did not answer within {0:?}")]
    Timeout(Duration),
}

struct SessionChannel {
    queue: Mutex<VecDeque<ReplCommand>>,
    notify: Notify,
}

/// Control-channel hub keyed by telemetry session id.
pub struct ReplGateway {
    channels: DashMap<String, Arc<SessionChannel>>,
    waiters: DashMap<String, oneshot::Sender<ReplResult>>,
}

impl ReplGateway {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            waiters: DashMap::new(),
        }
    }

    fn channel(&self, session_id: &str) -> Arc<SessionChannel> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionChannel {
                    queue: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }

    /// Queue `code` for the session and wait for the browser's answer.
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        deadline: Duration,
    ) -> Result<ReplResult, ReplError> {
        let command_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(command_id.clone(), tx);

        let channel = self.channel(session_id);
        channel.queue.lock().unwrap().push_back(ReplCommand {
            id: command_id.clone(),
            code: code.to_string(),
        });
        channel.notify.notify_one();

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => Ok(result),
            _ => {
                self.waiters.remove(&command_id);
                Err(ReplError::Timeout(deadline))
            }
        }
    }

    /// Long-poll the next command for a session. Returns None when nothing
    /// arrives within `wait`.
    pub async fn poll(&self, session_id: &str, wait: Duration) -> Option<ReplCommand> {
        let channel = self.channel(session_id);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(command) = channel.queue.lock().unwrap().pop_front() {
                return Some(command);
            }
            let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
            if tokio::time::timeout(remaining, channel.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Route a browser result to the waiting `execute` call. Returns false
    /// for unknown (expired) command ids.
    pub fn resolve(&self, result: ReplResult) -> bool {
        match self.waiters.remove(&result.id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop a session's control channel (telemetry eviction).
    pub fn drop_session(&self, session_id: &str) {
        self.channels.remove(session_id);
    }
}

impl Default for ReplGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_roundtrip() {
        let gateway = Arc::new(ReplGateway::new());

        let browser = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                let command = gateway
                    .poll("s1", Duration::from_secs(2))
                    .await
                    .expect("command should arrive");
                assert_eq!(command.code, "1+1");
                gateway.resolve(ReplResult {
                    id: command.id,
                    ok: true,
                    value: "2".to_string(),
                });
            })
        };

        let result = gateway
            .execute("s1", "1+1", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.value, "2");
        browser.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_times_out_without_browser() {
        let gateway = ReplGateway::new();
        let result = gateway
            .execute("ghost", "1+1", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(ReplError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_poll_times_out_when_idle() {
        let gateway = ReplGateway::new();
        assert!(gateway.poll("s1", Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_unknown_command() {
        let gateway = ReplGateway::new();
        assert!(!gateway.resolve(ReplResult {
            id: "nope".to_string(),
            ok: true,
            value: String::new(),
        }));
    }
}
