// Hub router - multiplexes stdio JSON-RPC clients across instances
//
// The hub discovers running instances through the discovery directory and
// proxies tool calls to whichever instance a client session selected.
// Selection is explicit (instances_connect); calls without a selection fail
// with a typed error, and calls to an instance that went stale fail with an
// error naming the instance so the client can re-select.

pub mod client;
pub mod stdio;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::discovery::{Discovery, Instance};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use client::InstanceClient;

/// Health check interval.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Forwarded-call timeout.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HubError {
    #[error("no instance selected for this session")]
    NoInstanceSelected,
    #[error("unknown instance '{0}'")]
    UnknownInstance(String),
    #[error("instance '{0}' is unhealthy")]
    Unhealthy(String),
    #[error("transport error: {0}")]
    Transport(String),
}

pub struct HubRouter {
    discovery: Arc<Discovery>,
    connections: DashMap<String, Arc<InstanceClient>>,
    /// client session id → selected instance id
    sessions: DashMap<String, String>,
}

impl HubRouter {
    pub fn new(discovery: Arc<Discovery>) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            connections: DashMap::new(),
            sessions: DashMap::new(),
        })
    }

    /// Live instances from the discovery directory.
    pub fn list_instances(&self) -> Vec<Instance> {
        self.discovery.list()
    }

    /// Bind a client session to an instance. The instance must be live.
    pub fn connect(&self, session_id: &str, instance_id: &str) -> Result<Instance, HubError> {
        let instance = self
            .discovery
            .find(instance_id)
            .ok_or_else(|| HubError::UnknownInstance(instance_id.to_string()))?;

        // Lazy connection: created on first selection, reused afterwards
        self.connections
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                Arc::new(InstanceClient::new(instance_id.to_string(), instance.port))
            });
        self.sessions
            .insert(session_id.to_string(), instance_id.to_string());
        tracing::info!(session = session_id, instance = instance_id, "session bound");
        Ok(instance)
    }

    /// Forward a request to the session's selected instance.
    pub async fn forward(
        &self,
        session_id: &str,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, HubError> {
        let instance_id = self
            .sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or(HubError::NoInstanceSelected)?;

        // Freshness gate: a stale discovery file means the instance is gone
        // even if a connection object exists.
        if self.discovery.find(&instance_id).is_none() {
            return Err(HubError::Unhealthy(instance_id));
        }

        let connection = self
            .connections
            .get(&instance_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| HubError::UnknownInstance(instance_id.clone()))?;

        connection.call(request, CALL_TIMEOUT).await
    }

    /// Drop a client session's selection.
    pub fn disconnect_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Periodic health check over all known connections.
    pub fn spawn_health_checker(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let connections: Vec<Arc<InstanceClient>> =
                            hub.connections.iter().map(|c| c.clone()).collect();
                        for connection in connections {
                            let alive = hub.discovery.find(&connection.instance_id).is_some()
                                && connection.health_check().await;
                            if !alive {
                                tracing::debug!(
                                    instance = %connection.instance_id,
                                    "health check failed"
                                );
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
