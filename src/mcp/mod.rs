// MCP endpoint - JSON-RPC 2.0 control surface over live state
//
// Tools are named invocable operations with JSON schemas; resources are
// readable documents derived from live state with change notifications.
// Both are registries of dyn handlers, so the endpoint itself knows nothing
// about supervisor/log/proxy internals. Tool failures are returned inside a
// successful JSON-RPC response (isError content), never as transport
// errors; transport errors use the standard -327xx codes.

pub mod protocol;
pub mod resources;
pub mod server;
pub mod tools;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::bus::EventBus;
use crate::events::{generate_id, Event, EventKind};
use protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestPayload, INVALID_PARAMS,
    INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "brummer";

/// Tool-level failure: reported to the client inside a successful response
/// envelope.
#[derive(Debug)]
pub struct ToolError {
    pub message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ToolError {
    fn from(e: anyhow::Error) -> Self {
        Self {
            message: format!("{e:#}"),
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A named invocable operation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object
    fn input_schema(&self) -> Value;
    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// A readable document whose content is derived from live state.
pub trait Resource: Send + Sync {
    fn uri(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn read(&self) -> Value;
    /// Event kinds whose arrival changes this resource's content
    fn invalidated_by(&self) -> &[EventKind];
}

struct SseSession {
    tx: mpsc::Sender<String>,
    client: String,
}

pub struct McpServer {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    resources: RwLock<HashMap<String, Arc<dyn Resource>>>,
    sessions: DashMap<String, SseSession>,
    /// resource uri → subscribed session ids
    subscriptions: DashMap<String, HashSet<String>>,
    bus: Arc<EventBus>,
}

impl McpServer {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            tools: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            sessions: DashMap::new(),
            subscriptions: DashMap::new(),
            bus,
        })
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.tools
            .write()
            .unwrap()
            .insert(tool.name().to_string(), tool);
    }

    pub fn register_resource(&self, resource: Arc<dyn Resource>) {
        self.resources
            .write()
            .unwrap()
            .insert(resource.uri().to_string(), resource);
    }

    /// Wire resource-change notifications: one bus subscription per event
    /// kind any registered resource cares about. Call after registration.
    pub fn start_notifier(self: &Arc<Self>) {
        let kinds: HashSet<EventKind> = self
            .resources
            .read()
            .unwrap()
            .values()
            .flat_map(|r| r.invalidated_by().iter().copied())
            .collect();

        for kind in kinds {
            let server = self.clone();
            self.bus.subscribe(
                kind,
                Arc::new(move |event| server.notify_resource_change(event.kind())),
            );
        }
    }

    fn notify_resource_change(&self, kind: EventKind) {
        let changed: Vec<String> = {
            let resources = self.resources.read().unwrap();
            resources
                .values()
                .filter(|r| r.invalidated_by().contains(&kind))
                .map(|r| r.uri().to_string())
                .collect()
        };

        for uri in changed {
            let Some(subscribers) = self.subscriptions.get(&uri).map(|s| s.clone()) else {
                continue;
            };
            let notification = JsonRpcNotification::new(
                "notifications/resources/updated",
                Some(json!({ "uri": uri })),
            );
            let payload = match serde_json::to_string(&notification) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            for session_id in subscribers {
                let dead = self
                    .sessions
                    .get(&session_id)
                    .map(|s| s.tx.try_send(payload.clone()).is_err())
                    .unwrap_or(true);
                if dead {
                    self.drop_session(&session_id);
                }
            }
        }
    }

    /// Open an SSE session. Emits mcp-connected.
    pub fn open_session(&self, session_id: String, client: String) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(64);
        self.sessions.insert(
            session_id.clone(),
            SseSession {
                tx,
                client: client.clone(),
            },
        );
        self.bus.publish(Event::McpConnected {
            id: generate_id(),
            timestamp: Utc::now(),
            session_id,
            client,
        });
        rx
    }

    /// Remove a session and its subscriptions. Emits mcp-disconnected.
    pub fn drop_session(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        for mut entry in self.subscriptions.iter_mut() {
            entry.value_mut().remove(session_id);
        }
        self.bus.publish(Event::McpDisconnected {
            id: generate_id(),
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            client: session.client,
        });
    }

    /// Handle a raw POST body: single request or batch. None means nothing
    /// to send back (all notifications).
    pub async fn handle_body(&self, body: &[u8], session_id: Option<&str>) -> Option<Value> {
        let payload: RequestPayload = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                let response = JsonRpcResponse::failure(
                    Value::Null,
                    PARSE_ERROR,
                    format!("parse error: {e}"),
                );
                return serde_json::to_value(response).ok();
            }
        };

        match payload {
            RequestPayload::Single(request) => {
                let response = self.dispatch(request, session_id).await?;
                serde_json::to_value(response).ok()
            }
            RequestPayload::Batch(requests) => {
                if requests.is_empty() {
                    let response = JsonRpcResponse::failure(
                        Value::Null,
                        INVALID_REQUEST,
                        "empty batch",
                    );
                    return serde_json::to_value(response).ok();
                }
                let mut responses = Vec::new();
                for request in requests {
                    if let Some(response) = self.dispatch(request, session_id).await {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    None
                } else {
                    serde_json::to_value(responses).ok()
                }
            }
        }
    }

    /// Dispatch one request. Notifications return None. Every call emits an
    /// mcp-activity event with the method, params and elapsed time.
    pub async fn dispatch(
        &self,
        request: JsonRpcRequest,
        session_id: Option<&str>,
    ) -> Option<JsonRpcResponse> {
        let start = Instant::now();
        let method = request.method.clone();
        let params = request.params.clone();
        let id = request.id.clone();

        let response = self.dispatch_inner(request, session_id).await;

        let summary = match &response {
            Some(r) if r.is_success() => Some("ok".to_string()),
            Some(r) => r.error.as_ref().map(|e| e.message.clone()),
            None => None,
        };
        self.bus.publish(Event::McpActivity {
            id: generate_id(),
            timestamp: Utc::now(),
            method,
            params,
            response: summary,
            elapsed_ms: start.elapsed().as_millis() as u64,
        });

        // Notifications are processed but never answered
        match id {
            Some(_) => response,
            None => None,
        }
    }

    async fn dispatch_inner(
        &self,
        request: JsonRpcRequest,
        session_id: Option<&str>,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone().unwrap_or(Value::Null);

        if !request.is_valid() {
            return Some(JsonRpcResponse::failure(
                id,
                INVALID_REQUEST,
                "invalid JSON-RPC 2.0 envelope",
            ));
        }

        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": {},
                    "resources": { "subscribe": true },
                },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => return Some(self.call_tool(id, request.params).await),
            "resources/list" => Ok(self.list_resources()),
            "resources/read" => self.read_resource(request.params),
            "resources/subscribe" => self.subscribe(request.params, session_id),
            "resources/unsubscribe" => self.unsubscribe(request.params, session_id),
            method if method.starts_with("notifications/") => {
                // Client lifecycle notifications need no handling
                return None;
            }
            other => {
                return Some(JsonRpcResponse::failure(
                    id,
                    METHOD_NOT_FOUND,
                    format!("unknown method '{other}'"),
                ));
            }
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err((code, message)) => JsonRpcResponse::failure(id, code, message),
        })
    }

    fn list_tools(&self) -> Value {
        let tools = self.tools.read().unwrap();
        let mut list: Vec<Value> = tools
            .values()
            .map(|t| {
                json!({
                    "name": t.name(),
                    "description": t.description(),
                    "inputSchema": t.input_schema(),
                })
            })
            .collect();
        list.sort_by_key(|t| t["name"].as_str().unwrap_or_default().to_string());
        json!({ "tools": list })
    }

    async fn call_tool(&self, id: Value, params: Option<Value>) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::failure(id, INVALID_PARAMS, "missing params");
        };
        let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
            return JsonRpcResponse::failure(id, INVALID_PARAMS, "missing tool name");
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let tool = {
            let tools = self.tools.read().unwrap();
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return JsonRpcResponse::failure(
                id,
                INVALID_PARAMS,
                format!("unknown tool '{name}'"),
            );
        };

        match tool.call(arguments).await {
            Ok(value) => {
                let text = match &value {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string_pretty(other).unwrap_or_default(),
                };
                JsonRpcResponse::success(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }],
                        "isError": false,
                    }),
                )
            }
            // The tool failed, the transport did not: success envelope
            Err(e) => JsonRpcResponse::success(
                id,
                json!({
                    "content": [{ "type": "text", "text": e.message }],
                    "isError": true,
                }),
            ),
        }
    }

    fn list_resources(&self) -> Value {
        let resources = self.resources.read().unwrap();
        let mut list: Vec<Value> = resources
            .values()
            .map(|r| {
                json!({
                    "uri": r.uri(),
                    "name": r.name(),
                    "description": r.description(),
                    "mimeType": "application/json",
                })
            })
            .collect();
        list.sort_by_key(|r| r["uri"].as_str().unwrap_or_default().to_string());
        json!({ "resources": list })
    }

    fn read_resource(&self, params: Option<Value>) -> Result<Value, (i64, String)> {
        let uri = params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(|v| v.as_str())
            .ok_or((INVALID_PARAMS, "missing uri".to_string()))?;

        let resource = {
            let resources = self.resources.read().unwrap();
            resources.get(uri).cloned()
        };
        let resource =
            resource.ok_or((INVALID_PARAMS, format!("unknown resource '{uri}'")))?;

        let text = serde_json::to_string_pretty(&resource.read()).unwrap_or_default();
        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": text,
            }]
        }))
    }

    fn subscribe(
        &self,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value, (i64, String)> {
        let uri = params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(|v| v.as_str())
            .ok_or((INVALID_PARAMS, "missing uri".to_string()))?;
        let session_id = session_id.ok_or((
            INVALID_REQUEST,
            "subscriptions require an SSE session (Mcp-Session-Id)".to_string(),
        ))?;

        let known = self.resources.read().unwrap().contains_key(uri);
        if !known {
            return Err((INVALID_PARAMS, format!("unknown resource '{uri}'")));
        }

        self.subscriptions
            .entry(uri.to_string())
            .or_default()
            .insert(session_id.to_string());
        Ok(json!({}))
    }

    fn unsubscribe(
        &self,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value, (i64, String)> {
        let uri = params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(|v| v.as_str())
            .ok_or((INVALID_PARAMS, "missing uri".to_string()))?;
        if let (Some(session_id), Some(mut entry)) =
            (session_id, self.subscriptions.get_mut(uri))
        {
            entry.remove(session_id);
        }
        Ok(json!({}))
    }

}
