// Stdio JSON-RPC server for the hub
//
// One JSON-RPC request per line on stdin, one response per line on stdout.
// The hub's own tools (instances_list, instances_connect) are served
// locally; everything else is forwarded to the session's selected instance.
// A stdio transport carries exactly one client, so the session id is fixed.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::mcp::protocol::{
    JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
    PARSE_ERROR,
};

use super::{HubError, HubRouter};

/// The single stdio client session.
const STDIO_SESSION: &str = "stdio";

/// Run the hub over stdin/stdout until EOF.
pub async fn run(hub: Arc<HubRouter>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    tracing::info!("hub serving JSON-RPC over stdio");
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handle_line(&hub, &line).await {
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    hub.disconnect_session(STDIO_SESSION);
    tracing::info!("stdin closed, hub shutting down");
    Ok(())
}

/// Handle one request line. None for notifications.
pub async fn handle_line(hub: &HubRouter, line: &str) -> Option<String> {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            let response = JsonRpcResponse::failure(
                Value::Null,
                PARSE_ERROR,
                format!("parse error: {e}"),
            );
            return serde_json::to_string(&response).ok();
        }
    };

    let is_notification = request.is_notification();
    let response = dispatch(hub, request).await;
    if is_notification {
        return None;
    }
    serde_json::to_string(&response).ok()
}

async fn dispatch(hub: &HubRouter, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone().unwrap_or(Value::Null);

    match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": crate::mcp::PROTOCOL_VERSION,
                "serverInfo": {
                    "name": "brummer-hub",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": { "tools": {} },
            }),
        ),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => JsonRpcResponse::success(id, hub_tools()),
        "tools/call" => {
            let name = request
                .params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            match name.as_str() {
                "instances_list" => instances_list(hub, id),
                "instances_connect" => instances_connect(hub, id, request.params.as_ref()),
                // Everything else belongs to the selected instance
                _ => forward(hub, id, &request).await,
            }
        }
        method if method.starts_with("notifications/") => {
            JsonRpcResponse::success(id, json!({}))
        }
        // Non-tool methods (resources etc.) are forwarded wholesale
        _ => forward(hub, id, &request).await,
    }
}

fn hub_tools() -> Value {
    json!({
        "tools": [
            {
                "name": "instances_list",
                "description": "List running brummer instances from the discovery directory",
                "inputSchema": { "type": "object", "properties": {} },
            },
            {
                "name": "instances_connect",
                "description": "Select the instance this session's tool calls are routed to",
                "inputSchema": {
                    "type": "object",
                    "properties": { "instanceId": { "type": "string" } },
                    "required": ["instanceId"],
                },
            },
        ],
        "note": "other tools are served by the connected instance",
    })
}

fn instances_list(hub: &HubRouter, id: Value) -> JsonRpcResponse {
    let instances = hub.list_instances();
    let text = serde_json::to_string_pretty(&instances).unwrap_or_default();
    JsonRpcResponse::success(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": false,
        }),
    )
}

fn instances_connect(hub: &HubRouter, id: Value, params: Option<&Value>) -> JsonRpcResponse {
    let instance_id = params
        .and_then(|p| p.get("arguments"))
        .and_then(|a| a.get("instanceId"))
        .and_then(|v| v.as_str());
    let Some(instance_id) = instance_id else {
        return JsonRpcResponse::failure(id, INVALID_PARAMS, "instanceId argument required");
    };

    match hub.connect(STDIO_SESSION, instance_id) {
        Ok(instance) => JsonRpcResponse::success(
            id,
            json!({
                "content": [{
                    "type": "text",
                    "text": format!(
                        "connected to {} ({})",
                        instance.instance_id,
                        instance.project_path.display()
                    ),
                }],
                "isError": false,
            }),
        ),
        Err(e) => hub_error_response(id, e),
    }
}

async fn forward(hub: &HubRouter, id: Value, request: &JsonRpcRequest) -> JsonRpcResponse {
    match hub.forward(STDIO_SESSION, request).await {
        Ok(response) => response,
        Err(e) => hub_error_response(id, e),
    }
}

/// Routing failures are machine-readable: a code plus the instance id in the
/// error data where one is involved.
fn hub_error_response(id: Value, error: HubError) -> JsonRpcResponse {
    let (code, data) = match &error {
        HubError::NoInstanceSelected => (METHOD_NOT_FOUND, None),
        HubError::UnknownInstance(instance) | HubError::Unhealthy(instance) => {
            (INTERNAL_ERROR, Some(json!({ "instanceId": instance })))
        }
        HubError::Transport(_) => (INTERNAL_ERROR, None),
    };
    let mut response = JsonRpcResponse::failure(id, code, error.to_string());
    if let Some(data) = data {
        if let Some(err) = response.error.as_mut() {
            err.data = Some(data);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Discovery;

    fn hub() -> Arc<HubRouter> {
        let dir = tempfile::tempdir().unwrap();
        // Leak the tempdir so the discovery directory outlives the test body
        let path = dir.into_path();
        HubRouter::new(Arc::new(Discovery::new(path)))
    }

    #[tokio::test]
    async fn test_initialize_over_stdio() {
        let hub = hub();
        let response = handle_line(
            &hub,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "initialize"}"#,
        )
        .await
        .unwrap();
        assert!(response.contains("brummer-hub"));
    }

    #[tokio::test]
    async fn test_parse_error_response() {
        let hub = hub();
        let response = handle_line(&hub, "{bad json").await.unwrap();
        assert!(response.contains("-32700"));
    }

    #[tokio::test]
    async fn test_instances_list_empty() {
        let hub = hub();
        let response = handle_line(
            &hub,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "instances_list", "arguments": {}}}"#,
        )
        .await
        .unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["result"]["isError"], false);
    }

    #[tokio::test]
    async fn test_forward_without_selection_is_typed_error() {
        let hub = hub();
        let response = handle_line(
            &hub,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "scripts_status", "arguments": {}}}"#,
        )
        .await
        .unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["error"]["code"], METHOD_NOT_FOUND);
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("no instance selected"));
    }

    #[tokio::test]
    async fn test_connect_unknown_instance_names_it() {
        let hub = hub();
        let response = handle_line(
            &hub,
            r#"{"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "instances_connect", "arguments": {"instanceId": "ghost"}}}"#,
        )
        .await
        .unwrap();
        let value: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["error"]["data"]["instanceId"], "ghost");
    }

    #[tokio::test]
    async fn test_notification_line_gets_no_response() {
        let hub = hub();
        let response = handle_line(
            &hub,
            r#"{"jsonrpc": "2.0", "method": "notifications/initialized"}"#,
        )
        .await;
        assert!(response.is_none());
    }
}
