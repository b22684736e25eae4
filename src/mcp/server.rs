// MCP HTTP transport
//
// One axum router serves /mcp three ways:
//   POST + Accept: application/json   → single request or batch, sync reply
//   GET  + Accept: text/event-stream  → server→client SSE stream
//   POST + Accept: text/event-stream  → request answered over a short SSE
// The SSE session id travels in the Mcp-Session-Id header; the same router
// also hosts the /api telemetry endpoints.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::telemetry::{api_router, ApiState};

use super::McpServer;

/// Header carrying the SSE session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// SSE keepalive interval.
pub const KEEPALIVE: Duration = Duration::from_secs(20);

#[derive(Clone)]
struct McpHttpState {
    server: Arc<McpServer>,
}

/// Build the endpoint router: /mcp plus the /api telemetry surface.
pub fn router(server: Arc<McpServer>, api_state: ApiState) -> Router {
    api_router(api_state).merge(
        Router::new()
            .route("/mcp", get(mcp_get).post(mcp_post))
            .with_state(McpHttpState { server }),
    )
}

/// Bind and serve. Returns the bound port (useful with port 0 in tests) and
/// the serving task.
pub async fn run(
    app: Router,
    port: u16,
    shutdown_rx: oneshot::Receiver<()>,
) -> Result<(u16, JoinHandle<()>)> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind MCP port {port}"))?;
    let bound = listener.local_addr()?.port();

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_rx.await.ok();
            })
            .await
        {
            tracing::error!("MCP server error: {e}");
        }
    });
    tracing::info!(port = bound, "MCP endpoint listening on /mcp");
    Ok((bound, task))
}

fn accepts_sse(headers: &HeaderMap) -> bool {
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

fn client_name(headers: &HeaderMap) -> String {
    headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.split('/').next().unwrap_or(ua).trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Session stream: relays queued notifications and tears the session down
/// (mcp-disconnected) when the client goes away.
struct SessionStream {
    inner: ReceiverStream<String>,
    server: Arc<McpServer>,
    session_id: String,
}

impl Stream for SessionStream {
    type Item = Result<SseEvent, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|item| item.map(|data| Ok(SseEvent::default().event("message").data(data))))
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.server.drop_session(&self.session_id);
    }
}

async fn mcp_get(State(state): State<McpHttpState>, headers: HeaderMap) -> Response {
    if !accepts_sse(&headers) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "GET /mcp requires Accept: text/event-stream",
        )
            .into_response();
    }

    // Resume with the client-provided id or mint a fresh session
    let session_id =
        session_header(&headers).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let rx = state
        .server
        .open_session(session_id.clone(), client_name(&headers));

    let stream = SessionStream {
        inner: ReceiverStream::new(rx),
        server: state.server.clone(),
        session_id: session_id.clone(),
    };
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE)
            .text("keepalive"),
    );

    ([(SESSION_HEADER, session_id)], sse).into_response()
}

async fn mcp_post(
    State(state): State<McpHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session_id = session_header(&headers);
    let response = state
        .server
        .handle_body(&body, session_id.as_deref())
        .await;

    if accepts_sse(&headers) {
        // Streamed reply: the response (when any) as one SSE message
        let events: Vec<Result<SseEvent, Infallible>> = response
            .into_iter()
            .filter_map(|value| serde_json::to_string(&value).ok())
            .map(|data| Ok(SseEvent::default().event("message").data(data)))
            .collect();
        return Sse::new(tokio_stream::iter(events)).into_response();
    }

    match response {
        Some(value) => Json(value).into_response(),
        // All notifications: acknowledged without a body
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::logs::{LogStore, LogStoreConfig};
    use crate::repl::ReplGateway;
    use crate::telemetry::{NoProcessResolver, TelemetryCollector, TelemetryConfig};

    async fn endpoint() -> (String, oneshot::Sender<()>) {
        let bus = Arc::new(EventBus::with_workers(2));
        let server = McpServer::new(bus.clone());
        let api_state = ApiState {
            collector: Arc::new(TelemetryCollector::new(
                TelemetryConfig::default(),
                bus.clone(),
            )),
            repl: Arc::new(ReplGateway::new()),
            store: Arc::new(LogStore::new(LogStoreConfig::default(), bus.clone())),
            resolver: Arc::new(NoProcessResolver),
            scripts: Arc::new(crate::scripts::ScriptsLibrary::new(
                std::env::temp_dir(),
                std::time::Duration::from_secs(5),
            )),
        };
        let app = router(server, api_state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (port, _task) = run(app, 0, shutdown_rx).await.unwrap();
        (format!("http://127.0.0.1:{port}"), shutdown_tx)
    }

    #[tokio::test]
    async fn test_post_initialize() {
        let (base, _shutdown) = endpoint().await;
        let response: serde_json::Value = reqwest::Client::new()
            .post(format!("{base}/mcp"))
            .header("accept", "application/json")
            .json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["result"]["serverInfo"]["name"], "brummer");
    }

    #[tokio::test]
    async fn test_post_batch() {
        let (base, _shutdown) = endpoint().await;
        let response: serde_json::Value = reqwest::Client::new()
            .post(format!("{base}/mcp"))
            .json(&serde_json::json!([
                {"jsonrpc": "2.0", "id": 1, "method": "ping"},
                {"jsonrpc": "2.0", "id": 2, "method": "resources/list"}
            ]))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_notification_only_post_returns_202() {
        let (base, _shutdown) = endpoint().await;
        let status = reqwest::Client::new()
            .post(format!("{base}/mcp"))
            .json(&serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status.as_u16(), 202);
    }

    #[tokio::test]
    async fn test_get_without_sse_accept_rejected() {
        let (base, _shutdown) = endpoint().await;
        let status = reqwest::Client::new()
            .get(format!("{base}/mcp"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status.as_u16(), 406);
    }

    #[tokio::test]
    async fn test_get_sse_assigns_session_header() {
        let (base, _shutdown) = endpoint().await;
        let response = reqwest::Client::new()
            .get(format!("{base}/mcp"))
            .header("accept", "text/event-stream")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert!(response.headers().get(SESSION_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_post_with_sse_accept_streams_response() {
        let (base, _shutdown) = endpoint().await;
        let body = reqwest::Client::new()
            .post(format!("{base}/mcp"))
            .header("accept", "text/event-stream")
            .json(&serde_json::json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("data:"));
        assert!(body.contains("\"id\":9"));
    }
}
