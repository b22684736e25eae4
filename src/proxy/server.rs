// Proxy server setup and request forwarding
//
// Reverse mode binds one listener per registered origin on a fresh local
// port; full mode binds a single forward proxy on the configured port. Both
// paths share the forwarding core: buffer the request, relay it upstream,
// inject the monitoring script into HTML responses, record a capture, and
// publish a proxy-request event. Injection happens on the response path
// before any byte reaches the client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::Router;
use chrono::Utc;
use std::collections::VecDeque;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::events::{generate_id, Event, EventKind, SYSTEM_PROCESS};
use crate::logs::urls;
use crate::telemetry::{api_router, ApiState};

use super::inject;
use super::{MappingTable, ProxyMode, ProxyRequestRecord, UrlMapping};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Forward-proxy port for full mode
    pub port: u16,
    pub mode: ProxyMode,
    pub capture_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 19888,
            mode: ProxyMode::Reverse,
            capture_capacity: 1_000,
        }
    }
}

struct ListenerHandle {
    port: u16,
    /// Origin this listener fronts; None for the full-mode listener
    origin: Option<String>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ProxyServer {
    mode: RwLock<ProxyMode>,
    full_port: u16,
    capture_capacity: usize,
    pub mappings: Arc<MappingTable>,
    captures: Mutex<VecDeque<ProxyRequestRecord>>,
    bus: Arc<EventBus>,
    client: reqwest::Client,
    api_state: ApiState,
    listeners: tokio::sync::Mutex<Vec<ListenerHandle>>,
    injection_failures: AtomicU64,
    decompression_failures: AtomicU64,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        mappings: Arc<MappingTable>,
        api_state: ApiState,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        // No decompression on the client: the proxy handles gzip itself so
        // it can re-encode exactly what the origin sent.
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .no_gzip()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Arc::new(Self {
            mode: RwLock::new(config.mode),
            full_port: config.port,
            capture_capacity: config.capture_capacity,
            mappings,
            captures: Mutex::new(VecDeque::new()),
            bus,
            client,
            api_state,
            listeners: tokio::sync::Mutex::new(Vec::new()),
            injection_failures: AtomicU64::new(0),
            decompression_failures: AtomicU64::new(0),
        }))
    }

    pub fn mode(&self) -> ProxyMode {
        *self.mode.read().unwrap()
    }

    /// Bind listeners for the current mode.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.mode() {
            ProxyMode::Full => {
                self.spawn_full_listener().await?;
            }
            ProxyMode::Reverse => {
                // Reverse listeners appear as URLs are registered; nothing
                // to bind up front.
            }
        }
        Ok(())
    }

    /// Switch modes at runtime: close existing listeners and re-register
    /// mappings under the new mode. Reverse proxy URLs are re-allocated.
    pub async fn set_mode(self: &Arc<Self>, mode: ProxyMode) -> Result<()> {
        if self.mode() == mode {
            return Ok(());
        }
        self.close_listeners().await;
        *self.mode.write().unwrap() = mode;

        match mode {
            ProxyMode::Full => {
                self.spawn_full_listener().await?;
            }
            ProxyMode::Reverse => {
                for mapping in self.mappings.all() {
                    let port = self.spawn_reverse_listener(&mapping.original_url).await?;
                    self.mappings
                        .set_proxy_url(&mapping.original_url, format!("http://localhost:{port}"));
                }
            }
        }
        tracing::info!(mode = mode.as_str(), "proxy mode switched");
        Ok(())
    }

    /// Register a URL observed in process logs. In reverse mode this binds
    /// (or reuses) a dedicated listener and returns the mapping with its
    /// local proxy URL.
    pub async fn register_url(
        self: &Arc<Self>,
        original_url: &str,
        process_id: &str,
        process_name: &str,
        label: String,
    ) -> Result<UrlMapping> {
        let mapping = UrlMapping {
            original_url: original_url.to_string(),
            proxy_url: original_url.to_string(),
            process_id: process_id.to_string(),
            process_name: process_name.to_string(),
            label,
            created_at: Utc::now(),
            superseded: false,
        };

        if self.mappings.contains(original_url) || self.mode() == ProxyMode::Full {
            // Existing listener (or no listener in full mode): upsert keeps
            // the established proxy URL.
            return Ok(self.mappings.upsert(mapping));
        }

        let port = self.spawn_reverse_listener(original_url).await?;
        let mapping = UrlMapping {
            proxy_url: format!("http://localhost:{port}"),
            ..mapping
        };
        let stored = self.mappings.upsert(mapping);
        tracing::info!(
            origin = original_url,
            proxy = %stored.proxy_url,
            process = process_name,
            "registered proxy mapping"
        );
        Ok(stored)
    }

    async fn spawn_reverse_listener(self: &Arc<Self>, origin: &str) -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind reverse listener")?;
        let port = listener.local_addr()?.port();

        let state = ReverseState {
            server: self.clone(),
            origin: origin.to_string(),
        };
        let app = api_router(self.api_state.clone()).merge(
            Router::new().fallback(reverse_handler).with_state(state),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.await.ok();
                })
                .await
            {
                tracing::error!("reverse listener error: {e}");
            }
        });

        self.listeners.lock().await.push(ListenerHandle {
            port,
            origin: Some(origin.to_string()),
            shutdown: shutdown_tx,
            task,
        });
        Ok(port)
    }

    async fn spawn_full_listener(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.full_port))
            .await
            .with_context(|| format!("Failed to bind proxy port {}", self.full_port))?;
        let port = listener.local_addr()?.port();

        let state = FullState {
            server: self.clone(),
        };
        let app = api_router(self.api_state.clone()).merge(
            Router::new().fallback(full_handler).with_state(state),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.await.ok();
                })
                .await
            {
                tracing::error!("proxy listener error: {e}");
            }
        });

        self.listeners.lock().await.push(ListenerHandle {
            port,
            origin: None,
            shutdown: shutdown_tx,
            task,
        });
        tracing::info!(port, "full proxy listening");
        Ok(())
    }

    async fn close_listeners(&self) {
        let handles: Vec<ListenerHandle> = self.listeners.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.shutdown.send(());
            let _ = handle.task.await;
            tracing::debug!(port = handle.port, origin = ?handle.origin, "listener closed");
        }
    }

    pub async fn shutdown(&self) {
        self.close_listeners().await;
    }

    pub fn captures(&self) -> Vec<ProxyRequestRecord> {
        self.captures.lock().unwrap().iter().cloned().collect()
    }

    pub fn injection_failures(&self) -> u64 {
        self.injection_failures.load(Ordering::Relaxed)
    }

    pub fn decompression_failures(&self) -> u64 {
        self.decompression_failures.load(Ordering::Relaxed)
    }

    fn record_capture(&self, record: ProxyRequestRecord) {
        {
            let mut ring = self.captures.lock().unwrap();
            if ring.len() >= self.capture_capacity {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        self.bus.publish(Event::ProxyRequest {
            id: generate_id(),
            timestamp: record.timestamp,
            process_id: record.process_id,
            method: record.method,
            url: record.url,
            status: record.status,
            duration_ms: record.duration_ms,
            injected: record.injected,
        });
    }

    /// Forward one buffered request to `target` and build the client
    /// response, injecting into HTML when the request asked for a document.
    async fn forward(
        &self,
        req: Request<Body>,
        target: String,
        process_id: String,
    ) -> Response<Body> {
        let start = Instant::now();
        let method = req.method().clone();
        let request_headers = req.headers().clone();

        let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return plain_response(StatusCode::BAD_REQUEST, format!("body read failed: {e}"))
            }
        };

        let mut upstream = self
            .client
            .request(method.clone(), &target)
            .body(body_bytes.to_vec());
        for (key, value) in request_headers.iter() {
            if is_hop_by_hop(key.as_str()) {
                continue;
            }
            upstream = upstream.header(key, value);
        }

        let response = match upstream.send().await {
            Ok(response) => response,
            Err(e) => {
                // Origin unreachable: 502 to the client, capture recorded
                tracing::warn!(url = target, "upstream request failed: {e}");
                self.record_capture(ProxyRequestRecord {
                    id: generate_id(),
                    timestamp: Utc::now(),
                    process_id,
                    method: method.to_string(),
                    url: target,
                    status: StatusCode::BAD_GATEWAY.as_u16(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    response_size: 0,
                    injected: false,
                });
                return plain_response(StatusCode::BAD_GATEWAY, format!("upstream error: {e}"));
            }
        };

        let status = response.status();
        let response_headers = response.headers().clone();
        let response_body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return plain_response(
                    StatusCode::BAD_GATEWAY,
                    format!("upstream body read failed: {e}"),
                )
            }
        };

        let is_html = response_headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.trim_start().starts_with("text/html"))
            .unwrap_or(false);
        let gzipped = response_headers
            .get("content-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|enc| enc.contains("gzip"))
            .unwrap_or(false);

        let mut injected = false;
        let body: Vec<u8> = if is_html && inject::wants_injection(&request_headers) {
            match inject::inject_html(&response_body, gzipped, inject::MONITORING_SCRIPT) {
                Ok(outcome) => {
                    injected = outcome.injected;
                    outcome.body
                }
                Err(inject::InjectError::Decode(e)) => {
                    // Serve the original bytes untouched
                    tracing::warn!(url = target, "decompression failed, skipping injection: {e}");
                    self.decompression_failures.fetch_add(1, Ordering::Relaxed);
                    response_body.to_vec()
                }
                Err(inject::InjectError::Encode(e)) => {
                    tracing::warn!(url = target, "injection failed, serving original: {e}");
                    self.injection_failures.fetch_add(1, Ordering::Relaxed);
                    response_body.to_vec()
                }
            }
        } else {
            response_body.to_vec()
        };

        let mut builder = Response::builder().status(status.as_u16());
        for (key, value) in response_headers.iter() {
            if is_hop_by_hop(key.as_str()) || key == "content-length" {
                // Content-Length is recomputed for the possibly rewritten body
                continue;
            }
            if injected && key == "content-security-policy" {
                continue;
            }
            builder = builder.header(key, value);
        }

        self.record_capture(ProxyRequestRecord {
            id: generate_id(),
            timestamp: Utc::now(),
            process_id,
            method: method.to_string(),
            url: target,
            status: status.as_u16(),
            duration_ms: start.elapsed().as_millis() as u64,
            response_size: body.len(),
            injected,
        });

        builder
            .header("content-length", body.len())
            .body(Body::from(body))
            .unwrap_or_else(|e| {
                plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("response build failed: {e}"),
                )
            })
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "host"
            | "connection"
            | "transfer-encoding"
            | "proxy-connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "upgrade"
    )
}

fn plain_response(status: StatusCode, message: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message))
        .unwrap()
}

// ── Handlers ───────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ReverseState {
    server: Arc<ProxyServer>,
    origin: String,
}

async fn reverse_handler(State(state): State<ReverseState>, req: Request<Body>) -> Response<Body> {
    let path_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let target = format!("{}{}", state.origin.trim_end_matches('/'), path_query);

    let process_id = state
        .server
        .mappings
        .get(&state.origin)
        .map(|m| m.process_id)
        .unwrap_or_else(|| SYSTEM_PROCESS.to_string());

    state.server.forward(req, target, process_id).await
}

#[derive(Clone)]
struct FullState {
    server: Arc<ProxyServer>,
}

async fn full_handler(State(state): State<FullState>, req: Request<Body>) -> Response<Body> {
    // A forward proxy receives absolute-form request URIs
    if req.uri().scheme().is_none() || req.uri().authority().is_none() {
        return plain_response(
            StatusCode::BAD_REQUEST,
            "proxy requests must use absolute URIs".to_string(),
        );
    }
    let target = req.uri().to_string();

    let process_id = state
        .server
        .mappings
        .by_original_url(&target)
        .map(|m| m.process_id)
        .unwrap_or_else(|| SYSTEM_PROCESS.to_string());

    state.server.forward(req, target, process_id).await
}

// ── URL watcher ────────────────────────────────────────────────────────────

/// True for URLs the reverse proxy should front: local development servers.
fn is_local_url(url: &str) -> bool {
    url.contains("://localhost") || url.contains("://127.0.0.1") || url.contains("://0.0.0.0")
}

/// Subscribe to log-line events and register observed local URLs. Bus
/// handlers are synchronous, so registration is bridged through a channel to
/// an async task that binds listeners.
pub fn spawn_url_watcher(server: Arc<ProxyServer>, bus: &EventBus) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<(String, String, String)>(256);

    bus.subscribe(
        EventKind::LogLine,
        Arc::new(move |event| {
            if let Event::LogLine {
                process_id,
                process_name,
                content,
                ..
            } = event
            {
                if urls::extract_urls(content).iter().any(|u| is_local_url(u)) {
                    let _ = tx.try_send((
                        process_id.clone(),
                        process_name.clone(),
                        content.clone(),
                    ));
                }
            }
        }),
    );

    tokio::spawn(async move {
        while let Some((process_id, process_name, content)) = rx.recv().await {
            let label = urls::extract_label(&content, &process_name);
            for url in urls::extract_urls(&content) {
                if !is_local_url(&url) {
                    continue;
                }
                if let Err(e) = server
                    .register_url(&url, &process_id, &process_name, label.clone())
                    .await
                {
                    tracing::warn!(url, "mapping registration failed: {e:#}");
                }
            }
        }
    })
}
