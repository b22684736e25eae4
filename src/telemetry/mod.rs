// Telemetry collector - browser sessions built from injected-script batches
//
// The injected monitoring script posts batched events to /api/telemetry on
// whatever origin served the page. Sessions are keyed by the script-assigned
// session id, sharded in a concurrent map, and bounded two ways: a TTL sweep
// for idle sessions and an LRU cap on the session count. When the page URL
// matches an active proxy mapping, the session is bound to the originating
// process.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::EventBus;
use crate::events::{generate_id, Event};
use crate::logs::LogStore;
use crate::repl::{ReplGateway, ReplResult};
use crate::scripts::ScriptsLibrary;

/// Resolves a page URL to the process that owns it, via the active proxy
/// mappings. Implemented by the proxy's mapping table.
pub trait ProcessResolver: Send + Sync {
    fn resolve_process(&self, page_url: &str) -> Option<String>;
}

/// Resolver used when the proxy is disabled: binds nothing.
pub struct NoProcessResolver;

impl ProcessResolver for NoProcessResolver {
    fn resolve_process(&self, _page_url: &str) -> Option<String> {
        None
    }
}

/// One event inside a telemetry batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Epoch milliseconds assigned by the browser
    pub timestamp: i64,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Wire shape of a POST /api/telemetry body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryBatch {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub url: String,
    #[serde(default)]
    pub events: Vec<BrowserEvent>,
    #[serde(default)]
    pub metrics: Option<Value>,
    #[serde(default)]
    pub memory: Option<Value>,
}

/// Aggregated state for one browser page load.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySession {
    pub session_id: String,
    pub url: String,
    /// Originating process inferred from the URL mapping at session start
    pub process_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub console_counts: HashMap<String, u64>,
    pub error_count: u64,
    pub interaction_count: u64,
    pub event_count: u64,
    pub metrics: Option<Value>,
    pub memory: Option<Value>,
    /// Bounded ring of recent events
    pub events: VecDeque<BrowserEvent>,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Idle sessions older than this are evicted
    pub session_ttl: Duration,
    pub max_sessions: usize,
    pub event_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(30 * 60),
            max_sessions: 100,
            event_capacity: 500,
        }
    }
}

pub struct TelemetryCollector {
    sessions: DashMap<String, TelemetrySession>,
    config: TelemetryConfig,
    bus: Arc<EventBus>,
}

impl TelemetryCollector {
    pub fn new(config: TelemetryConfig, bus: Arc<EventBus>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            bus,
        }
    }

    /// Ingest one batch. `resolver` supplies the process binding for new
    /// sessions; existing sessions keep their original binding.
    pub fn ingest(&self, batch: TelemetryBatch, resolver: &dyn ProcessResolver) {
        let now = Utc::now();
        let event_count = batch.events.len();

        let process_id = {
            let mut session = self
                .sessions
                .entry(batch.session_id.clone())
                .or_insert_with(|| TelemetrySession {
                    session_id: batch.session_id.clone(),
                    url: batch.url.clone(),
                    process_id: resolver.resolve_process(&batch.url),
                    started_at: now,
                    last_activity: now,
                    console_counts: HashMap::new(),
                    error_count: 0,
                    interaction_count: 0,
                    event_count: 0,
                    metrics: None,
                    memory: None,
                    events: VecDeque::new(),
                });

            session.last_activity = now;
            session.url = batch.url.clone();
            if batch.metrics.is_some() {
                session.metrics = batch.metrics.clone();
            }
            if batch.memory.is_some() {
                session.memory = batch.memory.clone();
            }

            for event in &batch.events {
                session.event_count += 1;
                match event.event_type.as_str() {
                    "console" => {
                        let level = event
                            .fields
                            .get("level")
                            .and_then(|v| v.as_str())
                            .unwrap_or("log")
                            .to_string();
                        *session.console_counts.entry(level).or_insert(0) += 1;
                    }
                    "error" => session.error_count += 1,
                    "interaction" => session.interaction_count += 1,
                    _ => {}
                }
                if session.events.len() >= self.config.event_capacity {
                    session.events.pop_front();
                }
                session.events.push_back(event.clone());
            }

            session.process_id.clone()
        };

        self.enforce_session_cap();

        self.bus.publish(Event::TelemetryEvent {
            id: generate_id(),
            timestamp: now,
            process_id: process_id.unwrap_or_else(|| crate::events::SYSTEM_PROCESS.to_string()),
            session_id: batch.session_id,
            event_count,
        });
    }

    fn enforce_session_cap(&self) {
        while self.sessions.len() > self.config.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|s| s.last_activity)
                .map(|s| s.session_id.clone());
            match oldest {
                Some(id) => {
                    self.sessions.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Evict sessions idle past the TTL. Returns the evicted ids so the
    /// caller can drop their repl channels.
    pub fn sweep(&self) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.session_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(1800));
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.last_activity < cutoff)
            .map(|s| s.session_id.clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    pub fn get(&self, session_id: &str) -> Option<TelemetrySession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn sessions(&self) -> Vec<TelemetrySession> {
        let mut all: Vec<TelemetrySession> = self.sessions.iter().map(|s| s.clone()).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    pub fn by_process(&self, process_id: &str) -> Vec<TelemetrySession> {
        self.sessions
            .iter()
            .filter(|s| s.process_id.as_deref() == Some(process_id))
            .map(|s| s.clone())
            .collect()
    }

    /// Session id with the most recent activity, for repl targeting.
    pub fn most_recent_active(&self) -> Option<String> {
        self.sessions
            .iter()
            .max_by_key(|s| s.last_activity)
            .map(|s| s.session_id.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Periodic TTL sweep; ends when `shutdown` resolves.
pub fn spawn_sweeper(
    collector: Arc<TelemetryCollector>,
    repl: Arc<ReplGateway>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for id in collector.sweep() {
                        repl.drop_session(&id);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

// ── HTTP surface ───────────────────────────────────────────────────────────

/// State behind the /api routes. Mounted on every proxy listener (the
/// injected script posts same-origin) and on the JSON-RPC endpoint.
#[derive(Clone)]
pub struct ApiState {
    pub collector: Arc<TelemetryCollector>,
    pub repl: Arc<ReplGateway>,
    pub store: Arc<LogStore>,
    pub resolver: Arc<dyn ProcessResolver>,
    pub scripts: Arc<ScriptsLibrary>,
}

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/telemetry", post(post_telemetry))
        .route("/api/browser-log", post(post_browser_log))
        .route("/api/repl/poll", get(get_repl_poll))
        .route("/api/repl/result", post(post_repl_result))
        .route("/api/scripts.js", get(get_scripts_bundle))
        .with_state(state)
}

async fn post_telemetry(
    State(state): State<ApiState>,
    Json(batch): Json<TelemetryBatch>,
) -> impl IntoResponse {
    state.collector.ingest(batch, state.resolver.as_ref());
    StatusCode::ACCEPTED
}

/// Individual log line posted by the browser extension.
#[derive(Debug, Deserialize)]
struct BrowserLog {
    #[serde(default)]
    level: Option<String>,
    message: String,
    #[serde(default)]
    url: Option<String>,
}

async fn post_browser_log(
    State(state): State<ApiState>,
    Json(log): Json<BrowserLog>,
) -> impl IntoResponse {
    let is_error = matches!(log.level.as_deref(), Some("error") | Some("warn"));
    let content = match &log.url {
        Some(url) => format!("{} ({})", log.message, url),
        None => log.message.clone(),
    };
    state.store.add("browser", "browser", &content, is_error);
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
struct PollParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn get_repl_poll(
    State(state): State<ApiState>,
    Query(params): Query<PollParams>,
) -> impl IntoResponse {
    match state
        .repl
        .poll(&params.session_id, Duration::from_secs(20))
        .await
    {
        Some(command) => (StatusCode::OK, Json(serde_json::json!(command))),
        None => (StatusCode::NO_CONTENT, Json(serde_json::json!(null))),
    }
}

/// The user scripts bundle, consumable from an injected page.
async fn get_scripts_bundle(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [("content-type", "application/javascript")],
        state.scripts.bundle(),
    )
}

async fn post_repl_result(
    State(state): State<ApiState>,
    Json(result): Json<ReplResult>,
) -> impl IntoResponse {
    if state.repl.resolve(result) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::GONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> TelemetryCollector {
        TelemetryCollector::new(TelemetryConfig::default(), Arc::new(EventBus::with_workers(2)))
    }

    fn batch(session: &str, events: Vec<BrowserEvent>) -> TelemetryBatch {
        TelemetryBatch {
            session_id: session.to_string(),
            url: "http://localhost:3000/".to_string(),
            events,
            metrics: None,
            memory: None,
        }
    }

    fn event(event_type: &str, fields: Value) -> BrowserEvent {
        BrowserEvent {
            event_type: event_type.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    struct FixedResolver(Option<String>);

    impl ProcessResolver for FixedResolver {
        fn resolve_process(&self, _page_url: &str) -> Option<String> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_session_created_on_first_batch() {
        let collector = collector();
        collector.ingest(
            batch("s1", vec![event("page-load", serde_json::json!({}))]),
            &FixedResolver(Some("p1".to_string())),
        );

        let session = collector.get("s1").unwrap();
        assert_eq!(session.process_id.as_deref(), Some("p1"));
        assert_eq!(session.event_count, 1);
    }

    #[tokio::test]
    async fn test_counters_by_event_type() {
        let collector = collector();
        collector.ingest(
            batch(
                "s1",
                vec![
                    event("console", serde_json::json!({"level": "warn"})),
                    event("console", serde_json::json!({"level": "warn"})),
                    event("error", serde_json::json!({"message": "boom"})),
                    event("interaction", serde_json::json!({"kind": "click"})),
                ],
            ),
            &NoProcessResolver,
        );

        let session = collector.get("s1").unwrap();
        assert_eq!(session.console_counts.get("warn"), Some(&2));
        assert_eq!(session.error_count, 1);
        assert_eq!(session.interaction_count, 1);
    }

    #[tokio::test]
    async fn test_event_ring_bounded() {
        let collector = TelemetryCollector::new(
            TelemetryConfig {
                event_capacity: 5,
                ..Default::default()
            },
            Arc::new(EventBus::with_workers(2)),
        );
        let events: Vec<BrowserEvent> = (0..12)
            .map(|i| event("interaction", serde_json::json!({"n": i})))
            .collect();
        collector.ingest(batch("s1", events), &NoProcessResolver);

        let session = collector.get("s1").unwrap();
        assert_eq!(session.events.len(), 5);
        assert_eq!(session.event_count, 12);
    }

    #[tokio::test]
    async fn test_session_cap_evicts_lru() {
        let collector = TelemetryCollector::new(
            TelemetryConfig {
                max_sessions: 2,
                ..Default::default()
            },
            Arc::new(EventBus::with_workers(2)),
        );
        collector.ingest(batch("s1", vec![]), &NoProcessResolver);
        tokio::time::sleep(Duration::from_millis(5)).await;
        collector.ingest(batch("s2", vec![]), &NoProcessResolver);
        tokio::time::sleep(Duration::from_millis(5)).await;
        collector.ingest(batch("s3", vec![]), &NoProcessResolver);

        assert_eq!(collector.len(), 2);
        assert!(collector.get("s1").is_none(), "oldest session evicted");
        assert!(collector.get("s3").is_some());
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_sessions() {
        let collector = TelemetryCollector::new(
            TelemetryConfig {
                session_ttl: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(EventBus::with_workers(2)),
        );
        collector.ingest(batch("s1", vec![]), &NoProcessResolver);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let evicted = collector.sweep();
        assert_eq!(evicted, vec!["s1".to_string()]);
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_most_recent_active() {
        let collector = collector();
        collector.ingest(batch("s1", vec![]), &NoProcessResolver);
        tokio::time::sleep(Duration::from_millis(5)).await;
        collector.ingest(batch("s2", vec![]), &NoProcessResolver);
        assert_eq!(collector.most_recent_active().as_deref(), Some("s2"));
    }

    #[test]
    fn test_batch_roundtrip() {
        let json = r#"{
            "sessionId": "abc",
            "url": "http://localhost:3000/",
            "events": [{"type": "error", "timestamp": 1700000000000, "message": "boom"}],
            "metrics": {"first-paint": 12.5}
        }"#;
        let batch: TelemetryBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.session_id, "abc");
        assert_eq!(batch.events[0].event_type, "error");
        assert_eq!(
            batch.events[0].fields.get("message").unwrap().as_str(),
            Some("boom")
        );

        // Encode→decode is the identity on the wire shape
        let encoded = serde_json::to_string(&batch).unwrap();
        let back: TelemetryBatch = serde_json::from_str(&encoded).unwrap();
        assert_eq!(serde_json::to_value(&back).unwrap(), serde_json::to_value(&batch).unwrap());
    }
}
