// Resource implementations - readable documents over live state
//
// Resources declare which event kinds invalidate them; the server turns
// those into change notifications for subscribed SSE sessions.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::bus::EventBus;
use crate::discovery::Discovery;
use crate::events::EventKind;
use crate::logs::LogStore;
use crate::process::ProcessManager;
use crate::proxy::server::ProxyServer;
use crate::telemetry::TelemetryCollector;

use super::{McpServer, Resource};

#[derive(Clone)]
pub struct ResourceContext {
    pub bus: Arc<EventBus>,
    pub processes: Arc<ProcessManager>,
    pub logs: Arc<LogStore>,
    pub proxy: Option<Arc<ProxyServer>>,
    pub telemetry: Arc<TelemetryCollector>,
    pub discovery: Arc<Discovery>,
}

pub fn register_all(server: &McpServer, ctx: ResourceContext) {
    server.register_resource(Arc::new(RecentLogsResource { ctx: ctx.clone() }));
    server.register_resource(Arc::new(ErrorsResource { ctx: ctx.clone() }));
    server.register_resource(Arc::new(ProcessListResource { ctx: ctx.clone() }));
    server.register_resource(Arc::new(TelemetrySessionsResource { ctx: ctx.clone() }));
    server.register_resource(Arc::new(ProxyRequestsResource { ctx: ctx.clone() }));
    server.register_resource(Arc::new(ProxyMappingsResource { ctx: ctx.clone() }));
    server.register_resource(Arc::new(CountersResource { ctx }));
}

struct RecentLogsResource {
    ctx: ResourceContext,
}

impl Resource for RecentLogsResource {
    fn uri(&self) -> &str {
        "logs://recent"
    }
    fn name(&self) -> &str {
        "Recent logs"
    }
    fn description(&self) -> &str {
        "The most recent 100 stored log entries"
    }
    fn read(&self) -> Value {
        json!(self.ctx.logs.tail(100))
    }
    fn invalidated_by(&self) -> &[EventKind] {
        &[EventKind::LogLine]
    }
}

struct ErrorsResource {
    ctx: ResourceContext,
}

impl Resource for ErrorsResource {
    fn uri(&self) -> &str {
        "logs://errors"
    }
    fn name(&self) -> &str {
        "Detected errors"
    }
    fn description(&self) -> &str {
        "Classified error records with assembled context"
    }
    fn read(&self) -> Value {
        json!(self.ctx.logs.errors())
    }
    fn invalidated_by(&self) -> &[EventKind] {
        &[EventKind::ErrorDetected]
    }
}

struct ProcessListResource {
    ctx: ResourceContext,
}

impl Resource for ProcessListResource {
    fn uri(&self) -> &str {
        "processes://list"
    }
    fn name(&self) -> &str {
        "Processes"
    }
    fn description(&self) -> &str {
        "Snapshots of all supervised processes"
    }
    fn read(&self) -> Value {
        json!(self.ctx.processes.list())
    }
    fn invalidated_by(&self) -> &[EventKind] {
        &[EventKind::ProcessStarted, EventKind::ProcessExited]
    }
}

struct TelemetrySessionsResource {
    ctx: ResourceContext,
}

impl Resource for TelemetrySessionsResource {
    fn uri(&self) -> &str {
        "telemetry://sessions"
    }
    fn name(&self) -> &str {
        "Telemetry sessions"
    }
    fn description(&self) -> &str {
        "Browser sessions built from injected-script batches"
    }
    fn read(&self) -> Value {
        json!(self.ctx.telemetry.sessions())
    }
    fn invalidated_by(&self) -> &[EventKind] {
        &[EventKind::TelemetryEvent]
    }
}

struct ProxyRequestsResource {
    ctx: ResourceContext,
}

impl Resource for ProxyRequestsResource {
    fn uri(&self) -> &str {
        "proxy://requests"
    }
    fn name(&self) -> &str {
        "Proxy requests"
    }
    fn description(&self) -> &str {
        "The bounded ring of captured proxy requests"
    }
    fn read(&self) -> Value {
        match &self.ctx.proxy {
            Some(proxy) => json!(proxy.captures()),
            None => json!([]),
        }
    }
    fn invalidated_by(&self) -> &[EventKind] {
        &[EventKind::ProxyRequest]
    }
}

struct ProxyMappingsResource {
    ctx: ResourceContext,
}

impl Resource for ProxyMappingsResource {
    fn uri(&self) -> &str {
        "proxy://mappings"
    }
    fn name(&self) -> &str {
        "Proxy mappings"
    }
    fn description(&self) -> &str {
        "URL mappings registered from process logs"
    }
    fn read(&self) -> Value {
        match &self.ctx.proxy {
            Some(proxy) => json!(proxy.mappings.all()),
            None => json!([]),
        }
    }
    fn invalidated_by(&self) -> &[EventKind] {
        // Mappings are registered from URL-bearing log lines
        &[EventKind::LogLine]
    }
}

/// Read-only view of the global counters.
struct CountersResource {
    ctx: ResourceContext,
}

impl Resource for CountersResource {
    fn uri(&self) -> &str {
        "metrics://counters"
    }
    fn name(&self) -> &str {
        "Counters"
    }
    fn description(&self) -> &str {
        "Drop, failure and corruption counters across components"
    }
    fn read(&self) -> Value {
        let (injection_failures, decompression_failures) = match &self.ctx.proxy {
            Some(proxy) => (proxy.injection_failures(), proxy.decompression_failures()),
            None => (0, 0),
        };
        json!({
            "bus": {
                "dropped": self.ctx.bus.dropped_count(),
                "undrained": self.ctx.bus.undrained_count(),
            },
            "logs": {
                "dropped": self.ctx.logs.dropped_count(),
                "stored": self.ctx.logs.len(),
            },
            "proxy": {
                "injectionFailures": injection_failures,
                "decompressionFailures": decompression_failures,
            },
            "discovery": {
                "corruptFiles": self.ctx.discovery.corrupt_count(),
            },
        })
    }
    fn invalidated_by(&self) -> &[EventKind] {
        &[]
    }
}
