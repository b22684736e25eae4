// Events that flow from the supervisor, log pipeline and proxy to consumers
//
// Everything observable in brummer crosses the event bus as one of these
// variants. Using an enum allows pattern matching and ensures type-safe
// communication between async tasks; consumers (TUI, MCP resource
// subscriptions, hub) subscribe per kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel process id for events not tied to a child process.
pub const SYSTEM_PROCESS: &str = "system";

/// Kinds of events, used as subscription keys on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ProcessStarted,
    ProcessExited,
    LogLine,
    ErrorDetected,
    BuildEvent,
    TestFailed,
    TestPassed,
    McpActivity,
    McpConnected,
    McpDisconnected,
    ProxyRequest,
    TelemetryEvent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ProcessStarted => "process-started",
            EventKind::ProcessExited => "process-exited",
            EventKind::LogLine => "log-line",
            EventKind::ErrorDetected => "error-detected",
            EventKind::BuildEvent => "build-event",
            EventKind::TestFailed => "test-failed",
            EventKind::TestPassed => "test-passed",
            EventKind::McpActivity => "mcp-activity",
            EventKind::McpConnected => "mcp-connected",
            EventKind::McpDisconnected => "mcp-disconnected",
            EventKind::ProxyRequest => "proxy-request",
            EventKind::TelemetryEvent => "telemetry-event",
        }
    }
}

/// Main event type that flows through the application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")] // Creates JSON like {"type": "log-line", ...}
pub enum Event {
    /// A supervised process entered the running state
    ProcessStarted {
        id: String,
        timestamp: DateTime<Utc>,
        process_id: String,
        name: String,
    },

    /// A supervised process reached a terminal state
    ProcessExited {
        id: String,
        timestamp: DateTime<Utc>,
        process_id: String,
        name: String,
        exit_code: Option<i32>,
        /// Terminal status: "exited", "failed" or "killed"
        status: String,
    },

    /// A line of child output was stored
    LogLine {
        id: String,
        timestamp: DateTime<Utc>,
        process_id: String,
        process_name: String,
        content: String,
        is_error: bool,
    },

    /// The classifier recognized an error in child output
    ErrorDetected {
        id: String,
        timestamp: DateTime<Utc>,
        process_id: String,
        /// Classified kind, e.g. "network", "runtime", "build"
        kind: String,
        message: String,
    },

    /// A build tool reported progress or completion
    BuildEvent {
        id: String,
        timestamp: DateTime<Utc>,
        process_id: String,
        message: String,
        failed: bool,
    },

    /// A test runner reported a failing test
    TestFailed {
        id: String,
        timestamp: DateTime<Utc>,
        process_id: String,
        message: String,
    },

    /// A test runner reported a passing run
    TestPassed {
        id: String,
        timestamp: DateTime<Utc>,
        process_id: String,
        message: String,
    },

    /// A JSON-RPC call was served by the endpoint
    McpActivity {
        id: String,
        timestamp: DateTime<Utc>,
        method: String,
        params: Option<serde_json::Value>,
        /// Response payload or error message
        response: Option<String>,
        elapsed_ms: u64,
    },

    /// A client session connected to the endpoint
    McpConnected {
        id: String,
        timestamp: DateTime<Utc>,
        session_id: String,
        /// Client name derived from the User-Agent header
        client: String,
    },

    /// A client session disconnected from the endpoint
    McpDisconnected {
        id: String,
        timestamp: DateTime<Utc>,
        session_id: String,
        client: String,
    },

    /// A request passed through the proxy
    ProxyRequest {
        id: String,
        timestamp: DateTime<Utc>,
        process_id: String,
        method: String,
        url: String,
        status: u16,
        duration_ms: u64,
        injected: bool,
    },

    /// A batch of browser telemetry arrived
    TelemetryEvent {
        id: String,
        timestamp: DateTime<Utc>,
        process_id: String,
        session_id: String,
        event_count: usize,
    },
}

impl Event {
    /// Subscription key for this event
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ProcessStarted { .. } => EventKind::ProcessStarted,
            Event::ProcessExited { .. } => EventKind::ProcessExited,
            Event::LogLine { .. } => EventKind::LogLine,
            Event::ErrorDetected { .. } => EventKind::ErrorDetected,
            Event::BuildEvent { .. } => EventKind::BuildEvent,
            Event::TestFailed { .. } => EventKind::TestFailed,
            Event::TestPassed { .. } => EventKind::TestPassed,
            Event::McpActivity { .. } => EventKind::McpActivity,
            Event::McpConnected { .. } => EventKind::McpConnected,
            Event::McpDisconnected { .. } => EventKind::McpDisconnected,
            Event::ProxyRequest { .. } => EventKind::ProxyRequest,
            Event::TelemetryEvent { .. } => EventKind::TelemetryEvent,
        }
    }

    /// Process id this event concerns, or the system sentinel
    pub fn process_id(&self) -> &str {
        match self {
            Event::ProcessStarted { process_id, .. }
            | Event::ProcessExited { process_id, .. }
            | Event::LogLine { process_id, .. }
            | Event::ErrorDetected { process_id, .. }
            | Event::BuildEvent { process_id, .. }
            | Event::TestFailed { process_id, .. }
            | Event::TestPassed { process_id, .. }
            | Event::ProxyRequest { process_id, .. }
            | Event::TelemetryEvent { process_id, .. } => process_id,
            Event::McpActivity { .. }
            | Event::McpConnected { .. }
            | Event::McpDisconnected { .. } => SYSTEM_PROCESS,
        }
    }

    #[allow(dead_code)] // query surface alongside kind()/process_id()
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::ProcessStarted { timestamp, .. }
            | Event::ProcessExited { timestamp, .. }
            | Event::LogLine { timestamp, .. }
            | Event::ErrorDetected { timestamp, .. }
            | Event::BuildEvent { timestamp, .. }
            | Event::TestFailed { timestamp, .. }
            | Event::TestPassed { timestamp, .. }
            | Event::McpActivity { timestamp, .. }
            | Event::McpConnected { timestamp, .. }
            | Event::McpDisconnected { timestamp, .. }
            | Event::ProxyRequest { timestamp, .. }
            | Event::TelemetryEvent { timestamp, .. } => *timestamp,
        }
    }
}

/// Helper to generate unique ids for correlating events
pub fn generate_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let count = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}", Utc::now().timestamp_millis(), count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        let event = Event::LogLine {
            id: generate_id(),
            timestamp: Utc::now(),
            process_id: "p1".to_string(),
            process_name: "dev".to_string(),
            content: "listening on http://localhost:3000".to_string(),
            is_error: false,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"log-line\""));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), EventKind::LogLine);
        assert_eq!(back.process_id(), "p1");
    }

    #[test]
    fn test_system_sentinel() {
        let event = Event::McpConnected {
            id: generate_id(),
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            client: "vscode".to_string(),
        };
        assert_eq!(event.process_id(), SYSTEM_PROCESS);
    }

    #[test]
    fn test_generated_ids_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
    }
}
