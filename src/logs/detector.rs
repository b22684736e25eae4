// Error detection - rule-driven classification of child output
//
// A fixed, ordered rule table maps regex patterns to error kinds. Ordering is
// load-bearing: network patterns (FetchError, ENOTFOUND, ECONNREFUSED) are
// evaluated before generic JavaScript runtime patterns, so a failed fetch is
// never misclassified as a language error. Multi-line stack traces are
// assembled by buffering continuation lines (indented, or `at <frame>`)
// until the first non-matching line or a staleness window.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

/// Classified kind of a detected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NetworkError,
    JavaScriptRuntimeError,
    BuildError,
    TestFailure,
    Warning,
    DeprecationNotice,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "network",
            ErrorKind::JavaScriptRuntimeError => "runtime",
            ErrorKind::BuildError => "build",
            ErrorKind::TestFailure => "test-failure",
            ErrorKind::Warning => "warning",
            ErrorKind::DeprecationNotice => "deprecation",
            ErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A detected error with its assembled context lines.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    /// Stack/context lines buffered after the primary line
    pub context: Vec<String>,
    pub process_id: String,
    /// Id of the log entry that triggered detection
    pub log_entry_id: u64,
    pub timestamp: DateTime<Utc>,
}

struct Rule {
    pattern: Regex,
    kind: ErrorKind,
    severity: Severity,
}

fn rules() -> &'static Vec<Rule> {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let rule = |pattern: &str, kind, severity| Rule {
            pattern: Regex::new(pattern).unwrap(),
            kind,
            severity,
        };
        vec![
            // Network failures first. These lines usually also contain
            // "Error" and would otherwise fall into the runtime bucket.
            rule(
                r"FetchError|ENOTFOUND|ECONNREFUSED|ECONNRESET|ETIMEDOUT|EAI_AGAIN|EHOSTUNREACH|getaddrinfo|socket hang up",
                ErrorKind::NetworkError,
                Severity::Error,
            ),
            rule(
                r"(?i)\bnetwork (error|failure)\b",
                ErrorKind::NetworkError,
                Severity::Error,
            ),
            // Test failures before build/runtime: runners echo stack traces
            // that would match the generic patterns below.
            rule(
                r"(?i)tests?:?\s+\d+\s+failed|\d+\s+failing\b|✕|✗|\bFAIL\s",
                ErrorKind::TestFailure,
                Severity::Error,
            ),
            rule(
                r"AssertionError|expect\(.*\)\.to",
                ErrorKind::TestFailure,
                Severity::Error,
            ),
            // Build tooling
            rule(
                r"(?i)build failed|compilation failed|Module not found|Cannot find module|ERROR in |error TS\d+",
                ErrorKind::BuildError,
                Severity::Error,
            ),
            // Deprecation before generic warnings so it keeps its own kind
            rule(
                r"(?i)deprecat(ed|ion)",
                ErrorKind::DeprecationNotice,
                Severity::Warning,
            ),
            rule(r"(?i)\bwarn(ing)?\b", ErrorKind::Warning, Severity::Warning),
            // Generic JavaScript runtime errors, after everything specific
            rule(
                r"\b(TypeError|ReferenceError|RangeError|SyntaxError|EvalError|URIError)\b|UnhandledPromiseRejection|Uncaught exception|(?m)^\s*throw\b",
                ErrorKind::JavaScriptRuntimeError,
                Severity::Error,
            ),
            rule(
                r"(?i)\berror\b",
                ErrorKind::Unknown,
                Severity::Error,
            ),
        ]
    })
}

fn continuation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+at\s|^\s{2,}\S|^\t").unwrap())
}

/// Cheap pre-filter the log store applies before consulting the detector.
pub fn is_candidate(content: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)error|warn|fail|throw|exception|✕|✗|^\s+at\s|Error:").unwrap()
    });
    re.is_match(content)
}

/// Maximum context lines buffered per pending error.
const MAX_CONTEXT_LINES: usize = 20;

/// Pending errors older than this are flushed regardless of continuation.
const PENDING_STALENESS: Duration = Duration::from_secs(2);

struct Pending {
    record: ErrorRecord,
    last_update: Instant,
}

/// Outcome of feeding one line to the detector.
#[derive(Debug, Default)]
pub struct Observation {
    /// Set when this line itself matched a rule (the store emits the
    /// `error-detected` event from this, without waiting for context
    /// assembly to finish).
    pub detected: Option<(ErrorKind, Severity)>,
    /// Records whose context assembly completed on this call.
    pub completed: Vec<ErrorRecord>,
}

/// Stateful detector assembling multi-line errors per process.
pub struct ErrorDetector {
    pending: Mutex<HashMap<String, Pending>>,
}

impl ErrorDetector {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Classify a single line without multi-line assembly.
    pub fn classify(content: &str) -> Option<(ErrorKind, Severity)> {
        rules()
            .iter()
            .find(|rule| rule.pattern.is_match(content))
            .map(|rule| (rule.kind, rule.severity))
    }

    /// Feed one stored line through the detector.
    ///
    /// `detected` reports a match on this line immediately; `completed`
    /// carries records whose context assembly finished on this call (a stale
    /// or interrupted pending error flushes here — a newly matched line with
    /// trailing context is completed by a later call or by `flush`).
    pub fn observe(
        &self,
        process_id: &str,
        log_entry_id: u64,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Observation {
        let mut observation = Observation::default();
        let mut pending = self.pending.lock().unwrap();

        // Continuation handling for an in-flight error on this process
        if let Some(current) = pending.get_mut(process_id) {
            let stale = current.last_update.elapsed() > PENDING_STALENESS;
            if !stale && continuation_re().is_match(content) {
                if current.record.context.len() < MAX_CONTEXT_LINES {
                    current.record.context.push(content.to_string());
                }
                current.last_update = Instant::now();
                return observation;
            }
            // Non-matching or stale line terminates the pending record
            observation
                .completed
                .push(pending.remove(process_id).unwrap().record);
        }

        if let Some((kind, severity)) = Self::classify(content) {
            observation.detected = Some((kind, severity));
            let record = ErrorRecord {
                id: crate::events::generate_id(),
                kind,
                severity,
                message: content.trim().to_string(),
                context: Vec::new(),
                process_id: process_id.to_string(),
                log_entry_id,
                timestamp,
            };
            if severity >= Severity::Error {
                // Errors may trail a stack trace; hold for continuations.
                pending.insert(
                    process_id.to_string(),
                    Pending {
                        record,
                        last_update: Instant::now(),
                    },
                );
            } else {
                observation.completed.push(record);
            }
        }

        observation
    }

    /// Whether a multi-line error is currently being assembled for a
    /// process. The store keeps feeding lines while this holds, so
    /// continuations that fail the candidate heuristic still attach.
    pub fn has_pending(&self, process_id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(process_id)
    }

    /// Flush any pending record for one process (stream closed, process
    /// exited).
    pub fn flush(&self, process_id: &str) -> Option<ErrorRecord> {
        self.pending
            .lock()
            .unwrap()
            .remove(process_id)
            .map(|p| p.record)
    }

    /// Flush everything (shutdown).
    pub fn flush_all(&self) -> Vec<ErrorRecord> {
        self.pending
            .lock()
            .unwrap()
            .drain()
            .map(|(_, p)| p.record)
            .collect()
    }
}

impl Default for ErrorDetector {
    fn default() -> Self {
        Self::new()
    }
}
