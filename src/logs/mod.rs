// Log store - append, classify, collapse, tag, query
//
// The canonical "fire-and-forget under pressure" component: producers
// (process stream readers) push lines through a bounded ingest channel and
// never block; the store keeps a bounded ring per process inside a global
// ring, collapses consecutive duplicates, consults the error detector on
// candidate lines, extracts URLs, and publishes events on the bus.

pub mod detector;
pub mod urls;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::events::{generate_id, Event};
use detector::{ErrorDetector, ErrorKind, ErrorRecord, Severity};

/// A stored line of process output.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Monotonic store id; global order follows ids
    pub id: u64,
    pub process_id: String,
    pub process_name: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub is_error: bool,
    /// Detected tags, e.g. "build", "test", "url", a classification kind
    pub tags: Vec<String>,
    /// Label extracted alongside a `url` tag
    pub label: Option<String>,
    /// Number of identical consecutive lines collapsed into this entry (≥ 1)
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    /// Global entry cap, FIFO eviction
    pub global_capacity: usize,
    /// Per-process entry cap, FIFO eviction within the process
    pub per_process_capacity: usize,
    /// Bounded error index
    pub error_capacity: usize,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            global_capacity: 10_000,
            per_process_capacity: 2_000,
            error_capacity: 500,
        }
    }
}

struct Inner {
    entries: BTreeMap<u64, LogEntry>,
    per_process: HashMap<String, VecDeque<u64>>,
    /// Id of the most recently appended entry, for collapse detection
    tail: Option<u64>,
    next_id: u64,
    errors: VecDeque<ErrorRecord>,
    watchers: Vec<(LogFilter, mpsc::Sender<LogEntry>)>,
}

/// Filter for `subscribe`: both fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub process_id: Option<String>,
    pub errors_only: bool,
}

impl LogFilter {
    fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(process_id) = &self.process_id {
            if &entry.process_id != process_id {
                return false;
            }
        }
        !self.errors_only || entry.is_error
    }
}

/// Append-only log storage with bounded rings and collapse-on-add.
pub struct LogStore {
    inner: Mutex<Inner>,
    detector: ErrorDetector,
    bus: Arc<EventBus>,
    config: LogStoreConfig,
    dropped: AtomicU64,
}

impl LogStore {
    pub fn new(config: LogStoreConfig, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                per_process: HashMap::new(),
                tail: None,
                next_id: 1,
                errors: VecDeque::new(),
                watchers: Vec::new(),
            }),
            detector: ErrorDetector::new(),
            bus,
            config,
            dropped: AtomicU64::new(0),
        }
    }

    /// Store one line. Returns the stored (possibly collapsed-into) entry, or
    /// None for lines the store silently drops (empty content).
    pub fn add(
        &self,
        process_id: &str,
        process_name: &str,
        content: &str,
        is_error: bool,
    ) -> Option<LogEntry> {
        if content.is_empty() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let now = Utc::now();
        let mut events = Vec::new();

        let stored = {
            let mut inner = self.inner.lock().unwrap();

            // Collapse: identical consecutive line from the same process.
            // Any interleaved entry (other process, or flipped error flag)
            // resets the run because the tail no longer matches.
            if let Some(tail_id) = inner.tail {
                if let Some(tail) = inner.entries.get_mut(&tail_id) {
                    if tail.process_id == process_id
                        && tail.content == content
                        && tail.is_error == is_error
                    {
                        tail.count += 1;
                        tail.timestamp = now;
                        let stored = tail.clone();
                        events.push(self.log_line_event(&stored));
                        Self::notify_watchers(&mut inner, &stored);
                        drop(inner);
                        for event in events {
                            self.bus.publish(event);
                        }
                        return Some(stored);
                    }
                }
            }

            let id = inner.next_id;
            inner.next_id += 1;

            let mut tags = Vec::new();
            let mut label = None;

            // Classification runs synchronously, but only for candidates or
            // while a stack trace is being assembled for this process.
            if detector::is_candidate(content) || self.detector.has_pending(process_id) {
                let observation = self.detector.observe(process_id, id, content, now);
                for record in observation.completed {
                    self.index_error(&mut inner, record);
                }
                if let Some((kind, severity)) = observation.detected {
                    tags.push(kind.as_str().to_string());
                    match kind {
                        ErrorKind::BuildError => {
                            tags.push("build".to_string());
                            events.push(Event::BuildEvent {
                                id: generate_id(),
                                timestamp: now,
                                process_id: process_id.to_string(),
                                message: content.trim().to_string(),
                                failed: true,
                            });
                        }
                        ErrorKind::TestFailure => {
                            tags.push("test".to_string());
                            events.push(Event::TestFailed {
                                id: generate_id(),
                                timestamp: now,
                                process_id: process_id.to_string(),
                                message: content.trim().to_string(),
                            });
                        }
                        _ => {}
                    }
                    if severity >= Severity::Error {
                        events.push(Event::ErrorDetected {
                            id: generate_id(),
                            timestamp: now,
                            process_id: process_id.to_string(),
                            kind: kind.as_str().to_string(),
                            message: content.trim().to_string(),
                        });
                    }
                }
            }

            if test_passed(content) {
                if !tags.iter().any(|t| t == "test") {
                    tags.push("test".to_string());
                }
                events.push(Event::TestPassed {
                    id: generate_id(),
                    timestamp: now,
                    process_id: process_id.to_string(),
                    message: content.trim().to_string(),
                });
            }

            let found_urls = urls::extract_urls(content);
            if !found_urls.is_empty() {
                tags.push("url".to_string());
                label = Some(urls::extract_label(content, process_name));
            }

            let entry = LogEntry {
                id,
                process_id: process_id.to_string(),
                process_name: process_name.to_string(),
                timestamp: now,
                content: content.to_string(),
                is_error,
                tags,
                label,
                count: 1,
            };

            events.push(self.log_line_event(&entry));

            inner.entries.insert(id, entry.clone());
            inner
                .per_process
                .entry(process_id.to_string())
                .or_default()
                .push_back(id);
            inner.tail = Some(id);

            self.evict(&mut inner, process_id);
            Self::notify_watchers(&mut inner, &entry);
            entry
        };

        for event in events {
            self.bus.publish(event);
        }
        Some(stored)
    }

    /// Fan a stored entry out to filter subscribers; closed or saturated
    /// receivers are dropped.
    fn notify_watchers(inner: &mut Inner, entry: &LogEntry) {
        inner.watchers.retain(|(filter, tx)| {
            if !filter.matches(entry) {
                return !tx.is_closed();
            }
            match tx.try_send(entry.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Subscribe to stored entries matching a filter. The channel is
    /// bounded; a slow consumer misses entries rather than blocking adds.
    pub fn subscribe(&self, filter: LogFilter) -> mpsc::Receiver<LogEntry> {
        let (tx, rx) = mpsc::channel(256);
        self.inner.lock().unwrap().watchers.push((filter, tx));
        rx
    }

    fn log_line_event(&self, entry: &LogEntry) -> Event {
        Event::LogLine {
            id: generate_id(),
            timestamp: entry.timestamp,
            process_id: entry.process_id.clone(),
            process_name: entry.process_name.clone(),
            content: entry.content.clone(),
            is_error: entry.is_error,
        }
    }

    fn index_error(&self, inner: &mut Inner, record: ErrorRecord) {
        if inner.errors.len() >= self.config.error_capacity {
            inner.errors.pop_front();
        }
        inner.errors.push_back(record);
    }

    fn evict(&self, inner: &mut Inner, process_id: &str) {
        // Per-process FIFO first, then the global cap
        if let Some(ring) = inner.per_process.get_mut(process_id) {
            while ring.len() > self.config.per_process_capacity {
                if let Some(old) = ring.pop_front() {
                    inner.entries.remove(&old);
                }
            }
        }
        while inner.entries.len() > self.config.global_capacity {
            if let Some((old_id, old)) = inner.entries.pop_first() {
                if let Some(ring) = inner.per_process.get_mut(&old.process_id) {
                    if ring.front() == Some(&old_id) {
                        ring.pop_front();
                    } else {
                        ring.retain(|id| *id != old_id);
                    }
                }
            }
        }
    }

    /// Flush any pending multi-line error for a process (stream closed).
    pub fn flush_process(&self, process_id: &str) {
        if let Some(record) = self.detector.flush(process_id) {
            let mut inner = self.inner.lock().unwrap();
            self.index_error(&mut inner, record);
        }
    }

    /// Lines silently dropped (empty content or ingest overflow).
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn note_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    // ── Queries ────────────────────────────────────────────────────────────

    pub fn get_all(&self) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner.entries.values().cloned().collect()
    }

    pub fn get_by_process(&self, process_id: &str) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .per_process
            .get(process_id)
            .map(|ring| {
                ring.iter()
                    .filter_map(|id| inner.entries.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Collapsed view: adjacent identical runs (split by interleaving from
    /// other processes) are merged. Non-empty whenever `get_by_process` is.
    pub fn get_by_process_collapsed(&self, process_id: &str) -> Vec<LogEntry> {
        let raw = self.get_by_process(process_id);
        let mut collapsed: Vec<LogEntry> = Vec::with_capacity(raw.len());
        for entry in raw {
            match collapsed.last_mut() {
                Some(last) if last.content == entry.content && last.is_error == entry.is_error => {
                    last.count += entry.count;
                    last.timestamp = entry.timestamp;
                }
                _ => collapsed.push(entry),
            }
        }
        collapsed
    }

    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .rev()
            .take(n)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Case-insensitive substring search over content.
    pub fn search(&self, query: &str) -> Vec<LogEntry> {
        let needle = query.to_lowercase();
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .filter(|e| e.content.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        let inner = self.inner.lock().unwrap();
        inner.errors.iter().cloned().collect()
    }

    pub fn errors_by_process(&self, process_id: &str) -> Vec<ErrorRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .errors
            .iter()
            .filter(|r| r.process_id == process_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn test_passed(content: &str) -> bool {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\d+\s+(passing|passed)\b|Tests:.*\bpassed\b|✓").unwrap()
    });
    re.is_match(content) && ErrorDetector::classify(content).is_none()
}

// ── Ingest channel ─────────────────────────────────────────────────────────

/// One line handed to the ingest channel by a stream reader.
#[derive(Debug)]
pub struct IngestLine {
    pub process_id: String,
    pub process_name: String,
    pub content: String,
    pub is_error: bool,
}

/// Fire-and-forget handle used by process stream readers. `send` never
/// blocks; lines shed under burst are counted on the store.
#[derive(Clone)]
pub struct LogIngest {
    tx: mpsc::Sender<IngestLine>,
    store: Arc<LogStore>,
}

impl LogIngest {
    pub fn send(&self, line: IngestLine) -> bool {
        match self.tx.try_send(line) {
            Ok(()) => true,
            Err(_) => {
                self.store.note_dropped();
                false
            }
        }
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }
}

/// Spawn the single writer task that feeds the store from the ingest
/// channel. The task ends when every `LogIngest` clone is dropped.
pub fn spawn_ingest(store: Arc<LogStore>, buffer: usize) -> (LogIngest, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<IngestLine>(buffer);
    let writer_store = store.clone();
    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            writer_store.add(
                &line.process_id,
                &line.process_name,
                &line.content,
                line.is_error,
            );
        }
        tracing::debug!("log ingest writer finished");
    });
    (LogIngest { tx, store }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LogStore {
        LogStore::new(LogStoreConfig::default(), Arc::new(EventBus::with_workers(2)))
    }

    fn small_store(global: usize, per_process: usize) -> LogStore {
        LogStore::new(
            LogStoreConfig {
                global_capacity: global,
                per_process_capacity: per_process,
                error_capacity: 10,
            },
            Arc::new(EventBus::with_workers(2)),
        )
    }

    #[tokio::test]
    async fn test_add_returns_entry() {
        let store = store();
        let entry = store.add("p1", "dev", "hello", false).unwrap();
        assert_eq!(entry.content, "hello");
        assert_eq!(entry.count, 1);
    }

    #[tokio::test]
    async fn test_empty_content_dropped() {
        let store = store();
        assert!(store.add("p1", "dev", "", false).is_none());
        assert_eq!(store.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_collapsing_increments_count() {
        let store = store();
        store.add("p1", "dev", "tick", false);
        let second = store.add("p1", "dev", "tick", false).unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(store.get_by_process("p1").len(), 1);
    }

    #[tokio::test]
    async fn test_collapse_run_a_a_b_a() {
        let store = store();
        store.add("p1", "dev", "A", false);
        store.add("p1", "dev", "A", false);
        store.add("p1", "dev", "B", false);
        store.add("p1", "dev", "A", false);

        let collapsed = store.get_by_process_collapsed("p1");
        let shape: Vec<(String, u64)> = collapsed
            .iter()
            .map(|e| (e.content.clone(), e.count))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("A".to_string(), 2),
                ("B".to_string(), 1),
                ("A".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn test_error_flag_flip_resets_run() {
        let store = store();
        store.add("p1", "dev", "boom", false);
        store.add("p1", "dev", "boom", true);
        assert_eq!(store.get_by_process("p1").len(), 2);
    }

    #[tokio::test]
    async fn test_identical_lines_from_different_processes_do_not_collapse() {
        let store = store();
        store.add("p1", "dev", "same", false);
        store.add("p2", "test", "same", false);
        assert_eq!(store.get_by_process("p1").len(), 1);
        assert_eq!(store.get_by_process("p2").len(), 1);
        assert_eq!(store.get_all().len(), 2);
    }

    #[tokio::test]
    async fn test_interleaved_process_resets_collapse_run() {
        let store = store();
        store.add("p1", "dev", "same", false);
        store.add("p2", "test", "other", false);
        store.add("p1", "dev", "same", false);
        // The p2 entry broke the run, so p1 holds two raw entries...
        assert_eq!(store.get_by_process("p1").len(), 2);
        // ...which the collapsed view merges back together.
        let collapsed = store.get_by_process_collapsed("p1");
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].count, 2);
    }

    #[tokio::test]
    async fn test_collapsed_nonempty_whenever_raw_nonempty() {
        let store = small_store(8, 4);
        for i in 0..20 {
            store.add("p1", "dev", &format!("line {}", i), false);
            store.add("p2", "test", "x", false);
            assert_eq!(
                store.get_by_process("p1").is_empty(),
                store.get_by_process_collapsed("p1").is_empty()
            );
        }
    }

    #[tokio::test]
    async fn test_per_process_eviction_fifo() {
        let store = small_store(100, 3);
        for i in 0..5 {
            store.add("p1", "dev", &format!("line {}", i), false);
        }
        let entries = store.get_by_process("p1");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].content, "line 2");
    }

    #[tokio::test]
    async fn test_global_eviction_fifo() {
        let store = small_store(4, 100);
        for i in 0..6 {
            store.add(&format!("p{}", i), "dev", &format!("line {}", i), false);
        }
        let all = store.get_all();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].content, "line 2");
        // Evicted entries also left the per-process rings
        assert!(store.get_by_process("p0").is_empty());
        assert!(store.get_by_process("p1").is_empty());
    }

    #[tokio::test]
    async fn test_url_tag_and_label() {
        let store = store();
        let entry = store
            .add("p1", "dev", "listening on http://localhost:3000", false)
            .unwrap();
        assert!(entry.tags.iter().any(|t| t == "url"));
        assert_eq!(entry.label.as_deref(), Some("listening"));
    }

    #[tokio::test]
    async fn test_network_error_classified_and_indexed() {
        let store = store();
        store.add(
            "p1",
            "dev",
            "FetchError: request to http://api.x failed, reason: getaddrinfo ENOTFOUND api.x",
            true,
        );
        // The pending record flushes on the next non-continuation line
        store.add("p1", "dev", "recovered", false);
        let errors = store.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::NetworkError);
    }

    #[tokio::test]
    async fn test_tail() {
        let store = store();
        for i in 0..10 {
            store.add("p1", "dev", &format!("line {}", i), false);
        }
        let tail = store.tail(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "line 7");
        assert_eq!(tail[2].content, "line 9");
    }

    #[tokio::test]
    async fn test_search() {
        let store = store();
        store.add("p1", "dev", "Compiled successfully", false);
        store.add("p1", "dev", "ready in 200ms", false);
        let hits = store.search("COMPILED");
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_by_filter() {
        let store = store();
        let mut errors_only = store.subscribe(LogFilter {
            process_id: Some("p1".to_string()),
            errors_only: true,
        });

        store.add("p1", "dev", "plain line", false);
        store.add("p2", "test", "other process error", true);
        store.add("p1", "dev", "boom", true);

        let entry = errors_only.recv().await.unwrap();
        assert_eq!(entry.content, "boom");
        // Nothing else matched the filter
        assert!(errors_only.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ingest_path() {
        let bus = Arc::new(EventBus::with_workers(2));
        let store = Arc::new(LogStore::new(LogStoreConfig::default(), bus));
        let (ingest, handle) = spawn_ingest(store.clone(), 64);

        assert!(ingest.send(IngestLine {
            process_id: "p1".to_string(),
            process_name: "dev".to_string(),
            content: "async line".to_string(),
            is_error: false,
        }));

        // The writer runs asynchronously; yield before asserting.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.get_by_process("p1").len(), 1);

        drop(ingest);
        let _ = handle.await;
    }
}
