// Proxy module - traffic interception with telemetry injection
//
// Two modes. Full: a conventional forward HTTP proxy on a configured port.
// Reverse: every URL observed in process logs is assigned a locally bound
// proxy URL on a fresh port; requests to it are rewritten and forwarded to
// the origin. Both paths capture per-request records and inject the
// monitoring script into HTML responses.

pub mod inject;
pub mod server;

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::telemetry::ProcessResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Full,
    Reverse,
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(ProxyMode::Full),
            "reverse" => Ok(ProxyMode::Reverse),
            other => Err(format!("unknown proxy mode '{other}'")),
        }
    }
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Full => "full",
            ProxyMode::Reverse => "reverse",
        }
    }
}

/// A reverse-mode mapping from an observed origin URL to its local proxy
/// URL. Superseded mappings are retained for request correlation.
#[derive(Debug, Clone, Serialize)]
pub struct UrlMapping {
    pub original_url: String,
    pub proxy_url: String,
    pub process_id: String,
    pub process_name: String,
    /// Human label extracted from the log line that first produced the URL
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub superseded: bool,
}

/// Request-scoped capture record, kept in a bounded ring.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyRequestRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub process_id: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub duration_ms: u64,
    pub response_size: usize,
    pub injected: bool,
}

/// Active and superseded URL mappings, shared between the proxy listeners
/// and the telemetry collector (for session → process inference).
pub struct MappingTable {
    active: DashMap<String, UrlMapping>,
    archive: Mutex<Vec<UrlMapping>>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            archive: Mutex::new(Vec::new()),
        }
    }

    /// Record a mapping. Re-registering an origin supersedes the previous
    /// mapping (archived) while keeping its proxy URL stable.
    pub fn upsert(&self, mut mapping: UrlMapping) -> UrlMapping {
        if let Some(mut existing) = self.active.get_mut(&mapping.original_url) {
            let mut old = existing.clone();
            old.superseded = true;
            self.archive.lock().unwrap().push(old);

            mapping.proxy_url = existing.proxy_url.clone();
            mapping.created_at = existing.created_at;
            *existing = mapping.clone();
            return mapping;
        }
        self.active.insert(mapping.original_url.clone(), mapping.clone());
        mapping
    }

    pub fn get(&self, original_url: &str) -> Option<UrlMapping> {
        self.active.get(original_url).map(|m| m.clone())
    }

    /// Point an existing mapping at a newly bound proxy URL (mode switch).
    pub fn set_proxy_url(&self, original_url: &str, proxy_url: String) {
        if let Some(mut mapping) = self.active.get_mut(original_url) {
            mapping.proxy_url = proxy_url;
        }
    }

    pub fn all(&self) -> Vec<UrlMapping> {
        let mut mappings: Vec<UrlMapping> = self.active.iter().map(|m| m.clone()).collect();
        mappings.sort_by_key(|m| m.created_at);
        mappings
    }

    pub fn contains(&self, original_url: &str) -> bool {
        self.active.contains_key(original_url)
    }

    /// Find the mapping whose proxy URL serves the given page URL.
    pub fn by_proxy_url(&self, page_url: &str) -> Option<UrlMapping> {
        self.active
            .iter()
            .find(|m| page_url.starts_with(&m.proxy_url))
            .map(|m| m.clone())
    }

    /// Find the mapping whose origin serves the given URL (full mode).
    pub fn by_original_url(&self, url: &str) -> Option<UrlMapping> {
        self.active
            .iter()
            .find(|m| url.starts_with(&m.original_url))
            .map(|m| m.clone())
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessResolver for MappingTable {
    fn resolve_process(&self, page_url: &str) -> Option<String> {
        self.by_proxy_url(page_url)
            .or_else(|| self.by_original_url(page_url))
            .map(|m| m.process_id)
    }
}
