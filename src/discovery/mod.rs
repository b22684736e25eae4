// Instance discovery - file-based rendezvous of running instances
//
// Each running instance writes <dir>/<instance-id>.json at startup and
// refreshes its timestamp every 5s. Readers poll the directory: files
// touched within 15s are live, older ones are ignored, and anything past
// 60s may be deleted by whichever reader sees it first. Writes go through a
// temp file + rename so readers never observe a half-written file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Files younger than this are live.
pub const FRESH_WINDOW: Duration = Duration::from_secs(15);

/// Files older than this are eligible for deletion by any reader.
pub const DELETE_AFTER: Duration = Duration::from_secs(60);

/// How often a registration refreshes its timestamp.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// One running brummer instance as advertised in the discovery directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    /// JSON-RPC port
    pub port: u16,
    #[serde(rename = "projectPath")]
    pub project_path: PathBuf,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
}

impl Instance {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) <= FRESH_WINDOW
    }
}

/// Default discovery directory under the platform data dir.
pub fn default_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("brummer")
        .join("instances")
}

/// Reader/writer for one discovery directory.
pub struct Discovery {
    dir: PathBuf,
    corrupt_files: AtomicU64,
}

impl Discovery {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            corrupt_files: AtomicU64::new(0),
        }
    }

    /// Corrupt files seen (and skipped) by this reader.
    pub fn corrupt_count(&self) -> u64 {
        self.corrupt_files.load(Ordering::Relaxed)
    }

    fn file_path(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("{instance_id}.json"))
    }

    /// Write an instance file atomically (temp file in the same directory,
    /// then rename).
    pub fn write(&self, instance: &Instance) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let target = self.file_path(&instance.instance_id);
        let tmp = self.dir.join(format!(
            ".{}.tmp-{}",
            instance.instance_id,
            std::process::id()
        ));
        let json = serde_json::to_string_pretty(instance)?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &target)
            .with_context(|| format!("failed to rename into {}", target.display()))?;
        Ok(())
    }

    pub fn remove(&self, instance_id: &str) {
        let _ = std::fs::remove_file(self.file_path(instance_id));
    }

    /// List live instances. Stale files are skipped; files past the delete
    /// window are removed; corrupt files are skipped and counted.
    pub fn list(&self) -> Vec<Instance> {
        let now = Utc::now();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut live = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = match std::fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(_) => continue,
            };
            let instance: Instance = match serde_json::from_str(&contents) {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::debug!(file = %path.display(), "corrupt discovery file: {e}");
                    self.corrupt_files.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let age = instance.age(now);
            if age > DELETE_AFTER {
                tracing::debug!(file = %path.display(), "deleting stale discovery file");
                let _ = std::fs::remove_file(&path);
            } else if instance.is_fresh(now) {
                live.push(instance);
            }
            // Between 15s and 60s: not live, not yet deletable
        }
        live.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        live
    }

    /// Look up one live instance by id.
    pub fn find(&self, instance_id: &str) -> Option<Instance> {
        self.list()
            .into_iter()
            .find(|i| i.instance_id == instance_id)
    }
}

/// A registered instance: writes its file and refreshes it until dropped or
/// explicitly deregistered.
pub struct Registration {
    discovery: std::sync::Arc<Discovery>,
    instance_id: String,
    shutdown: tokio::sync::watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    /// Write the instance file and start the 5s refresh loop.
    pub fn start(
        discovery: std::sync::Arc<Discovery>,
        port: u16,
        project_path: PathBuf,
    ) -> Result<Self> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let instance = Instance {
            instance_id: instance_id.clone(),
            port,
            project_path,
            last_seen: Utc::now(),
        };
        discovery.write(&instance)?;
        tracing::info!(instance = %instance_id, port, "registered in discovery directory");

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let refresher = discovery.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let refreshed = Instance {
                            last_seen: Utc::now(),
                            ..instance.clone()
                        };
                        if let Err(e) = refresher.write(&refreshed) {
                            tracing::warn!("discovery refresh failed: {e:#}");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(Self {
            discovery,
            instance_id,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Stop refreshing and remove the instance file.
    pub async fn deregister(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.discovery.remove(&self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn instance_with_age(id: &str, age: Duration) -> Instance {
        Instance {
            instance_id: id.to_string(),
            port: 7777,
            project_path: PathBuf::from("/tmp/project"),
            last_seen: Utc::now() - chrono::Duration::from_std(age).unwrap(),
        }
    }

    #[test]
    fn test_roundtrip_wire_format() {
        let instance = instance_with_age("i1", Duration::ZERO);
        let json = serde_json::to_string(&instance).unwrap();
        assert!(json.contains("\"instanceId\""));
        assert!(json.contains("\"projectPath\""));
        assert!(json.contains("\"lastSeen\""));
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, instance);
    }

    #[test]
    fn test_freshness_windows() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Discovery::new(dir.path().to_path_buf());

        discovery
            .write(&instance_with_age("live", Duration::from_secs(10)))
            .unwrap();
        discovery
            .write(&instance_with_age("stale", Duration::from_secs(20)))
            .unwrap();
        discovery
            .write(&instance_with_age("dead", Duration::from_secs(70)))
            .unwrap();

        let live = discovery.list();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].instance_id, "live");

        // 20s-old file survives the sweep; 70s-old file was deleted
        assert!(dir.path().join("stale.json").exists());
        assert!(!dir.path().join("dead.json").exists());
    }

    #[test]
    fn test_corrupt_file_skipped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Discovery::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        discovery
            .write(&instance_with_age("ok", Duration::ZERO))
            .unwrap();

        let live = discovery.list();
        assert_eq!(live.len(), 1);
        assert_eq!(discovery.corrupt_count(), 1);
    }

    #[test]
    fn test_non_json_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Discovery::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("README.txt"), "hello").unwrap();
        assert!(discovery.list().is_empty());
        assert_eq!(discovery.corrupt_count(), 0);
    }

    #[test]
    fn test_write_is_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Discovery::new(dir.path().to_path_buf());
        discovery
            .write(&instance_with_age("i1", Duration::ZERO))
            .unwrap();

        // No temp residue after a successful write
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(dir.path().join("i1.json").exists());
    }

    #[tokio::test]
    async fn test_registration_writes_and_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Arc::new(Discovery::new(dir.path().to_path_buf()));

        let registration =
            Registration::start(discovery.clone(), 7777, PathBuf::from("/tmp/p")).unwrap();
        let id = registration.instance_id().to_string();
        assert!(discovery.find(&id).is_some());

        registration.deregister().await;
        assert!(discovery.find(&id).is_none());
        assert!(!dir.path().join(format!("{id}.json")).exists());
    }
}
