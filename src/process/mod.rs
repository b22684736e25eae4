// Process supervisor - spawns scripts/commands, streams output, tracks status
//
// Children are spawned through the detected package manager (scripts) or
// directly (commands). Each child gets two stream-reader tasks feeding the
// log ingest channel and one waiter task that owns the Child handle and
// records the terminal state. Status reads go through an atomically swapped
// snapshot pointer, so a multi-field read never observes a torn state;
// writes are serialized per process.

pub mod stream;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::detector::{Detection, Manifest};
use crate::events::{generate_id, Event};
use crate::logs::{IngestLine, LogIngest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Pending,
    Running,
    Exited,
    Failed,
    Killed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Exited | ProcessStatus::Failed | ProcessStatus::Killed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Running => "running",
            ProcessStatus::Exited => "exited",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Killed => "killed",
        }
    }
}

/// Consistent multi-field view of a process at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub id: String,
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Package manager used for script processes
    pub manager: Option<String>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Defined iff status is terminal (None for signal deaths)
    pub exit_code: Option<i32>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("no package.json found in {0}")]
    NoManifest(PathBuf),
    #[error("unknown script '{0}'")]
    UnknownScript(String),
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unknown process '{0}'")]
    Unknown(String),
    #[error("process '{0}' is still running")]
    StillRunning(String),
    #[error(transparent)]
    Start(#[from] StartError),
}

/// Original spawn parameters, kept for restart.
#[derive(Debug, Clone)]
struct SpawnSpec {
    name: String,
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
    manager: Option<String>,
}

struct ManagedProcess {
    id: String,
    spec: SpawnSpec,
    snapshot: ArcSwap<ProcessSnapshot>,
    /// Serializes snapshot writes for this process
    write_lock: std::sync::Mutex<()>,
    stop_requested: AtomicBool,
    pid: AtomicU32,
    /// One-shot trigger for force-kill; consumed by the waiter
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    status_tx: watch::Sender<ProcessStatus>,
}

impl ManagedProcess {
    fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot::clone(&self.snapshot.load())
    }

    /// pending → running, on first stream byte or the spawn timer.
    fn mark_running(&self, bus: &EventBus) {
        // Fast path: the readers call this for every line
        if self.snapshot.load().status != ProcessStatus::Pending {
            return;
        }
        let _guard = self.write_lock.lock().unwrap();
        let current = self.snapshot.load_full();
        if current.status != ProcessStatus::Pending {
            return;
        }
        let mut next = ProcessSnapshot::clone(&current);
        next.status = ProcessStatus::Running;
        self.snapshot.store(Arc::new(next));
        self.status_tx.send_replace(ProcessStatus::Running);

        bus.publish(Event::ProcessStarted {
            id: generate_id(),
            timestamp: Utc::now(),
            process_id: self.id.clone(),
            name: self.spec.name.clone(),
        });
    }

    /// Record the terminal state. Exit code and status land in one snapshot
    /// swap.
    fn mark_terminal(&self, status: ProcessStatus, exit_code: Option<i32>, bus: &EventBus) {
        debug_assert!(status.is_terminal());
        let _guard = self.write_lock.lock().unwrap();
        let current = self.snapshot.load_full();
        if current.status.is_terminal() {
            return;
        }
        let mut next = ProcessSnapshot::clone(&current);
        next.status = status;
        next.exit_code = exit_code;
        next.ended_at = Some(Utc::now());
        self.snapshot.store(Arc::new(next));
        self.status_tx.send_replace(status);

        bus.publish(Event::ProcessExited {
            id: generate_id(),
            timestamp: Utc::now(),
            process_id: self.id.clone(),
            name: self.spec.name.clone(),
            exit_code,
            status: status.as_str().to_string(),
        });
    }

    fn take_kill_trigger(&self) -> Option<oneshot::Sender<()>> {
        self.kill_tx.lock().unwrap().take()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    pub max_line: usize,
    /// Grace between the termination signal and force-kill
    pub stop_grace: Duration,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            max_line: stream::DEFAULT_MAX_LINE,
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Owner of all supervised child processes.
pub struct ProcessManager {
    processes: DashMap<String, Arc<ManagedProcess>>,
    ingest: LogIngest,
    bus: Arc<EventBus>,
    detection: Detection,
    config: ProcessManagerConfig,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessManager {
    pub fn new(
        detection: Detection,
        ingest: LogIngest,
        bus: Arc<EventBus>,
        config: ProcessManagerConfig,
    ) -> Self {
        Self {
            processes: DashMap::new(),
            ingest,
            bus,
            detection,
            config,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn detection(&self) -> &Detection {
        &self.detection
    }

    /// Start a named manifest script through the detected package manager.
    pub fn start_script(&self, script: &str) -> Result<ProcessSnapshot, StartError> {
        let dir = &self.detection.project_dir;
        let manifest = Manifest::load(dir)
            .ok()
            .flatten()
            .ok_or_else(|| StartError::NoManifest(dir.clone()))?;
        if !manifest.scripts.contains_key(script) {
            return Err(StartError::UnknownScript(script.to_string()));
        }

        let manager = self.detection.manager;
        self.spawn(SpawnSpec {
            name: script.to_string(),
            program: manager.command().to_string(),
            args: manager.run_script_args(script),
            cwd: dir.clone(),
            manager: Some(manager.command().to_string()),
        })
    }

    /// Start an arbitrary command under supervision.
    pub fn start_command(
        &self,
        name: &str,
        program: &str,
        args: Vec<String>,
    ) -> Result<ProcessSnapshot, StartError> {
        self.spawn(SpawnSpec {
            name: name.to_string(),
            program: program.to_string(),
            args,
            cwd: self.detection.project_dir.clone(),
            manager: None,
        })
    }

    fn spawn(&self, spec: SpawnSpec) -> Result<ProcessSnapshot, StartError> {
        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| StartError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let id = uuid::Uuid::new_v4().to_string();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (status_tx, _) = watch::channel(ProcessStatus::Pending);

        let snapshot = ProcessSnapshot {
            id: id.clone(),
            name: spec.name.clone(),
            program: spec.program.clone(),
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
            manager: spec.manager.clone(),
            status: ProcessStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
        };

        let managed = Arc::new(ManagedProcess {
            id: id.clone(),
            spec,
            snapshot: ArcSwap::from_pointee(snapshot.clone()),
            write_lock: std::sync::Mutex::new(()),
            stop_requested: AtomicBool::new(false),
            pid: AtomicU32::new(child.id().unwrap_or(0)),
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            status_tx,
        });
        self.processes.insert(id.clone(), managed.clone());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max_line = self.config.max_line;

        let stdout_handle = self.spawn_reader(managed.clone(), stdout, false, max_line);
        let stderr_handle = self.spawn_reader(managed.clone(), stderr, true, max_line);

        // running no later than 100ms after spawn, even for silent children
        {
            let managed = managed.clone();
            let bus = self.bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                managed.mark_running(&bus);
            });
        }

        // Waiter owns the child: reaps it, joins the readers, and records
        // the terminal state after both streams are closed.
        let waiter = {
            let managed = managed.clone();
            let bus = self.bus.clone();
            let ingest = self.ingest.clone();
            tokio::spawn(async move {
                let wait_result = tokio::select! {
                    result = child.wait() => result,
                    _ = kill_rx => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };

                let _ = stdout_handle.await;
                let _ = stderr_handle.await;
                ingest.store().flush_process(&managed.id);

                let (status, code) = match wait_result {
                    Ok(exit) => {
                        let code = exit.code();
                        if managed.stop_requested.load(Ordering::Acquire) {
                            (ProcessStatus::Killed, code)
                        } else if exit.success() {
                            (ProcessStatus::Exited, code)
                        } else {
                            (ProcessStatus::Failed, code)
                        }
                    }
                    Err(e) => {
                        tracing::error!(process = %managed.id, "wait failed: {e}");
                        (ProcessStatus::Failed, None)
                    }
                };
                managed.mark_terminal(status, code, &bus);
            })
        };
        self.tasks.lock().unwrap().push(waiter);

        Ok(snapshot)
    }

    fn spawn_reader<R>(
        &self,
        managed: Arc<ManagedProcess>,
        pipe: Option<R>,
        is_error: bool,
        max_line: usize,
    ) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let bus = self.bus.clone();
        let ingest = self.ingest.clone();
        tokio::spawn(async move {
            let Some(pipe) = pipe else { return };
            let result = stream::pump_lines(pipe, max_line, |line| {
                managed.mark_running(&bus);
                ingest.send(IngestLine {
                    process_id: managed.id.clone(),
                    process_name: managed.spec.name.clone(),
                    content: line,
                    is_error,
                });
            })
            .await;
            // Reader errors terminate this reader only; the terminal status
            // still comes from wait().
            if let Err(e) = result {
                tracing::warn!(process = %managed.id, is_error, "stream reader error: {e}");
            }
        })
    }

    /// Request termination. Idempotent; escalates to force-kill after the
    /// configured grace period.
    pub fn stop(&self, id: &str) -> Result<(), ProcessError> {
        let managed = self
            .processes
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| ProcessError::Unknown(id.to_string()))?;

        if managed.snapshot().status.is_terminal() {
            return Ok(());
        }
        managed.stop_requested.store(true, Ordering::Release);

        if !send_term_signal(&managed) {
            // Signal failed twice: skip the grace period entirely
            if let Some(trigger) = managed.take_kill_trigger() {
                let _ = trigger.send(());
            }
            return Ok(());
        }

        let grace = self.config.stop_grace;
        tokio::spawn(async move {
            let mut status_rx = managed.status_tx.subscribe();
            let terminal = status_rx.wait_for(|s| s.is_terminal());
            if tokio::time::timeout(grace, terminal).await.is_err() {
                tracing::warn!(process = %managed.id, "grace expired, force-killing");
                if let Some(trigger) = managed.take_kill_trigger() {
                    let _ = trigger.send(());
                }
            }
        });
        Ok(())
    }

    /// Stop + start with the original parameters. Returns the snapshot of
    /// the replacement process.
    pub async fn restart(&self, id: &str) -> Result<ProcessSnapshot, ProcessError> {
        let managed = self
            .processes
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| ProcessError::Unknown(id.to_string()))?;
        let spec = managed.spec.clone();

        self.stop(id)?;
        let mut status_rx = managed.status_tx.subscribe();
        let deadline = self.config.stop_grace + Duration::from_secs(2);
        let _ = tokio::time::timeout(deadline, status_rx.wait_for(|s| s.is_terminal())).await;

        Ok(self.spawn(spec)?)
    }

    /// Wait until a process reaches a terminal state.
    pub async fn wait(&self, id: &str) -> Result<ProcessSnapshot, ProcessError> {
        let managed = self
            .processes
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| ProcessError::Unknown(id.to_string()))?;
        let mut status_rx = managed.status_tx.subscribe();
        let _ = status_rx.wait_for(|s| s.is_terminal()).await;
        Ok(managed.snapshot())
    }

    pub fn get(&self, id: &str) -> Option<ProcessSnapshot> {
        self.processes.get(id).map(|p| p.snapshot())
    }

    pub fn list(&self) -> Vec<ProcessSnapshot> {
        let mut all: Vec<ProcessSnapshot> =
            self.processes.iter().map(|p| p.snapshot()).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Remove a terminal process from the registry.
    pub fn remove(&self, id: &str) -> Result<(), ProcessError> {
        let terminal = self
            .processes
            .get(id)
            .map(|p| p.snapshot().status.is_terminal())
            .ok_or_else(|| ProcessError::Unknown(id.to_string()))?;
        if !terminal {
            return Err(ProcessError::StillRunning(id.to_string()));
        }
        self.processes.remove(id);
        Ok(())
    }

    /// Stop all children and wait for their streams to drain.
    pub async fn cleanup(&self) {
        let ids: Vec<String> = self.processes.iter().map(|p| p.id.clone()).collect();
        for id in &ids {
            let _ = self.stop(id);
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap();
            guard.drain(..).collect()
        };
        let deadline = self.config.stop_grace + Duration::from_secs(5);
        let join_all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            tracing::warn!("cleanup deadline expired with tasks still running");
        }
    }
}

/// Send the platform termination signal, retrying once. Returns false when
/// both attempts failed.
#[cfg(unix)]
fn send_term_signal(managed: &ManagedProcess) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = managed.pid.load(Ordering::Acquire);
    if pid == 0 {
        return false;
    }
    let target = Pid::from_raw(pid as i32);
    for attempt in 0..2 {
        match kill(target, Signal::SIGTERM) {
            Ok(()) => return true,
            Err(e) => {
                tracing::warn!(process = %managed.id, attempt, "SIGTERM failed: {e}");
            }
        }
    }
    false
}

#[cfg(not(unix))]
fn send_term_signal(_managed: &ManagedProcess) -> bool {
    // No soft termination signal; the caller falls through to force-kill
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectionSource, PackageManager};
    use crate::logs::{spawn_ingest, LogStore, LogStoreConfig};

    fn fixture(dir: &std::path::Path) -> (Arc<ProcessManager>, Arc<LogStore>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::with_workers(2));
        let store = Arc::new(LogStore::new(LogStoreConfig::default(), bus.clone()));
        let (ingest, _handle) = spawn_ingest(store.clone(), 256);
        let detection = Detection {
            manager: PackageManager::Npm,
            source: DetectionSource::Fallback,
            project_dir: dir.to_path_buf(),
        };
        let manager = Arc::new(ProcessManager::new(
            detection,
            ingest,
            bus.clone(),
            ProcessManagerConfig {
                max_line: stream::DEFAULT_MAX_LINE,
                stop_grace: Duration::from_millis(500),
            },
        ));
        (manager, store, bus)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store, _bus) = fixture(dir.path());

        let snapshot = manager
            .start_command("hello", "sh", vec!["-c".into(), "echo hi".into()])
            .unwrap();
        assert_eq!(snapshot.status, ProcessStatus::Pending);
        assert!(snapshot.exit_code.is_none());

        let finished = manager.wait(&snapshot.id).await.unwrap();
        assert_eq!(finished.status, ProcessStatus::Exited);
        assert_eq!(finished.exit_code, Some(0));
        assert!(finished.ended_at.is_some());
        assert!(finished.ended_at.unwrap() >= finished.started_at);

        // Output reaches the store asynchronously
        tokio::time::sleep(Duration::from_millis(100)).await;
        let logs = store.get_by_process(&snapshot.id);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].content, "hi");
        assert!(!logs[0].is_error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _bus) = fixture(dir.path());

        let snapshot = manager
            .start_command("boom", "sh", vec!["-c".into(), "exit 3".into()])
            .unwrap();
        let finished = manager.wait(&snapshot.id).await.unwrap();
        assert_eq!(finished.status, ProcessStatus::Failed);
        assert_eq!(finished.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_lines_marked_error() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, store, _bus) = fixture(dir.path());

        let snapshot = manager
            .start_command("err", "sh", vec!["-c".into(), "echo oops 1>&2".into()])
            .unwrap();
        manager.wait(&snapshot.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let logs = store.get_by_process(&snapshot.id);
        assert_eq!(logs.len(), 1);
        assert!(logs[0].is_error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_silent_process_becomes_killed() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _bus) = fixture(dir.path());

        // A child that never writes a byte
        let snapshot = manager
            .start_command("sleeper", "sleep", vec!["30".into()])
            .unwrap();
        manager.stop(&snapshot.id).unwrap();

        let finished = manager.wait(&snapshot.id).await.unwrap();
        assert_eq!(finished.status, ProcessStatus::Killed);
        assert!(finished.ended_at.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _bus) = fixture(dir.path());

        let snapshot = manager
            .start_command("sleeper", "sleep", vec!["30".into()])
            .unwrap();
        manager.stop(&snapshot.id).unwrap();
        manager.wait(&snapshot.id).await.unwrap();
        // Stopping a terminal process is a no-op, not an error
        manager.stop(&snapshot.id).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_spawns_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _bus) = fixture(dir.path());

        let first = manager
            .start_command("sleeper", "sleep", vec!["30".into()])
            .unwrap();
        let second = manager.restart(&first.id).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.name, "sleeper");
        assert_eq!(second.args, vec!["30".to_string()]);

        let old = manager.get(&first.id).unwrap();
        assert_eq!(old.status, ProcessStatus::Killed);
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _bus) = fixture(dir.path());

        let result =
            manager.start_command("ghost", "definitely-not-a-real-binary-xyz", Vec::new());
        assert!(matches!(result, Err(StartError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_unknown_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "node server.js"}}"#,
        )
        .unwrap();
        let (manager, _store, _bus) = fixture(dir.path());

        assert!(matches!(
            manager.start_script("build"),
            Err(StartError::UnknownScript(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _bus) = fixture(dir.path());
        assert!(matches!(
            manager.start_script("dev"),
            Err(StartError::NoManifest(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_requires_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _bus) = fixture(dir.path());

        let snapshot = manager
            .start_command("sleeper", "sleep", vec!["30".into()])
            .unwrap();
        assert!(matches!(
            manager.remove(&snapshot.id),
            Err(ProcessError::StillRunning(_))
        ));

        manager.stop(&snapshot.id).unwrap();
        manager.wait(&snapshot.id).await.unwrap();
        manager.remove(&snapshot.id).unwrap();
        assert!(manager.get(&snapshot.id).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cleanup_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _store, _bus) = fixture(dir.path());

        for i in 0..3 {
            manager
                .start_command(&format!("sleeper-{}", i), "sleep", vec!["30".into()])
                .unwrap();
        }
        manager.cleanup().await;
        for snapshot in manager.list() {
            assert!(snapshot.status.is_terminal());
        }
    }
}
