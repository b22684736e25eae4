// Package manager detection
//
// Chooses between npm/yarn/pnpm/bun for a project directory. Priority:
// explicit config preference, the manifest's `packageManager` field,
// `engines` hints, then lock-file probing. Installed-tool lookups run the
// candidate's `--version` under a 1s timeout and cache the result for the
// process lifetime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Deserialize;

/// Supported package managers, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
    Bun,
}

impl PackageManager {
    pub fn command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Bun => "bun",
        }
    }

    /// Argv prefix for running a named script, e.g. `npm run dev`.
    pub fn run_script_args(&self, script: &str) -> Vec<String> {
        match self {
            // yarn and bun accept the script name directly
            PackageManager::Yarn => vec!["run".to_string(), script.to_string()],
            PackageManager::Bun => vec!["run".to_string(), script.to_string()],
            PackageManager::Npm => vec!["run".to_string(), script.to_string()],
            PackageManager::Pnpm => vec!["run".to_string(), script.to_string()],
        }
    }

    pub fn lock_file(&self) -> &'static str {
        match self {
            PackageManager::Npm => "package-lock.json",
            PackageManager::Yarn => "yarn.lock",
            PackageManager::Pnpm => "pnpm-lock.yaml",
            PackageManager::Bun => "bun.lockb",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "npm" => Some(PackageManager::Npm),
            "yarn" => Some(PackageManager::Yarn),
            "pnpm" => Some(PackageManager::Pnpm),
            "bun" => Some(PackageManager::Bun),
            _ => None,
        }
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command())
    }
}

/// Lock-file probe order. Bun first: its lock file implies an explicit choice
/// that npm tooling would not have produced.
const LOCK_PROBE_ORDER: [PackageManager; 4] = [
    PackageManager::Bun,
    PackageManager::Pnpm,
    PackageManager::Yarn,
    PackageManager::Npm,
];

/// Engines-hint preference order.
const ENGINES_ORDER: [PackageManager; 4] = [
    PackageManager::Yarn,
    PackageManager::Pnpm,
    PackageManager::Bun,
    PackageManager::Npm,
];

/// Subset of package.json brummer cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scripts: HashMap<String, String>,
    /// `packageManager` field, format `name@version`
    #[serde(rename = "packageManager", default)]
    pub package_manager: Option<String>,
    #[serde(default)]
    pub engines: HashMap<String, String>,
}

impl Manifest {
    /// Load package.json from a project directory. Missing file is not an
    /// error; the caller decides whether scripts are required.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join("package.json");
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Manager named by the `packageManager` field, if any.
    fn declared_manager(&self) -> Option<PackageManager> {
        let field = self.package_manager.as_deref()?;
        let name = field.split('@').next()?;
        PackageManager::parse(name)
    }

    /// First engines hint in preference order.
    fn engines_hint(&self) -> Option<PackageManager> {
        ENGINES_ORDER
            .iter()
            .find(|mgr| self.engines.contains_key(mgr.command()))
            .copied()
    }
}

fn installed_cache() -> &'static DashMap<PackageManager, bool> {
    static CACHE: OnceLock<DashMap<PackageManager, bool>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Check whether a manager binary is runnable, with a 1s timeout. Results are
/// cached for the process lifetime.
pub async fn is_installed(manager: PackageManager) -> bool {
    if let Some(cached) = installed_cache().get(&manager) {
        return *cached;
    }

    let mut command = tokio::process::Command::new(manager.command());
    command
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let available = match tokio::time::timeout(Duration::from_secs(1), command.status()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(_)) => false,
        Err(_) => {
            tracing::debug!(manager = manager.command(), "version probe timed out");
            false
        }
    };

    installed_cache().insert(manager, available);
    available
}

/// Resolved detection result: the manager plus where the decision came from.
#[derive(Debug, Clone)]
pub struct Detection {
    pub manager: PackageManager,
    pub source: DetectionSource,
    pub project_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    ConfigPreference,
    ManifestField,
    EnginesHint,
    LockFile,
    Fallback,
}

/// Detect the package manager for a project directory.
///
/// `preference` is the user's configured choice and wins outright when the
/// tool is installed; an uninstalled preference falls through with a warning.
pub async fn detect(dir: &Path, preference: Option<PackageManager>) -> Detection {
    if let Some(preferred) = preference {
        if is_installed(preferred).await {
            return Detection {
                manager: preferred,
                source: DetectionSource::ConfigPreference,
                project_dir: dir.to_path_buf(),
            };
        }
        tracing::warn!(
            manager = preferred.command(),
            "preferred package manager not installed, falling back to detection"
        );
    }

    let manifest = Manifest::load(dir).unwrap_or_else(|e| {
        tracing::warn!("manifest unreadable: {e:#}");
        None
    });

    if let Some(manifest) = &manifest {
        if let Some(declared) = manifest.declared_manager() {
            return Detection {
                manager: declared,
                source: DetectionSource::ManifestField,
                project_dir: dir.to_path_buf(),
            };
        }
        if let Some(hint) = manifest.engines_hint() {
            if is_installed(hint).await {
                return Detection {
                    manager: hint,
                    source: DetectionSource::EnginesHint,
                    project_dir: dir.to_path_buf(),
                };
            }
        }
    }

    for candidate in LOCK_PROBE_ORDER {
        if dir.join(candidate.lock_file()).exists() {
            return Detection {
                manager: candidate,
                source: DetectionSource::LockFile,
                project_dir: dir.to_path_buf(),
            };
        }
    }

    Detection {
        manager: PackageManager::Npm,
        source: DetectionSource::Fallback,
        project_dir: dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, contents: &str) {
        std::fs::write(dir.join("package.json"), contents).unwrap();
    }

    #[tokio::test]
    async fn test_manifest_field_wins_over_lock_files() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), r#"{"packageManager": "pnpm@9.0.0"}"#);
        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();

        let detection = detect(dir.path(), None).await;
        assert_eq!(detection.manager, PackageManager::Pnpm);
        assert_eq!(detection.source, DetectionSource::ManifestField);
    }

    #[tokio::test]
    async fn test_lock_file_probe_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();
        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();

        let detection = detect(dir.path(), None).await;
        // pnpm's lock file precedes npm's in the probe order
        assert_eq!(detection.manager, PackageManager::Pnpm);
        assert_eq!(detection.source, DetectionSource::LockFile);
    }

    #[tokio::test]
    async fn test_fallback_is_npm() {
        let dir = tempfile::tempdir().unwrap();
        let detection = detect(dir.path(), None).await;
        assert_eq!(detection.manager, PackageManager::Npm);
        assert_eq!(detection.source, DetectionSource::Fallback);
    }

    #[test]
    fn test_manifest_scripts_parse() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"scripts": {"dev": "node server.js", "test": "jest"}}"#)
                .unwrap();
        assert_eq!(manifest.scripts.get("dev").unwrap(), "node server.js");
        assert_eq!(manifest.scripts.len(), 2);
    }

    #[test]
    fn test_declared_manager_parses_versioned_field() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"packageManager": "yarn@4.1.0"}"#).unwrap();
        assert_eq!(manifest.declared_manager(), Some(PackageManager::Yarn));
    }

    #[test]
    fn test_parse_rejects_unknown_manager() {
        assert_eq!(PackageManager::parse("cargo"), None);
        assert_eq!(PackageManager::parse("Bun"), Some(PackageManager::Bun));
    }
}
