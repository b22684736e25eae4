//! Configuration for brummer
//!
//! Sources, most-specific wins:
//! 1. Command-line flags (highest priority)
//! 2. `BRUMMER_*` environment variables
//! 3. `.brum.toml` in the working directory
//! 4. `.brum.toml` in ancestor directories, walked toward the root
//! 5. Built-in defaults (lowest priority)
//!
//! Files merge key-by-key: a key set closer to the working directory
//! shadows the same key set further up. Unknown keys are preserved but
//! warned about.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::detector::PackageManager;
use crate::proxy::ProxyMode;

/// Config file name looked up in the working directory and its ancestors.
pub const CONFIG_FILE: &str = ".brum.toml";

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Project directory the supervisor operates in
    pub project_dir: PathBuf,

    /// User's package manager choice; None means detect
    pub preferred_package_manager: Option<PackageManager>,

    /// JSON-RPC endpoint port
    pub mcp_port: u16,

    /// Forward-proxy port (full mode)
    pub proxy_port: u16,

    pub proxy_mode: ProxyMode,

    /// Disable the JSON-RPC endpoint
    pub no_mcp: bool,

    /// Disable the proxy
    pub no_proxy: bool,

    /// Global log store capacity
    pub max_logs: usize,

    /// Discovery directory for instance files
    pub instances_dir: PathBuf,

    /// Directory of annotated user scripts
    pub scripts_dir: PathBuf,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default tracing filter level when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            preferred_package_manager: None,
            mcp_port: 7777,
            proxy_port: 19888,
            proxy_mode: ProxyMode::Reverse,
            no_mcp: false,
            no_proxy: false,
            max_logs: 10_000,
            instances_dir: crate::discovery::default_dir(),
            scripts_dir: crate::scripts::ScriptsLibrary::default_dir(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Flag values that override everything else.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub no_mcp: bool,
    pub no_proxy: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Keys `.brum.toml` may set. Every field is optional so files can be merged
/// key-by-key.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FileConfig {
    pub preferred_package_manager: Option<String>,
    pub mcp_port: Option<u16>,
    pub proxy_port: Option<u16>,
    pub proxy_mode: Option<String>,
    pub no_mcp: Option<bool>,
    pub no_proxy: Option<bool>,
    pub max_logs: Option<usize>,
    pub instances_dir: Option<String>,
    pub scripts_dir: Option<String>,
    pub logging: Option<FileLogging>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FileLogging {
    pub level: Option<String>,
}

const KNOWN_KEYS: &[&str] = &[
    "preferred_package_manager",
    "mcp_port",
    "proxy_port",
    "proxy_mode",
    "no_mcp",
    "no_proxy",
    "max_logs",
    "instances_dir",
    "scripts_dir",
    "logging",
];

impl FileConfig {
    /// Overlay `self` (more specific) on top of `base` (less specific).
    fn over(self, base: FileConfig) -> FileConfig {
        FileConfig {
            preferred_package_manager: self
                .preferred_package_manager
                .or(base.preferred_package_manager),
            mcp_port: self.mcp_port.or(base.mcp_port),
            proxy_port: self.proxy_port.or(base.proxy_port),
            proxy_mode: self.proxy_mode.or(base.proxy_mode),
            no_mcp: self.no_mcp.or(base.no_mcp),
            no_proxy: self.no_proxy.or(base.no_proxy),
            max_logs: self.max_logs.or(base.max_logs),
            instances_dir: self.instances_dir.or(base.instances_dir),
            scripts_dir: self.scripts_dir.or(base.scripts_dir),
            logging: match (self.logging, base.logging) {
                (Some(local), Some(ancestor)) => Some(FileLogging {
                    level: local.level.or(ancestor.level),
                }),
                (local, ancestor) => local.or(ancestor),
            },
        }
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    // Unknown keys are warned about, not rejected
    if let Ok(value) = toml::from_str::<toml::Value>(&contents) {
        if let Some(table) = value.as_table() {
            for key in table.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(
                        file = %path.display(),
                        key,
                        "unknown configuration key (preserved, ignored)"
                    );
                }
            }
        }
    }

    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge `.brum.toml` files from the root down to `dir`: files closer to
/// `dir` shadow ancestor keys.
fn load_hierarchy(dir: &Path) -> Result<FileConfig, ConfigError> {
    let mut chain: Vec<PathBuf> = Vec::new();
    let mut current = Some(dir.to_path_buf());
    while let Some(d) = current {
        let candidate = d.join(CONFIG_FILE);
        if candidate.is_file() {
            chain.push(candidate);
        }
        current = d.parent().map(Path::to_path_buf);
    }

    // chain[0] is the most specific; fold from the root-most up
    let mut merged = FileConfig::default();
    for path in chain.into_iter().rev() {
        let file = load_file(&path)?;
        merged = file.over(merged);
    }
    Ok(merged)
}

impl Config {
    /// Load configuration for a project directory: files, then environment,
    /// then CLI flags.
    pub fn load(project_dir: &Path, cli: &CliOverrides) -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_sources(project_dir, cli, &env)
    }

    /// Deterministic loader used by `load` and by tests (explicit env map).
    pub(crate) fn from_sources(
        project_dir: &Path,
        cli: &CliOverrides,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let file = load_hierarchy(project_dir)?;
        let defaults = Config::default();

        let env_str = |key: &str| env.get(key).map(String::as_str);
        let env_parse = |key: &str| -> Result<Option<u64>, ConfigError> {
            match env_str(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: e.to_string(),
                    }),
                None => Ok(None),
            }
        };
        let env_flag = |key: &str| {
            env_str(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        // Package manager: env > file
        let preferred_package_manager = match env_str("BRUMMER_PACKAGE_MANAGER")
            .map(str::to_string)
            .or(file.preferred_package_manager)
        {
            Some(raw) => Some(PackageManager::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "preferred_package_manager".to_string(),
                    message: format!("unknown package manager '{raw}'"),
                }
            })?),
            None => None,
        };

        // Ports: flag > env > file > default
        let mcp_port = cli
            .port
            .or(env_parse("BRUMMER_MCP_PORT")?.map(|p| p as u16))
            .or(file.mcp_port)
            .unwrap_or(defaults.mcp_port);
        let proxy_port = env_parse("BRUMMER_PROXY_PORT")?
            .map(|p| p as u16)
            .or(file.proxy_port)
            .unwrap_or(defaults.proxy_port);

        let proxy_mode = match env_str("BRUMMER_PROXY_MODE")
            .map(str::to_string)
            .or(file.proxy_mode)
        {
            Some(raw) => raw
                .parse::<ProxyMode>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "proxy_mode".to_string(),
                    message,
                })?,
            None => defaults.proxy_mode,
        };

        let no_mcp = cli.no_mcp || env_flag("BRUMMER_NO_MCP") || file.no_mcp.unwrap_or(false);
        let no_proxy =
            cli.no_proxy || env_flag("BRUMMER_NO_PROXY") || file.no_proxy.unwrap_or(false);

        let max_logs = env_parse("BRUMMER_MAX_LOGS")?
            .map(|n| n as usize)
            .or(file.max_logs)
            .unwrap_or(defaults.max_logs);

        let instances_dir = env_str("BRUMMER_INSTANCES_DIR")
            .map(PathBuf::from)
            .or(file.instances_dir.map(PathBuf::from))
            .unwrap_or(defaults.instances_dir);

        let scripts_dir = file
            .scripts_dir
            .map(PathBuf::from)
            .unwrap_or(defaults.scripts_dir);

        let logging = LoggingConfig {
            level: file
                .logging
                .and_then(|l| l.level)
                .unwrap_or(defaults.logging.level),
        };

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            preferred_package_manager,
            mcp_port,
            proxy_port,
            proxy_mode,
            no_mcp,
            no_proxy,
            max_logs,
            instances_dir,
            scripts_dir,
            logging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            Config::from_sources(dir.path(), &CliOverrides::default(), &no_env()).unwrap();
        assert_eq!(config.mcp_port, 7777);
        assert_eq!(config.proxy_port, 19888);
        assert_eq!(config.proxy_mode, ProxyMode::Reverse);
        assert!(!config.no_mcp);
        assert!(!config.no_proxy);
        assert_eq!(config.max_logs, 10_000);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "mcp_port = 9000\nproxy_mode = \"full\"\nno_proxy = true\n",
        )
        .unwrap();
        let config =
            Config::from_sources(dir.path(), &CliOverrides::default(), &no_env()).unwrap();
        assert_eq!(config.mcp_port, 9000);
        assert_eq!(config.proxy_mode, ProxyMode::Full);
        assert!(config.no_proxy);
    }

    #[test]
    fn test_local_file_shadows_ancestor() {
        let root = tempfile::tempdir().unwrap();
        let child = root.path().join("workspace").join("app");
        std::fs::create_dir_all(&child).unwrap();

        std::fs::write(
            root.path().join(CONFIG_FILE),
            "mcp_port = 9000\nproxy_port = 20000\n",
        )
        .unwrap();
        std::fs::write(child.join(CONFIG_FILE), "mcp_port = 9001\n").unwrap();

        let config = Config::from_sources(&child, &CliOverrides::default(), &no_env()).unwrap();
        // Local key shadows the ancestor's; untouched ancestor keys survive
        assert_eq!(config.mcp_port, 9001);
        assert_eq!(config.proxy_port, 20000);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "mcp_port = 9000\n").unwrap();

        let mut env = no_env();
        env.insert("BRUMMER_MCP_PORT".to_string(), "9100".to_string());
        env.insert("BRUMMER_NO_PROXY".to_string(), "1".to_string());

        let config = Config::from_sources(dir.path(), &CliOverrides::default(), &env).unwrap();
        assert_eq!(config.mcp_port, 9100);
        assert!(config.no_proxy);
    }

    #[test]
    fn test_cli_overrides_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = no_env();
        env.insert("BRUMMER_MCP_PORT".to_string(), "9100".to_string());

        let cli = CliOverrides {
            port: Some(9200),
            ..Default::default()
        };
        let config = Config::from_sources(dir.path(), &cli, &env).unwrap();
        assert_eq!(config.mcp_port, 9200);
    }

    #[test]
    fn test_unknown_keys_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "mcp_port = 9000\nfancy_future_option = true\n",
        )
        .unwrap();
        let config =
            Config::from_sources(dir.path(), &CliOverrides::default(), &no_env()).unwrap();
        assert_eq!(config.mcp_port, 9000);
    }

    #[test]
    fn test_invalid_proxy_mode_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "proxy_mode = \"sideways\"\n").unwrap();
        let result = Config::from_sources(dir.path(), &CliOverrides::default(), &no_env());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_broken_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "mcp_port = [not toml\n").unwrap();
        let result = Config::from_sources(dir.path(), &CliOverrides::default(), &no_env());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_preferred_package_manager_parse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "preferred_package_manager = \"pnpm\"\n",
        )
        .unwrap();
        let config =
            Config::from_sources(dir.path(), &CliOverrides::default(), &no_env()).unwrap();
        assert_eq!(
            config.preferred_package_manager,
            Some(PackageManager::Pnpm)
        );
    }
}
