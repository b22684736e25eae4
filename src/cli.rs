// CLI - command-line argument parsing
//
// Operands select a run mode: the default runs a full instance (supervisor,
// log pipeline, proxy, JSON-RPC endpoint); --mcp runs the hub over stdio
// instead. The TUI is an external consumer of the event bus, so --no-tui
// only acknowledges headless operation.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{CliOverrides, VERSION};

/// Brummer - run your project's scripts, watch their logs, proxy their traffic
#[derive(Debug, Parser)]
#[command(name = "brummer")]
#[command(version = VERSION)]
#[command(about = "Developer-facing supervisor for package.json projects", long_about = None)]
pub struct Cli {
    /// Run headless (no terminal UI)
    #[arg(long)]
    pub no_tui: bool,

    /// Serve the hub over stdio for JSON-RPC clients
    #[arg(long)]
    pub mcp: bool,

    /// Disable the JSON-RPC endpoint
    #[arg(long)]
    pub no_mcp: bool,

    /// Disable the proxy
    #[arg(long)]
    pub no_proxy: bool,

    /// JSON-RPC endpoint port
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Working directory (defaults to the current directory)
    #[arg(short = 'd', long = "dir")]
    pub dir: Option<PathBuf>,
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            port: self.port,
            no_mcp: self.no_mcp,
            no_proxy: self.no_proxy,
        }
    }

    /// Resolve the project directory: -d flag or the current directory.
    pub fn project_dir(&self) -> std::io::Result<PathBuf> {
        match &self.dir {
            Some(dir) => dir.canonicalize(),
            None => std::env::current_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["brummer"]);
        assert!(!cli.mcp);
        assert!(!cli.no_mcp);
        assert!(!cli.no_proxy);
        assert!(cli.port.is_none());
        assert!(cli.dir.is_none());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from(["brummer", "--no-tui", "--no-proxy", "-p", "8123", "-d", "/tmp"]);
        assert!(cli.no_tui);
        assert!(cli.no_proxy);
        assert_eq!(cli.port, Some(8123));
        assert_eq!(cli.dir.as_deref(), Some(std::path::Path::new("/tmp")));
    }

    #[test]
    fn test_mcp_mode() {
        let cli = Cli::parse_from(["brummer", "--mcp"]);
        assert!(cli.mcp);
    }
}
