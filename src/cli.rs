use crate::config::{CheckerCommand, Config};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "pyright-mcp",
    version,
    about = "Serve pyright diagnostics to agents over MCP",
    after_help = r#"Examples:
  pyright-mcp serve --root .
  pyright-mcp check pkg/a.py --fail-on-severity error
  pyright-mcp check src --exclude 'tests/**' --timeout-ms 120000
  pyright-mcp version
  pyright-mcp find-config services/api

Environment:
  PYRIGHT_MCP_PYRIGHT, PYRIGHT_MCP_TIMEOUT_MS, PYRIGHT_MCP_MAX_TIMEOUT_MS,
  PYRIGHT_MCP_MAX_CONCURRENT, PYRIGHT_MCP_ROOTS, PYRIGHT_MCP_RETRY_ON_TIMEOUT,
  PYRIGHT_MCP_LOG (tracing filter, logs go to stderr)
"#
)]
pub struct Args {
    /// Log debug output to stderr (overridden by PYRIGHT_MCP_LOG).
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

/// Settings shared by every subcommand; each one overrides the environment.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Allowed root for targets (repeatable). The first one resolves relative targets.
    #[arg(long = "root")]
    pub roots: Vec<PathBuf>,
    /// Path to the pyright executable.
    #[arg(long)]
    pub pyright: Option<PathBuf>,
    /// Default per-call timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Maximum pyright processes running at once.
    #[arg(long)]
    pub max_concurrent: Option<usize>,
    /// Retry a timed-out run once.
    #[arg(long)]
    pub retry_on_timeout: bool,
}

impl ServerArgs {
    /// Environment first, then flags on top.
    pub fn into_config(self) -> Config {
        let mut config = Config::from_env();
        if !self.roots.is_empty() {
            config = config
                .with_allowed_roots(self.roots)
                .with_discovered_checker();
        }
        if let Some(path) = self.pyright {
            config = config.with_checker(CheckerCommand::new(path));
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_default_timeout(Duration::from_millis(ms.max(1)));
        }
        if let Some(max) = self.max_concurrent {
            config = config.with_max_concurrent(max);
        }
        if self.retry_on_timeout {
            config = config.with_retry_on_timeout(true);
        }
        config
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the MCP server over stdin/stdout.
    Serve {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Analyze targets once, print the result JSON and exit non-zero on failure.
    Check {
        /// Files or directories, relative to the first root.
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        python_version: Option<String>,
        #[arg(long)]
        python_platform: Option<String>,
        /// none|information|warning|error
        #[arg(long)]
        fail_on_severity: Option<String>,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Print the configured pyright version.
    Version {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Show which pyright config applies to a directory.
    FindConfig {
        /// Start directory, relative to the first root.
        start_dir: Option<String>,
        #[command(flatten)]
        server: ServerArgs,
    },
}
