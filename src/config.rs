// Process-wide configuration for the analysis server.
// Read once from environment variables at startup, then passed around by value.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PYRIGHT: &str = "PYRIGHT_MCP_PYRIGHT";
pub const ENV_TIMEOUT_MS: &str = "PYRIGHT_MCP_TIMEOUT_MS";
pub const ENV_MAX_TIMEOUT_MS: &str = "PYRIGHT_MCP_MAX_TIMEOUT_MS";
pub const ENV_MAX_CONCURRENT: &str = "PYRIGHT_MCP_MAX_CONCURRENT";
pub const ENV_ROOTS: &str = "PYRIGHT_MCP_ROOTS";
pub const ENV_RETRY_ON_TIMEOUT: &str = "PYRIGHT_MCP_RETRY_ON_TIMEOUT";

/// How to launch the checker: a program plus fixed leading arguments
/// (e.g. `python -m pyright`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<OsString>,
}

impl CheckerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(
            self.prefix_args
                .iter()
                .map(|arg| arg.to_string_lossy().to_string()),
        );
        parts.join(" ")
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Checker executable (PYRIGHT_MCP_PYRIGHT, else discovered)
    pub checker: Option<CheckerCommand>,

    /// Per-call timeout when the request sets none (PYRIGHT_MCP_TIMEOUT_MS)
    pub default_timeout: Duration,

    /// Upper bound accepted for a request's `timeout_ms` (PYRIGHT_MCP_MAX_TIMEOUT_MS)
    pub max_timeout: Duration,

    /// Maximum checker processes alive at once (PYRIGHT_MCP_MAX_CONCURRENT)
    pub max_concurrent: usize,

    /// Directories targets must resolve into (PYRIGHT_MCP_ROOTS)
    pub allowed_roots: Vec<PathBuf>,

    /// Retry a timed-out invocation once before giving up (PYRIGHT_MCP_RETRY_ON_TIMEOUT)
    pub retry_on_timeout: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checker: None,
            default_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(600),
            max_concurrent: 4,
            allowed_roots: Vec::new(),
            retry_on_timeout: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// current directory as the only allowed root.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(ms) = env_parse::<u64>(ENV_TIMEOUT_MS, config.default_timeout.as_millis()) {
            config.default_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_parse::<u64>(ENV_MAX_TIMEOUT_MS, config.max_timeout.as_millis()) {
            config.max_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(value) = env_parse::<usize>(ENV_MAX_CONCURRENT, config.max_concurrent) {
            config.max_concurrent = value.max(1);
        }
        if let Ok(val) = env::var(ENV_RETRY_ON_TIMEOUT) {
            match parse_bool(&val) {
                Some(flag) => config.retry_on_timeout = flag,
                None => tracing::warn!(
                    "invalid {ENV_RETRY_ON_TIMEOUT} value: {val}, using default: {}",
                    config.retry_on_timeout
                ),
            }
        }

        let roots: Vec<PathBuf> = match env::var_os(ENV_ROOTS) {
            Some(raw) => env::split_paths(&raw).collect(),
            None => env::current_dir().into_iter().collect(),
        };
        config
            .with_allowed_roots(roots)
            .with_discovered_checker()
    }

    /// Replace the allowed roots, canonicalizing each and skipping ones that do not exist.
    pub fn with_allowed_roots<I>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut out: Vec<PathBuf> = Vec::new();
        for root in roots {
            match root.canonicalize() {
                Ok(canonical) if canonical.is_dir() => {
                    if !out.contains(&canonical) {
                        out.push(canonical);
                    }
                }
                Ok(_) => tracing::warn!("allowed root {} is not a directory", root.display()),
                Err(err) => tracing::warn!("skipping allowed root {}: {err}", root.display()),
            }
        }
        self.allowed_roots = out;
        self
    }

    /// Resolve the checker from `PYRIGHT_MCP_PYRIGHT`, else discover it
    /// relative to the current primary root. Call again after replacing the roots.
    pub fn with_discovered_checker(mut self) -> Self {
        self.checker = match env::var_os(ENV_PYRIGHT) {
            Some(raw) if !raw.is_empty() => Some(CheckerCommand::new(PathBuf::from(raw))),
            _ => discover_checker(self.primary_root()),
        };
        self
    }

    pub fn with_checker(mut self, checker: CheckerCommand) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// First allowed root; relative targets resolve against it.
    pub fn primary_root(&self) -> Option<&Path> {
        self.allowed_roots.first().map(PathBuf::as_path)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: impl std::fmt::Display) -> Option<T> {
    let val = env::var(name).ok()?;
    match val.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("invalid {name} value: {val}, using default: {default}");
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Locate pyright: `PATH` first, then a project-local virtualenv.
pub fn discover_checker(root: Option<&Path>) -> Option<CheckerCommand> {
    if let Ok(path) = which::which("pyright") {
        return Some(CheckerCommand::new(path));
    }
    let root = root?;
    let candidates = [
        root.join(".venv").join("bin").join("pyright"),
        root.join("venv").join("bin").join("pyright"),
        root.join(".venv").join("Scripts").join("pyright.exe"),
        root.join("venv").join("Scripts").join("pyright.exe"),
    ];
    candidates
        .into_iter()
        .find(|path| path.is_file())
        .map(CheckerCommand::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.default_timeout, Duration::from_secs(60));
        assert_eq!(config.max_timeout, Duration::from_secs(600));
        assert_eq!(config.max_concurrent, 4);
        assert!(config.checker.is_none());
        assert!(!config.retry_on_timeout);
    }

    #[test]
    fn allowed_roots_are_canonical_and_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("..");
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        let config = Config::default().with_allowed_roots(vec![
            dir.path().to_path_buf(),
            nested,
            dir.path().join("missing"),
        ]);
        assert_eq!(config.allowed_roots.len(), 1);
        assert_eq!(
            config.allowed_roots[0],
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn venv_checker_is_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(".venv").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("pyright"), "").unwrap();
        let found = discover_checker(Some(dir.path()));
        // A pyright on PATH takes precedence; only assert when none is installed.
        if which::which("pyright").is_err() {
            assert_eq!(found, Some(CheckerCommand::new(bin.join("pyright"))));
        }
    }

    #[test]
    fn parse_bool_values() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn checker_display_includes_prefix() {
        let checker = CheckerCommand::new("python3").with_prefix_args(["-m", "pyright"]);
        assert_eq!(checker.display(), "python3 -m pyright");
    }
}
