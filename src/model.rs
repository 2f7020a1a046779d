use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Input of the `analyze` operation.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AnalysisRequest {
    /// Files or directories to analyze, relative to the server root or absolute inside it.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Recognized option name to value. Unknown keys are rejected.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl AnalysisRequest {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }
}

/// Captured output of a single checker process.
#[derive(Debug, Clone)]
pub struct RawToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u128,
}

impl RawToolOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn has_stderr(&self) -> bool {
        self.stderr.iter().any(|byte| !byte.is_ascii_whitespace())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Information,
    Unused,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Information => "information",
            Severity::Unused => "unused",
        }
    }

    /// Rank used by fail-on-severity thresholds. Unused code never trips a threshold.
    pub fn level(self) -> u8 {
        match self {
            Severity::Error => 3,
            Severity::Warning => 2,
            Severity::Information => 1,
            Severity::Unused => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanEnd {
    pub end_line: u32,
    pub end_column: u32,
}

/// One normalized finding. `line` and `column` are 1-based and `file_path`
/// is relative to the request root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<SpanEnd>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub error_count: usize,
    pub warning_count: usize,
    pub information_count: usize,
    pub unused_count: usize,
}

impl Summary {
    pub fn from_diagnostics(diagnostics: &[Diagnostic]) -> Self {
        let mut summary = Summary::default();
        for diagnostic in diagnostics {
            match diagnostic.severity {
                Severity::Error => summary.error_count += 1,
                Severity::Warning => summary.warning_count += 1,
                Severity::Information => summary.information_count += 1,
                Severity::Unused => summary.unused_count += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    Clean,
    Findings,
    Fatal,
    ConfigError,
    InvalidArguments,
    Crashed,
    Unknown,
}

/// Record of one checker process launched for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub project_root: String,
    pub command: Vec<String>,
    pub exit_code: Option<i32>,
    pub exit_class: ExitClass,
    /// Wall-clock time; varies between otherwise identical runs.
    pub duration_ms: u128,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checker_version: Option<String>,
    pub files_analyzed: usize,
    pub dropped_entries: usize,
    pub rejected_paths: usize,
    pub unknown_severities: usize,
    pub duplicates_removed: usize,
    pub used_fallback: bool,
    pub timed_out: bool,
    pub retried: bool,
    pub invocations: Vec<Invocation>,
}

/// Output of the `analyze` operation. Immutable once built by the dispatcher.
///
/// Repeating a request against unchanged sources reproduces every field
/// except the timings (`duration_ms` here and in each invocation record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    pub summary: Summary,
    pub diagnostics: Vec<Diagnostic>,
    pub tool_exit_code: i32,
    pub truncated: bool,
    pub root: String,
    pub duration_ms: u128,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailOn {
    #[default]
    None,
    Information,
    Warning,
    Error,
}

impl FailOn {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(FailOn::None),
            "information" | "info" => Some(FailOn::Information),
            "warning" => Some(FailOn::Warning),
            "error" => Some(FailOn::Error),
            _ => None,
        }
    }

    fn threshold(self) -> Option<u8> {
        match self {
            FailOn::None => None,
            FailOn::Information => Some(1),
            FailOn::Warning => Some(2),
            FailOn::Error => Some(3),
        }
    }

    /// Returns `(ok, fail_reason)` for the given diagnostics.
    pub fn evaluate(self, diagnostics: &[Diagnostic]) -> (bool, Option<String>) {
        let Some(threshold) = self.threshold() else {
            return (true, None);
        };
        let max_level = diagnostics
            .iter()
            .map(|diagnostic| diagnostic.severity.level())
            .max()
            .unwrap_or(0);
        if max_level >= threshold {
            let name = serde_json::to_value(self)
                .ok()
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_default();
            (
                false,
                Some(format!(
                    "fail_on_severity '{name}' breached (max_severity_level={max_level})"
                )),
            )
        } else {
            (true, None)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigKind {
    #[serde(rename = "pyrightconfig.json")]
    PyrightConfig,
    #[serde(rename = "pyproject.toml")]
    Pyproject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindConfigResult {
    pub found: bool,
    pub config_path: Option<String>,
    pub kind: Option<ConfigKind>,
    pub resolve_dir: String,
    pub searched_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub executable_path: String,
    pub supports_outputjson: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(severity: Severity) -> Diagnostic {
        Diagnostic {
            file_path: "a.py".to_string(),
            line: 1,
            column: 1,
            severity,
            message: "m".to_string(),
            rule: None,
            range: None,
            fingerprint: String::new(),
        }
    }

    #[test]
    fn summary_counts_each_severity() {
        let diags = vec![
            diag(Severity::Error),
            diag(Severity::Error),
            diag(Severity::Warning),
            diag(Severity::Unused),
        ];
        let summary = Summary::from_diagnostics(&diags);
        assert_eq!(summary.error_count, 2);
        assert_eq!(summary.warning_count, 1);
        assert_eq!(summary.information_count, 0);
        assert_eq!(summary.unused_count, 1);
    }

    #[test]
    fn fail_on_threshold() {
        let diags = vec![diag(Severity::Warning)];
        assert_eq!(FailOn::None.evaluate(&diags), (true, None));
        assert!(FailOn::Error.evaluate(&diags).0);
        let (ok, reason) = FailOn::Warning.evaluate(&diags);
        assert!(!ok);
        assert!(reason.unwrap().contains("'warning'"));
        assert!(FailOn::Information.evaluate(&[diag(Severity::Unused)]).0);
    }

    #[test]
    fn severity_serializes_lowercase() {
        let value = serde_json::to_value(Severity::Information).unwrap();
        assert_eq!(value, serde_json::json!("information"));
    }
}
