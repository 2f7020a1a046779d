//! Request options and their mapping onto checker arguments.
//!
//! Every recognized option is listed in [`OPTION_TABLE`]. Unknown keys and
//! values of the wrong shape are validation errors, never silently dropped.

use crate::error::{AnalysisOutcome, Validation};
use crate::model::FailOn;
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    String,
    StringList,
    Integer,
}

#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    /// Checker flag the value is passed with; `None` for options consumed here.
    pub flag: Option<&'static str>,
    pub description: &'static str,
}

pub static OPTION_TABLE: &[OptionSpec] = &[
    OptionSpec {
        name: "python_version",
        kind: OptionKind::String,
        flag: Some("--pythonversion"),
        description: "Python version to analyze for, e.g. \"3.12\".",
    },
    OptionSpec {
        name: "python_platform",
        kind: OptionKind::String,
        flag: Some("--pythonplatform"),
        description: "Target platform: Linux, Windows, Darwin or All.",
    },
    OptionSpec {
        name: "venv_path",
        kind: OptionKind::String,
        flag: Some("--venvpath"),
        description: "Directory containing virtual environments, inside the allowed root.",
    },
    OptionSpec {
        name: "level",
        kind: OptionKind::String,
        flag: Some("--level"),
        description: "Minimum diagnostic level reported by the checker: error or warning.",
    },
    OptionSpec {
        name: "include",
        kind: OptionKind::StringList,
        flag: None,
        description: "Glob patterns selecting files under directory targets.",
    },
    OptionSpec {
        name: "exclude",
        kind: OptionKind::StringList,
        flag: None,
        description: "Glob patterns removing files from the selection.",
    },
    OptionSpec {
        name: "timeout_ms",
        kind: OptionKind::Integer,
        flag: None,
        description: "Per-call timeout in milliseconds.",
    },
    OptionSpec {
        name: "fail_on_severity",
        kind: OptionKind::String,
        flag: None,
        description: "none, information, warning or error; sets ok=false when breached.",
    },
];

const PLATFORMS: &[&str] = &["Linux", "Windows", "Darwin", "All"];
const LEVELS: &[&str] = &["error", "warning"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOptions {
    pub python_version: Option<String>,
    pub python_platform: Option<String>,
    pub venv_path: Option<PathBuf>,
    pub level: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub timeout: Option<Duration>,
    pub fail_on: FailOn,
}

impl CheckOptions {
    /// Validate and type the raw option map. `root` anchors relative paths.
    pub fn parse(
        raw: &BTreeMap<String, Value>,
        root: &Path,
        max_timeout: Duration,
    ) -> AnalysisOutcome<Self> {
        let mut validation = Validation::new();
        let mut options = CheckOptions::default();

        for (key, value) in raw {
            let field = format!("options.{key}");
            let Some(spec) = OPTION_TABLE.iter().find(|spec| spec.name == key) else {
                validation.add(
                    &field,
                    "unknown_option",
                    format!("unknown option '{key}'; expected one of {}", option_names()),
                );
                continue;
            };
            if value.is_null() {
                continue;
            }
            match spec.kind {
                OptionKind::String => {
                    let Some(text) = value.as_str().map(str::trim) else {
                        validation.add(&field, "invalid_type", "expected a string");
                        continue;
                    };
                    apply_string(&mut options, &mut validation, &field, key, text, root);
                }
                OptionKind::StringList => {
                    let Some(items) = string_list(value) else {
                        validation.add(&field, "invalid_type", "expected an array of strings");
                        continue;
                    };
                    if items.iter().any(|item| item.trim().is_empty()) {
                        validation.add(&field, "invalid_value", "patterns must be non-empty");
                        continue;
                    }
                    if key == "include" {
                        options.include = items;
                    } else {
                        options.exclude = items;
                    }
                }
                OptionKind::Integer => {
                    let Some(ms) = value.as_u64() else {
                        validation.add(&field, "invalid_type", "expected a positive integer");
                        continue;
                    };
                    let max_ms = u64::try_from(max_timeout.as_millis()).unwrap_or(u64::MAX);
                    if ms == 0 || ms > max_ms {
                        validation.add(
                            &field,
                            "out_of_range",
                            format!("timeout_ms must be between 1 and {max_ms}"),
                        );
                        continue;
                    }
                    options.timeout = Some(Duration::from_millis(ms));
                }
            }
        }

        validation.into_result()?;
        Ok(options)
    }

    /// Checker flags for this option set, in table order.
    pub fn checker_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        for spec in OPTION_TABLE {
            let Some(flag) = spec.flag else {
                continue;
            };
            let value: Option<OsString> = match spec.name {
                "python_version" => self.python_version.clone().map(Into::into),
                "python_platform" => self.python_platform.clone().map(Into::into),
                "venv_path" => self.venv_path.clone().map(PathBuf::into_os_string),
                "level" => self.level.clone().map(Into::into),
                _ => None,
            };
            if let Some(value) = value {
                args.push(OsString::from(flag));
                args.push(value);
            }
        }
        args
    }
}

fn apply_string(
    options: &mut CheckOptions,
    validation: &mut Validation,
    field: &str,
    key: &str,
    text: &str,
    root: &Path,
) {
    match key {
        "python_version" => {
            if is_python_version(text) {
                options.python_version = Some(text.to_string());
            } else {
                validation.add(field, "invalid_value", "expected MAJOR.MINOR, e.g. \"3.12\"");
            }
        }
        "python_platform" => match PLATFORMS
            .iter()
            .find(|platform| platform.eq_ignore_ascii_case(text))
        {
            Some(platform) => options.python_platform = Some(platform.to_string()),
            None => validation.add(
                field,
                "invalid_value",
                format!("expected one of {}", PLATFORMS.join(", ")),
            ),
        },
        "level" => {
            let lowered = text.to_ascii_lowercase();
            if LEVELS.contains(&lowered.as_str()) {
                options.level = Some(lowered);
            } else {
                validation.add(field, "invalid_value", "expected error or warning");
            }
        }
        "fail_on_severity" => match FailOn::parse(text) {
            Some(fail_on) => options.fail_on = fail_on,
            None => validation.add(
                field,
                "invalid_value",
                "expected none, information, warning or error",
            ),
        },
        "venv_path" => match resolve_inside(root, text) {
            Some(path) => options.venv_path = Some(path),
            None => {
                tracing::warn!("security: venv_path outside allowed root rejected");
                validation.add(
                    field,
                    "outside_root",
                    "venv_path must be an existing directory inside the allowed root",
                );
            }
        },
        _ => {}
    }
}

fn resolve_inside(root: &Path, raw: &str) -> Option<PathBuf> {
    if raw.is_empty() {
        return None;
    }
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let canonical = joined.canonicalize().ok()?;
    if canonical.is_dir() && canonical.starts_with(root) {
        Some(canonical)
    } else {
        None
    }
}

fn is_python_version(text: &str) -> bool {
    let mut parts = text.split('.');
    let (Some(major), Some(minor), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !major.is_empty()
        && !minor.is_empty()
        && major.chars().all(|ch| ch.is_ascii_digit())
        && minor.chars().all(|ch| ch.is_ascii_digit())
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(text) => Some(vec![text.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

fn option_names() -> String {
    OPTION_TABLE
        .iter()
        .map(|spec| spec.name)
        .collect::<Vec<_>>()
        .join(", ")
}
