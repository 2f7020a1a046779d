//! Diagnostic Parser: turns raw checker output into [`RawDiagnostic`] entries.
//!
//! The structured path reads `--outputjson` documents (and bare arrays of
//! diagnostic objects). When no structured document can be found, the
//! line-oriented `path:line:col - severity: message` form is tried instead.

use crate::error::{AnalysisError, AnalysisOutcome};
use crate::model::RawToolOutput;
use crate::runner;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// One diagnostic as reported by the checker. Positions are 1-based; the
/// path and severity are still in the checker's own spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDiagnostic {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub end_line: Option<u32>,
    pub end_column: Option<u32>,
    pub severity: String,
    pub message: String,
    pub rule: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    pub diagnostics: Vec<RawDiagnostic>,
    /// Structured entries skipped for missing or malformed required fields.
    pub dropped: usize,
    pub used_fallback: bool,
    pub truncated: bool,
    pub checker_version: Option<String>,
    pub files_analyzed: Option<usize>,
}

pub fn parse(raw: &RawToolOutput) -> AnalysisOutcome<ParsedOutput> {
    let stdout = raw.stdout_lossy();

    if let Some(mut parsed) = parse_structured(&stdout) {
        parsed.truncated = parsed.dropped > 0 || raw.timed_out;
        if parsed.dropped > 0 {
            tracing::warn!("dropped {} malformed diagnostic entries", parsed.dropped);
        }
        return Ok(parsed);
    }

    let diagnostics = parse_text(&stdout);
    // An empty result must come from a parsed document.
    if diagnostics.is_empty() {
        let message = if raw.timed_out {
            format!(
                "checker timed out after {}ms without usable output",
                raw.duration_ms
            )
        } else if stdout.trim().is_empty() {
            "checker produced no output".to_string()
        } else {
            "checker output could not be parsed as JSON or text diagnostics".to_string()
        };
        return Err(AnalysisError::Acquisition {
            message,
            timed_out: raw.timed_out,
            exit_code: raw.exit_code,
            stderr_tail: runner::stderr_tail(raw),
        });
    }

    tracing::debug!(
        "structured parse failed; recovered {} diagnostics from text",
        diagnostics.len()
    );
    Ok(ParsedOutput {
        diagnostics,
        dropped: 0,
        used_fallback: true,
        truncated: true,
        checker_version: None,
        files_analyzed: None,
    })
}

/// Parse a JSON document. `None` means the output is not structured at all.
pub fn parse_structured(text: &str) -> Option<ParsedOutput> {
    let root = parse_json_document(text)?;
    let (entries, summary_source) = match &root {
        Value::Object(map) => {
            let entries = map
                .get("generalDiagnostics")
                .or_else(|| map.get("diagnostics"))
                .and_then(|value| value.as_array())?;
            (entries, Some(map))
        }
        Value::Array(items) => (items, None),
        _ => return None,
    };

    let mut parsed = ParsedOutput::default();
    for entry in entries {
        match entry_from_json(entry) {
            Some(diagnostic) => parsed.diagnostics.push(diagnostic),
            None => parsed.dropped += 1,
        }
    }
    if let Some(map) = summary_source {
        parsed.checker_version = map
            .get("version")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());
        parsed.files_analyzed = map
            .get("summary")
            .and_then(|summary| summary.get("filesAnalyzed"))
            .and_then(|value| value.as_u64())
            .map(|value| value as usize);
    }
    Some(parsed)
}

fn parse_json_document(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    // Some wrappers print a banner line before the document.
    let start = trimmed.find(['{', '['])?;
    if start == 0 {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..]).ok()
}

fn entry_from_json(entry: &Value) -> Option<RawDiagnostic> {
    let path = entry
        .get("file")
        .or_else(|| entry.get("path"))
        .or_else(|| entry.get("uri"))
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())?
        .to_string();
    let severity = severity_field(entry.get("severity")?)?;
    let message = entry
        .get("message")
        .and_then(|value| value.as_str())
        .filter(|value| !value.trim().is_empty())?
        .to_string();

    let (line, column, end_line, end_column) = match entry.get("range") {
        Some(range) => {
            let start = range.get("start")?;
            let line = zero_based(start.get("line")?)?;
            let column = zero_based(start.get("character")?)?;
            let end = range.get("end");
            let end_line = end.and_then(|end| end.get("line")).and_then(zero_based);
            let end_column = end
                .and_then(|end| end.get("character"))
                .and_then(zero_based);
            (line, column, end_line, end_column)
        }
        None => {
            let line = one_based(entry.get("line")?)?;
            let column = one_based(entry.get("column")?)?;
            let end_line = entry.get("endLine").and_then(one_based);
            let end_column = entry.get("endColumn").and_then(one_based);
            (line, column, end_line, end_column)
        }
    };

    let rule = entry
        .get("rule")
        .or_else(|| entry.get("code"))
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string());

    Some(RawDiagnostic {
        path,
        line,
        column,
        end_line,
        end_column,
        severity,
        message,
        rule,
    })
}

fn severity_field(value: &Value) -> Option<String> {
    if let Some(text) = value.as_str() {
        let trimmed = text.trim();
        return (!trimmed.is_empty()).then(|| trimmed.to_string());
    }
    // LSP-style numeric severities.
    let name = match value.as_u64()? {
        1 => "error",
        2 => "warning",
        3 => "information",
        4 => "hint",
        _ => return None,
    };
    Some(name.to_string())
}

fn zero_based(value: &Value) -> Option<u32> {
    let raw = value.as_u64()?;
    u32::try_from(raw).ok()?.checked_add(1)
}

fn one_based(value: &Value) -> Option<u32> {
    let raw = value.as_u64()?;
    u32::try_from(raw).ok().filter(|value| *value >= 1)
}

fn line_pattern() -> Option<&'static Regex> {
    static LINE: OnceLock<Option<Regex>> = OnceLock::new();
    LINE.get_or_init(|| {
        Regex::new(
            r"^\s*(?P<path>.+?):(?P<line>\d+):(?P<col>\d+)\s*(?:-|:)\s*(?P<sev>[A-Za-z]+)\s*:\s*(?P<msg>.+?)\s*$",
        )
        .ok()
    })
    .as_ref()
}

fn rule_suffix() -> Option<&'static Regex> {
    static RULE: OnceLock<Option<Regex>> = OnceLock::new();
    RULE.get_or_init(|| Regex::new(r"\s*\((?P<rule>report[A-Za-z]+)\)$").ok())
        .as_ref()
}

/// Extract diagnostics from line-oriented text output. Indented lines
/// following a diagnostic continue its message.
pub fn parse_text(text: &str) -> Vec<RawDiagnostic> {
    let Some(pattern) = line_pattern() else {
        return Vec::new();
    };
    let mut out: Vec<RawDiagnostic> = Vec::new();
    let mut last_matched = false;
    for line in text.lines() {
        if let Some(caps) = pattern.captures(line) {
            let (Some(line_no), Some(column)) = (
                caps["line"].parse::<u32>().ok().filter(|value| *value >= 1),
                caps["col"].parse::<u32>().ok().filter(|value| *value >= 1),
            ) else {
                last_matched = false;
                continue;
            };
            let mut message = caps["msg"].to_string();
            let mut rule = None;
            if let Some(suffix) = rule_suffix().and_then(|re| re.captures(&message)) {
                rule = Some(suffix["rule"].to_string());
                let cut = suffix.get(0).map(|m| m.start()).unwrap_or(message.len());
                message.truncate(cut);
            }
            out.push(RawDiagnostic {
                path: caps["path"].trim().to_string(),
                line: line_no,
                column,
                end_line: None,
                end_column: None,
                severity: caps["sev"].to_string(),
                message,
                rule,
            });
            last_matched = true;
        } else if last_matched && line.starts_with("    ") && !line.trim().is_empty() {
            if let Some(previous) = out.last_mut() {
                previous.message.push('\n');
                previous.message.push_str(line.trim());
            }
        } else {
            last_matched = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(stdout: &str, stderr: &str, exit_code: Option<i32>) -> RawToolOutput {
        RawToolOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code,
            timed_out: false,
            duration_ms: 5,
        }
    }

    #[test]
    fn structured_entries_become_one_based() {
        let json = r#"{
            "version": "1.1.405",
            "generalDiagnostics": [{
                "file": "/repo/pkg/a.py",
                "severity": "error",
                "message": "\"x\" is not defined",
                "range": {"start": {"line": 9, "character": 4}, "end": {"line": 9, "character": 5}},
                "rule": "reportUndefinedVariable"
            }],
            "summary": {"filesAnalyzed": 1, "errorCount": 1}
        }"#;
        let parsed = parse(&raw(json, "", Some(1))).unwrap();
        assert!(!parsed.truncated);
        assert!(!parsed.used_fallback);
        assert_eq!(parsed.checker_version.as_deref(), Some("1.1.405"));
        assert_eq!(parsed.files_analyzed, Some(1));
        let diag = &parsed.diagnostics[0];
        assert_eq!((diag.line, diag.column), (10, 5));
        assert_eq!((diag.end_line, diag.end_column), (Some(10), Some(6)));
        assert_eq!(diag.rule.as_deref(), Some("reportUndefinedVariable"));
    }

    #[test]
    fn entries_missing_required_fields_are_dropped() {
        let json = r#"{"generalDiagnostics": [
            {"file": "/r/a.py", "severity": "error", "message": "ok",
             "range": {"start": {"line": 0, "character": 0}}},
            {"file": "/r/a.py", "severity": "error",
             "range": {"start": {"line": 0, "character": 0}}},
            {"file": "", "severity": "warning", "message": "no file",
             "range": {"start": {"line": 1, "character": 0}}},
            {"file": "/r/b.py", "severity": "warning", "message": "bad line",
             "range": {"start": {"line": -1, "character": 0}}}
        ]}"#;
        let parsed = parse(&raw(json, "", Some(1))).unwrap();
        assert_eq!(parsed.diagnostics.len(), 1);
        assert_eq!(parsed.dropped, 3);
        assert!(parsed.truncated);
    }

    #[test]
    fn flat_array_shape_is_accepted() {
        let json = r#"[{"path": "a.py", "line": 3, "column": 2, "severity": 2, "message": "w", "code": "W1"}]"#;
        let parsed = parse(&raw(json, "", Some(0))).unwrap();
        let diag = &parsed.diagnostics[0];
        assert_eq!((diag.line, diag.column), (3, 2));
        assert_eq!(diag.severity, "warning");
        assert_eq!(diag.rule.as_deref(), Some("W1"));
    }

    #[test]
    fn banner_before_json_is_skipped() {
        let text = "WARNING: there is a new pyright version available\n{\"generalDiagnostics\": []}";
        let parsed = parse(&raw(text, "", Some(0))).unwrap();
        assert!(parsed.diagnostics.is_empty());
        assert!(!parsed.truncated);
    }

    #[test]
    fn text_fallback_extracts_rule_and_continuations() {
        let text = "/repo/a.py\n  /repo/a.py:10:5 - error: \"x\" is not defined (reportUndefinedVariable)\n  /repo/a.py:12:1 - warning: Import could not be resolved\n    Stub file not found\n1 error, 1 warning, 0 informations\n";
        let parsed = parse(&raw(text, "", Some(1))).unwrap();
        assert!(parsed.used_fallback);
        assert!(parsed.truncated);
        assert_eq!(parsed.diagnostics.len(), 2);
        let first = &parsed.diagnostics[0];
        assert_eq!(first.message, "\"x\" is not defined");
        assert_eq!(first.rule.as_deref(), Some("reportUndefinedVariable"));
        assert_eq!(
            parsed.diagnostics[1].message,
            "Import could not be resolved\nStub file not found"
        );
    }

    #[test]
    fn truncated_json_with_stderr_is_acquisition_error() {
        let text = "{\"generalDiagnostics\": [{\"file\": \"/r/a.py\", \"sev";
        let err = parse(&raw(text, "Killed", None)).unwrap_err();
        assert!(matches!(err, AnalysisError::Acquisition { .. }));
    }

    #[test]
    fn empty_output_is_never_a_clean_result() {
        let err = parse(&raw("", "", Some(0))).unwrap_err();
        assert!(matches!(err, AnalysisError::Acquisition { .. }));
    }

    #[test]
    fn unparseable_stdout_without_stderr_is_acquisition_error() {
        let err = parse(&raw(
            "Segmentation fault in analyzer, output lost",
            "",
            Some(0),
        ))
        .unwrap_err();
        let AnalysisError::Acquisition {
            message, exit_code, ..
        } = err
        else {
            panic!("expected acquisition error");
        };
        assert!(message.contains("could not be parsed"));
        assert_eq!(exit_code, Some(0));
    }
}
