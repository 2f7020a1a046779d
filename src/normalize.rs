//! Diagnostic Normalizer: root-relative paths, the fixed severity enum,
//! exact-repeat removal and the final ordering.

use crate::diagnostics::RawDiagnostic;
use crate::model::{Diagnostic, Severity, SpanEnd};
use crate::util::{clean_path, normalize_path};
use blake3::Hasher;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Checker severity spellings, matched case-insensitively. Anything else
/// maps to `information` and is counted.
pub static SEVERITY_TABLE: &[(&str, Severity)] = &[
    ("error", Severity::Error),
    ("fatal", Severity::Error),
    ("warning", Severity::Warning),
    ("warn", Severity::Warning),
    ("information", Severity::Information),
    ("info", Severity::Information),
    ("hint", Severity::Information),
    ("note", Severity::Information),
    ("unused", Severity::Unused),
    ("unusedcode", Severity::Unused),
    ("unreachable", Severity::Unused),
    ("unreachablecode", Severity::Unused),
    ("deprecated", Severity::Unused),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Normalized {
    pub diagnostics: Vec<Diagnostic>,
    pub rejected_paths: usize,
    pub unknown_severities: usize,
    pub duplicates_removed: usize,
}

pub fn map_severity(raw: &str) -> Option<Severity> {
    let lowered = raw.trim().to_ascii_lowercase();
    SEVERITY_TABLE
        .iter()
        .find(|(name, _)| *name == lowered)
        .map(|(_, severity)| *severity)
}

/// `root` must be canonical. Relative checker paths are resolved against
/// `base_dir` (the directory the checker ran in).
pub fn normalize(raw: Vec<RawDiagnostic>, root: &Path, base_dir: &Path) -> Normalized {
    let mut out = Normalized::default();
    let mut diagnostics = Vec::with_capacity(raw.len());
    for entry in raw {
        let Some(file_path) = relativize(&entry.path, root, base_dir) else {
            tracing::warn!("dropping diagnostic outside root: {}", entry.path);
            out.rejected_paths += 1;
            continue;
        };
        let severity = match map_severity(&entry.severity) {
            Some(severity) => severity,
            None => {
                tracing::debug!("unmapped severity '{}'", entry.severity);
                out.unknown_severities += 1;
                Severity::Information
            }
        };
        let range = match (entry.end_line, entry.end_column) {
            (Some(end_line), Some(end_column)) => Some(SpanEnd {
                end_line,
                end_column,
            }),
            _ => None,
        };
        let mut diagnostic = Diagnostic {
            file_path,
            line: entry.line.max(1),
            column: entry.column.max(1),
            severity,
            message: entry.message,
            rule: entry.rule,
            range,
            fingerprint: String::new(),
        };
        diagnostic.fingerprint = fingerprint(&diagnostic);
        diagnostics.push(diagnostic);
    }
    out.duplicates_removed = dedup(&mut diagnostics);
    sort_diagnostics(&mut diagnostics);
    out.diagnostics = diagnostics;
    out
}

fn relativize(raw: &str, root: &Path, base_dir: &Path) -> Option<String> {
    let trimmed = raw.strip_prefix("file://").unwrap_or(raw);
    let candidate = Path::new(trimmed);
    let absolute: PathBuf = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    };
    let cleaned = clean_path(&absolute);
    if let Ok(rel) = cleaned.strip_prefix(root) {
        return Some(normalize_path(rel));
    }
    // The checker may report a path through a symlink of the root.
    let canonical = cleaned.canonicalize().ok()?;
    canonical.strip_prefix(root).ok().map(normalize_path)
}

/// Remove exact repeats of (file, line, column, message), keeping the first.
pub fn dedup(diagnostics: &mut Vec<Diagnostic>) -> usize {
    let before = diagnostics.len();
    let mut seen = HashSet::new();
    diagnostics.retain(|diag| {
        seen.insert((
            diag.file_path.clone(),
            diag.line,
            diag.column,
            diag.message.clone(),
        ))
    });
    before - diagnostics.len()
}

/// Order by file, line and column; the remaining fields break ties so the
/// order never depends on checker output order.
pub fn sort_diagnostics(diagnostics: &mut [Diagnostic]) {
    diagnostics.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then(a.line.cmp(&b.line))
            .then(a.column.cmp(&b.column))
            .then(a.severity.cmp(&b.severity))
            .then_with(|| a.rule.cmp(&b.rule))
            .then_with(|| a.message.cmp(&b.message))
    });
}

pub fn fingerprint(diagnostic: &Diagnostic) -> String {
    let mut hasher = Hasher::new();
    push_str(&mut hasher, &diagnostic.file_path);
    push_str(&mut hasher, &diagnostic.line.to_string());
    push_str(&mut hasher, &diagnostic.column.to_string());
    match diagnostic.range {
        Some(end) => push_str(&mut hasher, &format!("{}:{}", end.end_line, end.end_column)),
        None => push_str(&mut hasher, "-"),
    }
    push_str(&mut hasher, diagnostic.severity.as_str());
    push_str(&mut hasher, diagnostic.rule.as_deref().unwrap_or("-"));
    push_str(&mut hasher, &diagnostic.message);
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..16].to_string()
}

fn push_str(hasher: &mut Hasher, value: &str) {
    hasher.update(value.as_bytes());
    hasher.update(b"\n");
}
