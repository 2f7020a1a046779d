//! Target resolution against the allowed roots, include/exclude expansion,
//! checker config discovery and grouping of targets by project root.

use crate::error::{AnalysisError, AnalysisOutcome, Validation};
use crate::model::{ConfigKind, FindConfigResult};
use crate::util::clean_path;
use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const DEFAULT_INCLUDES: &[&str] = &["**/*.py", "**/*.pyi"];

/// Canonical targets of one request and the allowed root they live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTargets {
    pub root: PathBuf,
    pub targets: Vec<PathBuf>,
}

/// Targets that share one checker project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectGroup {
    pub project_dir: PathBuf,
    pub config: Option<PathBuf>,
    pub targets: Vec<PathBuf>,
}

/// Resolve raw target strings. Relative targets are joined onto the first
/// allowed root; every target must exist inside an allowed root, and all
/// of them inside the same one.
pub fn resolve_targets(raw: &[String], allowed_roots: &[PathBuf]) -> AnalysisOutcome<RequestTargets> {
    if raw.is_empty() {
        return Err(AnalysisError::validation(
            "targets",
            "empty",
            "at least one target is required",
        ));
    }
    let Some(primary) = allowed_roots.first() else {
        return Err(AnalysisError::validation(
            "targets",
            "no_root",
            "no allowed root is configured",
        ));
    };

    let mut validation = Validation::new();
    let mut request_root: Option<&PathBuf> = None;
    let mut targets: Vec<PathBuf> = Vec::new();
    for (idx, target) in raw.iter().enumerate() {
        let field = format!("targets[{idx}]");
        let trimmed = target.trim();
        if trimmed.is_empty() {
            validation.add(&field, "empty", "target must be a non-empty path");
            continue;
        }
        let candidate = Path::new(trimmed);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            primary.join(candidate)
        };
        let lexical = clean_path(&joined);
        let canonical = match lexical.canonicalize() {
            Ok(path) => path,
            Err(_) => {
                if containing_root(&lexical, allowed_roots).is_some() {
                    validation.add(&field, "not_found", format!("target does not exist: {trimmed}"));
                } else {
                    tracing::warn!("security: target outside allowed roots rejected: {trimmed}");
                    validation.add(&field, "outside_root", "target is outside the allowed root");
                }
                continue;
            }
        };
        let Some(root) = containing_root(&canonical, allowed_roots) else {
            tracing::warn!("security: target outside allowed roots rejected: {trimmed}");
            validation.add(&field, "outside_root", "target is outside the allowed root");
            continue;
        };
        match request_root {
            None => request_root = Some(root),
            Some(existing) if existing != root => {
                validation.add(
                    &field,
                    "mixed_roots",
                    "all targets of one request must share an allowed root",
                );
                continue;
            }
            Some(_) => {}
        }
        if !targets.contains(&canonical) {
            targets.push(canonical);
        }
    }
    validation.into_result()?;
    let Some(root) = request_root else {
        return Err(AnalysisError::validation(
            "targets",
            "empty",
            "at least one target is required",
        ));
    };
    Ok(RequestTargets {
        root: root.clone(),
        targets,
    })
}

/// Most specific allowed root containing `path`.
fn containing_root<'a>(path: &Path, allowed_roots: &'a [PathBuf]) -> Option<&'a PathBuf> {
    allowed_roots
        .iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
}

/// Replace directory targets by the files selected by `include`/`exclude`.
/// File targets named explicitly are kept as they are.
pub fn expand_targets(
    targets: &[PathBuf],
    include: &[String],
    exclude: &[String],
) -> AnalysisOutcome<Vec<PathBuf>> {
    if include.is_empty() && exclude.is_empty() {
        return Ok(targets.to_vec());
    }
    let mut selected = BTreeSet::new();
    for target in targets {
        if !target.is_dir() {
            selected.insert(target.clone());
            continue;
        }
        let overrides = build_overrides(target, include, exclude)?;
        let mut builder = WalkBuilder::new(target);
        builder
            .overrides(overrides)
            .hidden(true)
            .git_ignore(true)
            .require_git(false);
        for entry in builder.build() {
            let entry = match entry {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!("walk error: {err}");
                    continue;
                }
            };
            if entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                selected.insert(entry.into_path());
            }
        }
    }
    if selected.is_empty() {
        return Err(AnalysisError::validation(
            "options.include",
            "no_matches",
            "include/exclude patterns matched no files",
        ));
    }
    Ok(selected.into_iter().collect())
}

fn build_overrides(dir: &Path, include: &[String], exclude: &[String]) -> AnalysisOutcome<Override> {
    let mut builder = OverrideBuilder::new(dir);
    let includes: Vec<&str> = if include.is_empty() {
        DEFAULT_INCLUDES.to_vec()
    } else {
        include.iter().map(String::as_str).collect()
    };
    for pattern in includes {
        builder.add(pattern).map_err(|err| {
            AnalysisError::validation("options.include", "invalid_glob", format!("{pattern}: {err}"))
        })?;
    }
    for pattern in exclude {
        builder.add(&format!("!{pattern}")).map_err(|err| {
            AnalysisError::validation("options.exclude", "invalid_glob", format!("{pattern}: {err}"))
        })?;
    }
    builder.build().map_err(|err| {
        AnalysisError::validation("options.include", "invalid_glob", err.to_string())
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LocatedConfig {
    dir: PathBuf,
    path: PathBuf,
    kind: ConfigKind,
}

/// Search upward from `start` for checker configuration. `pyrightconfig.json`
/// wins over a `pyproject.toml` in the same directory; a `pyproject.toml`
/// only counts when it has a `[tool.pyright]` table.
pub fn find_config(start: &Path) -> FindConfigResult {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    let start_dir = start_dir(&start);
    match locate_config(&start_dir, None) {
        Some(found) => FindConfigResult {
            found: true,
            config_path: Some(found.path.to_string_lossy().to_string()),
            kind: Some(found.kind),
            resolve_dir: found.dir.to_string_lossy().to_string(),
            searched_from: start_dir.to_string_lossy().to_string(),
        },
        None => FindConfigResult {
            found: false,
            config_path: None,
            kind: None,
            resolve_dir: start_dir.to_string_lossy().to_string(),
            searched_from: start_dir.to_string_lossy().to_string(),
        },
    }
}

fn start_dir(start: &Path) -> PathBuf {
    if start.is_file() {
        start.parent().map(Path::to_path_buf).unwrap_or_else(|| start.to_path_buf())
    } else {
        start.to_path_buf()
    }
}

/// Walk upward from `start_dir`, stopping after `boundary` when given.
fn locate_config(start_dir: &Path, boundary: Option<&Path>) -> Option<LocatedConfig> {
    let mut current = Some(start_dir);
    while let Some(dir) = current {
        if let Some(found) = config_in(dir) {
            return Some(found);
        }
        if boundary.is_some_and(|boundary| dir == boundary) {
            break;
        }
        current = dir.parent();
    }
    None
}

fn config_in(dir: &Path) -> Option<LocatedConfig> {
    let pyright_json = dir.join(ConfigKind::PyrightConfig.file_name());
    if pyright_json.is_file() {
        return Some(LocatedConfig {
            dir: dir.to_path_buf(),
            path: pyright_json,
            kind: ConfigKind::PyrightConfig,
        });
    }
    let pyproject = dir.join(ConfigKind::Pyproject.file_name());
    if pyproject.is_file() && has_pyright_section(&pyproject) {
        return Some(LocatedConfig {
            dir: dir.to_path_buf(),
            path: pyproject,
            kind: ConfigKind::Pyproject,
        });
    }
    None
}

fn has_pyright_section(pyproject: &Path) -> bool {
    static SECTION: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = SECTION
        .get_or_init(|| Regex::new(r"(?m)^\s*\[tool\.pyright\]\s*$").ok())
        .as_ref()
    else {
        return false;
    };
    match fs::read_to_string(pyproject) {
        Ok(text) => re.is_match(&text),
        Err(err) => {
            tracing::debug!("skipping unreadable {}: {err}", pyproject.display());
            false
        }
    }
}

impl ConfigKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ConfigKind::PyrightConfig => "pyrightconfig.json",
            ConfigKind::Pyproject => "pyproject.toml",
        }
    }
}

/// Group targets by the nearest directory holding a checker config, never
/// looking above `root`. Targets without one share the `root` group.
pub fn group_by_project(root: &Path, targets: &[PathBuf]) -> Vec<ProjectGroup> {
    let mut located: HashMap<PathBuf, Option<LocatedConfig>> = HashMap::new();
    let mut groups: BTreeMap<PathBuf, ProjectGroup> = BTreeMap::new();
    for target in targets {
        let dir = start_dir(target);
        let found = located
            .entry(dir.clone())
            .or_insert_with(|| locate_config(&dir, Some(root)))
            .clone();
        let (project_dir, config) = match found {
            Some(found) => (found.dir, Some(found.path)),
            None => (root.to_path_buf(), None),
        };
        groups
            .entry(project_dir.clone())
            .or_insert_with(|| ProjectGroup {
                project_dir,
                config,
                targets: Vec::new(),
            })
            .targets
            .push(target.clone());
    }
    groups.into_values().collect()
}
