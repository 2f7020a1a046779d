//! Request Dispatcher: validates a request, runs the checker once per
//! project root and merges the normalized results.

use crate::config::{CheckerCommand, Config};
use crate::diagnostics::{self, ParsedOutput};
use crate::error::{AnalysisError, AnalysisOutcome};
use crate::model::{
    AnalysisRequest, AnalysisResult, ExitClass, FindConfigResult, Invocation, ResultMetadata,
    Summary, VersionInfo,
};
use crate::normalize::{self, Normalized};
use crate::options::CheckOptions;
use crate::project::{self, ProjectGroup};
use crate::runner::{self, CancelToken, EXIT_CODE_TABLE, PreparedRun, Runner};
use crate::schedule::Scheduler;
use crate::util::render_path;
use anyhow::anyhow;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// A validated request, ready to run.
#[derive(Debug, Clone)]
pub struct Plan {
    pub root: PathBuf,
    pub options: CheckOptions,
    pub groups: Vec<ProjectGroup>,
    pub timeout: Duration,
}

#[derive(Debug)]
struct GroupReport {
    parsed: ParsedOutput,
    normalized: Normalized,
    exit_code: Option<i32>,
    timed_out: bool,
}

#[derive(Debug)]
struct GroupOutcome {
    invocations: Vec<Invocation>,
    retried: bool,
    result: AnalysisOutcome<GroupReport>,
}

/// Owns the immutable configuration; every `analyze` call builds its own
/// pipeline and shares only the scheduler.
#[derive(Debug)]
pub struct Dispatcher {
    config: Config,
    scheduler: Scheduler,
}

impl Dispatcher {
    pub fn new(config: Config) -> Self {
        let scheduler = Scheduler::new(config.max_concurrent);
        Self { config, scheduler }
    }

    /// Check targets and options without launching anything.
    pub fn plan(&self, request: &AnalysisRequest) -> AnalysisOutcome<Plan> {
        let targets = project::resolve_targets(&request.targets, &self.config.allowed_roots);
        let option_root = match &targets {
            Ok(resolved) => resolved.root.clone(),
            Err(_) => self
                .config
                .primary_root()
                .map(PathBuf::from)
                .unwrap_or_default(),
        };
        let options = CheckOptions::parse(&request.options, &option_root, self.config.max_timeout);
        let (targets, options) = merge_validation(targets, options)?;

        let expanded = project::expand_targets(&targets.targets, &options.include, &options.exclude)?;
        let groups = project::group_by_project(&targets.root, &expanded);
        let timeout = options
            .timeout
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout);
        Ok(Plan {
            root: targets.root,
            options,
            groups,
            timeout,
        })
    }

    pub fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: &CancelToken,
    ) -> AnalysisOutcome<AnalysisResult> {
        let start = Instant::now();
        let plan = self.plan(request)?;
        let checker = self.checker()?;
        let runner = Runner::new(checker);
        tracing::debug!(
            "analyzing {} project group(s) under {}",
            plan.groups.len(),
            plan.root.display()
        );

        let outcomes = if plan.groups.len() == 1 {
            vec![self.run_group(&runner, &plan, &plan.groups[0], cancel)]
        } else {
            self.run_groups_parallel(&runner, &plan, cancel)
        };

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        let mut result = merge(&plan, outcomes)?;
        result.duration_ms = start.elapsed().as_millis();
        Ok(result)
    }

    /// Probe the configured checker for its version.
    pub fn version(&self) -> AnalysisOutcome<VersionInfo> {
        let checker = self.checker()?;
        let cwd = self
            .config
            .primary_root()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Ok(Runner::new(checker).probe_version(&cwd))
    }

    /// Look for checker configuration from `start` (default: the primary
    /// root), which must lie inside an allowed root.
    pub fn find_config(&self, start: Option<&str>) -> AnalysisOutcome<FindConfigResult> {
        let start = start.unwrap_or(".").to_string();
        let resolved = project::resolve_targets(&[start], &self.config.allowed_roots).map_err(
            |err| match err {
                AnalysisError::Validation { mut issues } => {
                    for issue in &mut issues {
                        issue.field = "start_dir".to_string();
                    }
                    AnalysisError::Validation { issues }
                }
                other => other,
            },
        )?;
        let Some(path) = resolved.targets.first() else {
            return Err(AnalysisError::validation(
                "start_dir",
                "empty",
                "a start directory is required",
            ));
        };
        Ok(project::find_config(path))
    }

    fn checker(&self) -> AnalysisOutcome<&CheckerCommand> {
        self.config.checker.as_ref().ok_or_else(|| {
            AnalysisError::acquisition(
                "checker not configured: set PYRIGHT_MCP_PYRIGHT or put pyright on PATH",
            )
        })
    }

    fn run_groups_parallel(
        &self,
        runner: &Runner<'_>,
        plan: &Plan,
        cancel: &CancelToken,
    ) -> Vec<GroupOutcome> {
        let mut outcomes = Vec::with_capacity(plan.groups.len());
        for chunk in plan.groups.chunks(self.scheduler.max_concurrent()) {
            thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|group| scope.spawn(move || self.run_group(runner, plan, group, cancel)))
                    .collect();
                for (handle, group) in handles.into_iter().zip(chunk) {
                    let outcome = handle.join().unwrap_or_else(|_| GroupOutcome {
                        invocations: Vec::new(),
                        retried: false,
                        result: Err(AnalysisError::internal(anyhow!(
                            "checker worker for {} panicked",
                            group.project_dir.display()
                        ))),
                    });
                    outcomes.push(outcome);
                }
            });
        }
        outcomes
    }

    fn run_group(
        &self,
        runner: &Runner<'_>,
        plan: &Plan,
        group: &ProjectGroup,
        cancel: &CancelToken,
    ) -> GroupOutcome {
        let project = group.config.as_ref().map(|_| group.project_dir.as_path());
        let prepared = runner.prepare(&group.targets, &plan.options, project, &group.project_dir);
        let mut invocations = Vec::new();
        let mut retried = false;
        loop {
            let (invocation, result) = self.attempt(runner, plan, group, &prepared, cancel);
            invocations.push(invocation);
            match result {
                Err(err) if err.is_timeout() && self.config.retry_on_timeout && !retried => {
                    tracing::warn!(
                        "checker timed out for {}; retrying once",
                        group.project_dir.display()
                    );
                    retried = true;
                }
                result => {
                    return GroupOutcome {
                        invocations,
                        retried,
                        result,
                    };
                }
            }
        }
    }

    fn attempt(
        &self,
        runner: &Runner<'_>,
        plan: &Plan,
        group: &ProjectGroup,
        prepared: &PreparedRun,
        cancel: &CancelToken,
    ) -> (Invocation, AnalysisOutcome<GroupReport>) {
        let mut invocation = Invocation {
            project_root: render_path(&plan.root, &group.project_dir),
            command: prepared.display.clone(),
            exit_code: None,
            exit_class: ExitClass::Unknown,
            duration_ms: 0,
            timed_out: false,
            failure: None,
        };

        let raw = match self.scheduler.acquire(&group.project_dir, cancel) {
            Ok(_permit) => runner.run(prepared, plan.timeout, cancel),
            Err(err) => Err(err),
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                invocation.failure = Some(err.to_string());
                return (invocation, Err(err));
            }
        };

        let exit_class = runner::classify_exit(raw.exit_code, &raw.stderr_lossy());
        invocation.exit_code = raw.exit_code;
        invocation.exit_class = exit_class;
        invocation.duration_ms = raw.duration_ms;
        invocation.timed_out = raw.timed_out;

        let result = if exit_class.is_failure() && !raw.timed_out {
            Err(AnalysisError::Acquisition {
                message: exit_failure_message(exit_class, raw.exit_code),
                timed_out: false,
                exit_code: raw.exit_code,
                stderr_tail: runner::stderr_tail(&raw),
            })
        } else {
            diagnostics::parse(&raw).map(|parsed| {
                let mut parsed = parsed;
                let found = std::mem::take(&mut parsed.diagnostics);
                let normalized = normalize::normalize(found, &plan.root, &group.project_dir);
                GroupReport {
                    parsed,
                    normalized,
                    exit_code: raw.exit_code,
                    timed_out: raw.timed_out,
                }
            })
        };
        if let Err(err) = &result {
            invocation.failure = Some(err.to_string());
        }
        (invocation, result)
    }
}

fn exit_failure_message(class: ExitClass, exit_code: Option<i32>) -> String {
    let Some(code) = exit_code else {
        return "checker was terminated by a signal".to_string();
    };
    let described = EXIT_CODE_TABLE
        .iter()
        .find(|(known, _, _)| *known == code)
        .map(|(_, _, description)| *description);
    match described {
        Some(description) => format!("checker exited with code {code}: {description}"),
        None => format!("checker exited with code {code} ({class:?}) and reported a failure on stderr"),
    }
}

/// Combine validation failures of both halves of a request into one error.
fn merge_validation<A, B>(
    first: AnalysisOutcome<A>,
    second: AnalysisOutcome<B>,
) -> AnalysisOutcome<(A, B)> {
    match (first, second) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (
            Err(AnalysisError::Validation { mut issues }),
            Err(AnalysisError::Validation { issues: more }),
        ) => {
            issues.extend(more);
            Err(AnalysisError::Validation { issues })
        }
        (Err(err), _) | (_, Err(err)) => Err(err),
    }
}

fn merge(plan: &Plan, outcomes: Vec<GroupOutcome>) -> AnalysisOutcome<AnalysisResult> {
    let mut metadata = ResultMetadata::default();
    let mut diagnostics = Vec::new();
    let mut exit_codes = Vec::new();
    let mut parse_truncated = false;
    let mut partial_timeout = false;
    let mut failures = Vec::new();
    let mut successes = 0usize;

    for outcome in outcomes {
        metadata.retried |= outcome.retried;
        metadata.invocations.extend(outcome.invocations);
        match outcome.result {
            Ok(report) => {
                successes += 1;
                metadata.dropped_entries += report.parsed.dropped;
                metadata.used_fallback |= report.parsed.used_fallback;
                metadata.files_analyzed += report.parsed.files_analyzed.unwrap_or(0);
                if metadata.checker_version.is_none() {
                    metadata.checker_version = report.parsed.checker_version.clone();
                }
                metadata.rejected_paths += report.normalized.rejected_paths;
                metadata.unknown_severities += report.normalized.unknown_severities;
                metadata.duplicates_removed += report.normalized.duplicates_removed;
                metadata.timed_out |= report.timed_out;
                partial_timeout |= report.timed_out;
                parse_truncated |= report.parsed.truncated;
                if let Some(code) = report.exit_code {
                    exit_codes.push(code);
                }
                diagnostics.extend(report.normalized.diagnostics);
            }
            Err(err) => {
                metadata.timed_out |= err.is_timeout();
                failures.push(err);
            }
        }
    }

    if failures
        .iter()
        .any(|err| matches!(err, AnalysisError::Cancelled))
    {
        return Err(AnalysisError::Cancelled);
    }
    if successes == 0 {
        if let Some(err) = failures.into_iter().next() {
            return Err(err);
        }
        return Err(AnalysisError::internal(anyhow!("request produced no project groups")));
    }
    if !failures.is_empty() {
        tracing::warn!(
            "{} of {} project group(s) failed; returning partial result",
            failures.len(),
            plan.groups.len()
        );
    }

    metadata.duplicates_removed += normalize::dedup(&mut diagnostics);
    normalize::sort_diagnostics(&mut diagnostics);

    let summary = Summary::from_diagnostics(&diagnostics);
    let (ok, fail_reason) = plan.options.fail_on.evaluate(&diagnostics);
    let truncated =
        parse_truncated || partial_timeout || metadata.rejected_paths > 0 || !failures.is_empty();
    Ok(AnalysisResult {
        ok,
        fail_reason,
        summary,
        diagnostics,
        tool_exit_code: exit_codes.into_iter().max().unwrap_or(-1),
        truncated,
        root: plan.root.to_string_lossy().to_string(),
        duration_ms: 0,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher_for(root: &std::path::Path) -> Dispatcher {
        Dispatcher::new(
            Config::default()
                .with_allowed_roots(vec![root.to_path_buf()])
                .with_checker(CheckerCommand::new("/definitely/not/pyright")),
        )
    }

    #[test]
    fn plan_merges_target_and_option_issues() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher_for(dir.path());
        let request = AnalysisRequest::new(["missing.py"]).with_option("bogus", json!(1));
        let err = dispatcher.plan(&request).unwrap_err();
        let AnalysisError::Validation { issues } = err else {
            panic!("expected validation error");
        };
        let fields: Vec<&str> = issues.iter().map(|issue| issue.field.as_str()).collect();
        assert_eq!(fields, vec!["targets[0]", "options.bogus"]);
    }

    #[test]
    fn plan_clamps_timeout_and_groups_targets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let dispatcher = dispatcher_for(dir.path());
        let request = AnalysisRequest::new(["a.py"]).with_option("timeout_ms", json!(2500));
        let plan = dispatcher.plan(&request).unwrap();
        assert_eq!(plan.timeout, Duration::from_millis(2500));
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].project_dir, plan.root);
    }

    #[test]
    fn missing_checker_is_acquisition_error_after_validation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let dispatcher = Dispatcher::new(Config::default().with_allowed_roots(vec![dir.path().to_path_buf()]));

        let err = dispatcher
            .analyze(&AnalysisRequest::new(["a.py"]), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Acquisition { .. }));

        let err = dispatcher
            .analyze(&AnalysisRequest::default(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Validation { .. }));
    }

    #[test]
    fn exit_messages_use_the_table() {
        assert_eq!(
            exit_failure_message(ExitClass::ConfigError, Some(3)),
            "checker exited with code 3: config file could not be read or parsed"
        );
        assert_eq!(
            exit_failure_message(ExitClass::Crashed, None),
            "checker was terminated by a signal"
        );
    }
}
