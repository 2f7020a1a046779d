//! Process Runner: launches exactly one checker process per call, captures
//! its complete stdout/stderr, and enforces a deadline and cancellation.

use crate::config::CheckerCommand;
use crate::error::{AnalysisError, AnalysisOutcome};
use crate::model::{ExitClass, RawToolOutput, VersionInfo};
use crate::options::CheckOptions;
use crate::util;
use regex::Regex;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to wait for pipes to drain after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const MAX_CAPTURE_BYTES: usize = 64 * 1024 * 1024;
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
pub const STDERR_TAIL_BYTES: usize = 2000;

/// Exit codes of `pyright --outputjson`. Anything not listed is `Unknown`.
pub static EXIT_CODE_TABLE: &[(i32, ExitClass, &str)] = &[
    (0, ExitClass::Clean, "no error diagnostics reported"),
    (1, ExitClass::Findings, "error diagnostics reported"),
    (2, ExitClass::Fatal, "fatal error, analysis did not complete"),
    (3, ExitClass::ConfigError, "config file could not be read or parsed"),
    (4, ExitClass::InvalidArguments, "illegal command-line parameters"),
];

/// Stderr fragments that mean the checker itself never ran, whatever the exit code.
pub static STDERR_FAILURE_MARKERS: &[&str] = &[
    "command not found",
    "Cannot find module",
    "npm ERR!",
    "Traceback (most recent call last)",
    "node: not found",
    "env: node: No such file or directory",
    "Error: spawn",
    "is not recognized as an internal or external command",
];

impl ExitClass {
    /// Whether this exit means the checker did not complete an analysis.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExitClass::Fatal | ExitClass::ConfigError | ExitClass::InvalidArguments | ExitClass::Crashed
        )
    }
}

pub fn classify_exit(exit_code: Option<i32>, stderr: &str) -> ExitClass {
    let Some(code) = exit_code else {
        return ExitClass::Crashed;
    };
    let class = EXIT_CODE_TABLE
        .iter()
        .find(|(known, _, _)| *known == code)
        .map(|(_, class, _)| *class)
        .unwrap_or(ExitClass::Unknown);
    if matches!(class, ExitClass::Clean | ExitClass::Findings | ExitClass::Unknown)
        && STDERR_FAILURE_MARKERS
            .iter()
            .any(|marker| stderr.contains(marker))
    {
        return ExitClass::Fatal;
    }
    class
}

/// Shared cancellation flag, set by the protocol layer and polled by the runner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of driving a child process to completion.
#[derive(Debug)]
pub enum Completion {
    Finished(RawToolOutput),
    Cancelled,
}

/// One prepared checker invocation.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub cwd: PathBuf,
    pub args: Vec<OsString>,
    pub display: Vec<String>,
}

pub struct Runner<'a> {
    checker: &'a CheckerCommand,
}

impl<'a> Runner<'a> {
    pub fn new(checker: &'a CheckerCommand) -> Self {
        Self { checker }
    }

    /// Arguments are derived only from the option table, the optional
    /// project directory and the targets, in that order.
    pub fn prepare(
        &self,
        targets: &[PathBuf],
        options: &CheckOptions,
        project: Option<&Path>,
        cwd: &Path,
    ) -> PreparedRun {
        let mut args: Vec<OsString> = self.checker.prefix_args.clone();
        args.push(OsString::from("--outputjson"));
        if let Some(project) = project {
            args.push(OsString::from("--project"));
            args.push(project.as_os_str().to_os_string());
        }
        args.extend(options.checker_args());
        args.extend(targets.iter().map(|target| target.as_os_str().to_os_string()));

        let mut display = vec![self.checker.program.to_string_lossy().to_string()];
        display.extend(args.iter().map(|arg| arg.to_string_lossy().to_string()));
        PreparedRun {
            cwd: cwd.to_path_buf(),
            args,
            display,
        }
    }

    pub fn run(
        &self,
        invocation: &PreparedRun,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> AnalysisOutcome<RawToolOutput> {
        let mut cmd = Command::new(&self.checker.program);
        cmd.current_dir(&invocation.cwd).args(&invocation.args);
        tracing::debug!(command = ?invocation.display, cwd = %invocation.cwd.display(), "launching checker");
        match execute(cmd, timeout, cancel) {
            Ok(Completion::Finished(output)) => Ok(output),
            Ok(Completion::Cancelled) => Err(AnalysisError::Cancelled),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(AnalysisError::acquisition(
                format!(
                    "checker executable not found: {}",
                    self.checker.program.display()
                ),
            )),
            Err(err) => Err(AnalysisError::acquisition(format!(
                "failed to run checker: {err}"
            ))),
        }
    }

    /// Run `<checker> --version` and extract the semantic version.
    pub fn probe_version(&self, cwd: &Path) -> VersionInfo {
        let executable_path = self.checker.display();
        let mut cmd = Command::new(&self.checker.program);
        cmd.current_dir(cwd)
            .args(&self.checker.prefix_args)
            .arg("--version");
        let output = match execute(cmd, VERSION_TIMEOUT, &CancelToken::new()) {
            Ok(Completion::Finished(output)) if !output.timed_out => output,
            Ok(_) => {
                return VersionInfo {
                    version: String::new(),
                    executable_path,
                    supports_outputjson: false,
                };
            }
            Err(err) => {
                tracing::warn!("version probe failed: {err}");
                return VersionInfo {
                    version: String::new(),
                    executable_path,
                    supports_outputjson: false,
                };
            }
        };
        let text = format!("{}\n{}", output.stdout_lossy(), output.stderr_lossy());
        let version = parse_version(&text).unwrap_or_else(|| text.trim().to_string());
        let supports_outputjson = parse_version(&version).is_some();
        VersionInfo {
            version,
            executable_path,
            supports_outputjson,
        }
    }
}

pub fn parse_version(text: &str) -> Option<String> {
    static VERSION: OnceLock<Option<Regex>> = OnceLock::new();
    let re = VERSION
        .get_or_init(|| Regex::new(r"\b(\d+\.\d+\.\d+)\b").ok())
        .as_ref()?;
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Spawn `cmd`, capture both pipes fully, and stop it on timeout or cancellation.
/// On timeout the process is killed and whatever was buffered is returned.
pub fn execute(mut cmd: Command, timeout: Duration, cancel: &CancelToken) -> io::Result<Completion> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so a kill also reaches wrapper-spawned children.
        cmd.process_group(0);
    }

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let stdout = PipeCapture::start(child.stdout.take());
    let stderr = PipeCapture::start(child.stderr.take());
    let deadline = start + timeout;

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(err) => {
                terminate(&mut child);
                return Err(err);
            }
        }
        if cancel.is_cancelled() {
            terminate(&mut child);
            stdout.finish();
            stderr.finish();
            tracing::debug!("checker cancelled after {}ms", start.elapsed().as_millis());
            return Ok(Completion::Cancelled);
        }
        if Instant::now() >= deadline {
            timed_out = true;
            terminate(&mut child);
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let output = RawToolOutput {
        stdout: stdout.finish(),
        stderr: stderr.finish(),
        exit_code: status.and_then(|status| status.code()),
        timed_out,
        duration_ms: start.elapsed().as_millis(),
    };
    if timed_out {
        tracing::warn!(
            "checker timed out after {}ms; killed with {} bytes of partial output",
            output.duration_ms,
            output.stdout.len()
        );
    }
    Ok(Completion::Finished(output))
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(child.id()) {
            // The checker is often a shim (shell or node wrapper) whose own children
            // outlive a plain `child.kill()`; the child leads its own group
            // (`process_group(0)`), so signalling `-pid` reaches all of them.
            // SAFETY: kill(2) takes plain integers and touches no memory we own; the
            // pid is our unreaped child, so the group id cannot have been recycled.
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Reads a pipe on its own thread into a shared buffer so partial output
/// survives even if a stray grandchild keeps the pipe open.
struct PipeCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: Option<Receiver<()>>,
}

impl PipeCapture {
    fn start<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let Some(mut pipe) = pipe else {
            return Self { buffer, done: None };
        };
        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&buffer);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut buf = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
                        buf.extend_from_slice(&chunk[..n.min(room)]);
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = done_tx.send(());
        });
        Self {
            buffer,
            done: Some(done_rx),
        }
    }

    fn finish(self) -> Vec<u8> {
        if let Some(done) = self.done {
            let _ = done.recv_timeout(DRAIN_GRACE);
        }
        let mut buf = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *buf)
    }
}

/// Stderr excerpt for error reports.
pub fn stderr_tail(output: &RawToolOutput) -> Option<String> {
    util::tail_str_bytes(&output.stderr_lossy(), STDERR_TAIL_BYTES)
}
