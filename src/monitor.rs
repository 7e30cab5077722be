/// Incremental process output monitor.
///
/// Launches one test executable with stdout and stderr redirected to a single
/// capture file, tails that file while the process runs, classifies each
/// complete line as it appears, and produces a `RunResult` once the process
/// has exited and the capture has been drained.
use crate::archive;
use crate::classify::{Classifier, LineClass, LineTally};
use crate::console::{Console, EchoState};
use crate::result_log::ResultLog;
use crate::run_result::{RunResult, RunStatus};
use crate::signals::Interrupt;
use crate::tail::CaptureTail;
use crate::test_list::{program_of, DeviceType};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};

const FAILURE_INDENT: &str = "           ==> ";
const PASS_INDENT: &str = "               ";

/// One process invocation to monitor.
#[derive(Debug, Clone)]
pub struct Job {
    pub test_name: String,
    /// Command plus arguments, relative to the monitor's working directory.
    pub invocation: String,
    /// Appended after the invocation's own arguments.
    pub extra_args: Vec<String>,
    pub device: DeviceType,
    pub shard: Option<u32>,
    /// Keep the capture file at this path once the test finishes.
    pub keep_capture_as: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// `None` disables progress characters.
    pub status_interval: Option<Duration>,
    pub device_env_var: String,
    /// Directory for capture temp files (system temp dir when `None`).
    pub capture_dir: Option<PathBuf>,
    pub compress_captures: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            status_interval: None,
            device_env_var: "CL_DEVICE_TYPE".to_string(),
            capture_dir: None,
            compress_captures: false,
        }
    }
}

/// How a monitored run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(RunResult),
    /// An interrupt arrived; the child was killed and its output drained.
    Interrupted(RunResult),
}

impl Outcome {
    pub fn into_result(self) -> RunResult {
        match self {
            Outcome::Completed(r) | Outcome::Interrupted(r) => r,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Outcome::Interrupted(_))
    }
}

/// Errors that end monitoring of a single test.
#[derive(Debug)]
pub enum MonitorError {
    /// The executable is missing or could not be started.
    Launch { program: PathBuf, reason: String },
    /// Failed to create or open the capture file.
    Capture { source: std::io::Error },
    /// Failed to read the capture, write the log, or poll the child.
    Io { source: std::io::Error },
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Launch { program, reason } => {
                write!(f, "failed to launch {}: {reason}", program.display())
            }
            MonitorError::Capture { source } => {
                write!(f, "failed to set up capture file: {source}")
            }
            MonitorError::Io { source } => write!(f, "I/O error while monitoring test: {source}"),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Launch { .. } => None,
            MonitorError::Capture { source } => Some(source),
            MonitorError::Io { source } => Some(source),
        }
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(e: std::io::Error) -> Self {
        MonitorError::Io { source: e }
    }
}

impl MonitorError {
    fn into_status(self) -> RunStatus {
        match self {
            MonitorError::Launch { .. } => RunStatus::LaunchError {
                reason: self.to_string(),
            },
            MonitorError::Capture { .. } | MonitorError::Io { .. } => RunStatus::IoError {
                reason: self.to_string(),
            },
        }
    }
}

/// Exit code with signal deaths mapped to the negated signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Resolve the executable of an invocation against the working directory.
fn resolve_program(working_dir: &Path, invocation: &str) -> Result<PathBuf, MonitorError> {
    let program = program_of(invocation);
    if program.is_empty() {
        return Err(MonitorError::Launch {
            program: PathBuf::new(),
            reason: "empty invocation".to_string(),
        });
    }
    let suffix = std::env::consts::EXE_SUFFIX;
    let candidate = if program.ends_with(suffix) {
        working_dir.join(program)
    } else {
        working_dir.join(format!("{program}{suffix}"))
    };
    if !candidate.is_file() {
        return Err(MonitorError::Launch {
            program: candidate,
            reason: "test file does not exist".to_string(),
        });
    }
    std::fs::canonicalize(&candidate).map_err(|e| MonitorError::Launch {
        program: candidate,
        reason: e.to_string(),
    })
}

/// SIGKILL the child's whole process group, falling back to the child alone.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => return,
            Err(e) => tracing::warn!(pid, error = %e, "killpg failed, killing child only"),
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "failed to kill test process");
    }
}

/// Cheap to clone; shard monitors run as separate tasks sharing the log and console.
#[derive(Clone)]
pub struct Monitor {
    working_dir: PathBuf,
    classifier: Arc<Classifier>,
    log: Arc<ResultLog>,
    console: Arc<Console>,
    settings: MonitorSettings,
}

/// Mutable bookkeeping for one monitored process.
struct Watch<'j> {
    job: &'j Job,
    tally: LineTally,
    echo: EchoState,
    log_prefix: String,
}

impl Monitor {
    pub fn new(
        working_dir: PathBuf,
        classifier: Arc<Classifier>,
        log: Arc<ResultLog>,
        console: Arc<Console>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            working_dir,
            classifier,
            log,
            console,
            settings,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Same sinks, different settings.
    pub fn with_settings(&self, settings: MonitorSettings) -> Self {
        Self {
            settings,
            ..self.clone()
        }
    }

    /// Run one job to completion (or interrupt) and produce its result.
    ///
    /// Launch and I/O failures are reported through the result's status;
    /// they never abort the caller.
    pub async fn run_and_monitor(&self, job: &Job, interrupt: &mut Interrupt) -> Outcome {
        let start = Instant::now();
        let base = RunResult {
            shard: job.shard,
            ..RunResult::without_output(&job.test_name, &job.invocation, job.device, RunStatus::Success)
        };

        let program = match resolve_program(&self.working_dir, &job.invocation) {
            Ok(p) => p,
            Err(e) => return Outcome::Completed(self.failed_before_output(job, base, e, start)),
        };

        let capture = match self.create_capture() {
            Ok(c) => c,
            Err(e) => return Outcome::Completed(self.failed_before_output(job, base, e, start)),
        };

        let mut child = match self.spawn(job, &program, &capture) {
            Ok(c) => c,
            Err(e) => return Outcome::Completed(self.failed_before_output(job, base, e, start)),
        };
        tracing::info!(
            test = %job.test_name,
            pid = child.id().unwrap_or(0),
            capture = %capture.path().display(),
            "test process started"
        );

        let mut watch = Watch {
            job,
            tally: LineTally::default(),
            echo: match job.shard {
                Some(k) => EchoState::with_prefix(format!("[shard {k}] ")),
                None => EchoState::new(),
            },
            log_prefix: job.shard.map(|k| format!("[shard {k}] ")).unwrap_or_default(),
        };

        let watched = self.watch(&mut child, &capture, &mut watch, interrupt).await;
        let elapsed_secs = start.elapsed().as_secs_f64();

        let outcome = match watched {
            Ok((status, bytes, interrupted)) => {
                let code = exit_code(status);
                let result = RunResult {
                    status: RunStatus::from_exit(code, watch.tally.failures),
                    elapsed_secs,
                    bytes_consumed: bytes,
                    ..base
                }
                .with_tally(watch.tally);
                self.report_final_status(&result, &mut watch.echo, interrupted);
                if interrupted {
                    Outcome::Interrupted(result)
                } else {
                    Outcome::Completed(result)
                }
            }
            Err(e) => {
                tracing::error!(test = %job.test_name, error = %e, "monitoring failed, killing test");
                kill_process_group(&mut child);
                let _ = child.wait().await;
                self.screen_and_log(&mut watch.echo, &format!("ERROR: {e}"));
                let result = RunResult {
                    status: e.into_status(),
                    elapsed_secs,
                    ..base
                }
                .with_tally(watch.tally);
                Outcome::Completed(result)
            }
        };

        if let Some(dest) = &job.keep_capture_as {
            match archive::keep_capture(capture, dest, self.settings.compress_captures) {
                Ok(kept) => tracing::debug!(path = %kept.display(), "kept capture file"),
                Err(e) => tracing::warn!(error = %e, dest = %dest.display(), "failed to keep capture file"),
            }
        }

        outcome
    }

    fn create_capture(&self) -> Result<NamedTempFile, MonitorError> {
        let capture = match &self.settings.capture_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| MonitorError::Capture { source: e })?;
                NamedTempFile::new_in(dir)
            }
            None => NamedTempFile::new(),
        };
        capture.map_err(|e| MonitorError::Capture { source: e })
    }

    fn spawn(&self, job: &Job, program: &Path, capture: &NamedTempFile) -> Result<Child, MonitorError> {
        let stdout = capture
            .as_file()
            .try_clone()
            .map_err(|e| MonitorError::Capture { source: e })?;
        let stderr = capture
            .as_file()
            .try_clone()
            .map_err(|e| MonitorError::Capture { source: e })?;

        let args: Vec<&str> = job
            .invocation
            .split_whitespace()
            .skip(1)
            .chain(job.extra_args.iter().map(String::as_str))
            .collect();
        let cwd = program.parent().unwrap_or(self.working_dir.as_path());
        tracing::debug!(program = %program.display(), ?args, cwd = %cwd.display(), "spawning test");

        Command::new(program)
            .args(&args)
            .current_dir(cwd)
            .env(&self.settings.device_env_var, job.device.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()
            .map_err(|e| MonitorError::Launch {
                program: program.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// The polling loop.
    ///
    /// Each tick checks for exit first and reads second, so a read that comes
    /// back empty after exit was observed means nothing is left to drain.
    async fn watch(
        &self,
        child: &mut Child,
        capture: &NamedTempFile,
        watch: &mut Watch<'_>,
        interrupt: &mut Interrupt,
    ) -> Result<(ExitStatus, u64, bool), MonitorError> {
        let reader = capture
            .reopen()
            .map_err(|e| MonitorError::Capture { source: e })?;
        let mut tail = CaptureTail::new(reader);
        let mut exit: Option<ExitStatus> = None;
        let mut interrupted = false;
        let mut last_tick = Instant::now();
        let mut lines = Vec::new();

        loop {
            if exit.is_none() {
                exit = child.try_wait()?;
            }

            let consumed = tail.poll_lines(|line| lines.push(line.to_string()))?;
            for line in lines.drain(..) {
                self.handle_line(watch, &line)?;
            }

            if let Some(interval) = self.settings.status_interval {
                if last_tick.elapsed() >= interval {
                    let saw_output = tail.take_tick_activity();
                    if !watch.echo.has_echoed() {
                        self.console.progress(saw_output);
                    }
                    last_tick = Instant::now();
                }
            }

            if consumed > 0 {
                // A test that never stops writing still has to see Ctrl-C.
                if exit.is_none() && interrupt.take_pending() {
                    exit = Some(self.kill_on_interrupt(child, watch).await?);
                    interrupted = true;
                }
                tokio::task::yield_now().await;
                continue;
            }
            if let Some(status) = exit {
                tail.finish(|line| lines.push(line.to_string()));
                for line in lines.drain(..) {
                    self.handle_line(watch, &line)?;
                }
                return Ok((status, tail.cursor(), interrupted));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = interrupt.wait() => {
                    exit = Some(self.kill_on_interrupt(child, watch).await?);
                    interrupted = true;
                }
            }
        }
    }

    async fn kill_on_interrupt(
        &self,
        child: &mut Child,
        watch: &mut Watch<'_>,
    ) -> Result<ExitStatus, MonitorError> {
        tracing::warn!(test = %watch.job.test_name, "interrupted, killing test process");
        self.screen_and_log(
            &mut watch.echo,
            "FAILED: Execution interrupted. Killing test process.",
        );
        kill_process_group(child);
        Ok(child.wait().await?)
    }

    fn handle_line(&self, watch: &mut Watch<'_>, line: &str) -> Result<(), MonitorError> {
        let class = self.classifier.classify(line);
        watch.tally.record(class, line);
        match class {
            LineClass::FailedError => {
                tracing::error!(test = %watch.job.test_name, line, "test reported an error");
                watch.echo.echo(&self.console, FAILURE_INDENT, line);
            }
            LineClass::Failed | LineClass::Error => {
                watch.echo.echo(&self.console, FAILURE_INDENT, line);
            }
            LineClass::Passed => watch.echo.echo(&self.console, PASS_INDENT, line),
            LineClass::Other => {}
        }
        self.log.output_line(&format!("{}{line}", watch.log_prefix))?;
        Ok(())
    }

    /// Console and log notices for crashes and exit-code contradictions.
    fn report_final_status(&self, result: &RunResult, echo: &mut EchoState, interrupted: bool) {
        match &result.status {
            RunStatus::Crashed { exit_code } if !interrupted => {
                tracing::warn!(test = %result.test_name, exit_code, "test killed/crashed");
                self.screen_and_log(echo, &format!("ERROR: test killed/crashed: {exit_code}."));
            }
            RunStatus::Failure {
                failed_lines,
                exit_code: 0,
            } => {
                tracing::warn!(
                    test = %result.test_name,
                    failed_lines,
                    "test exited 0 but reported failures"
                );
                self.screen_and_log(
                    echo,
                    &format!(
                        "ERROR: Test returned 0, but number of FAILED lines reported is {failed_lines}."
                    ),
                );
            }
            _ => {}
        }
    }

    fn failed_before_output(
        &self,
        job: &Job,
        base: RunResult,
        error: MonitorError,
        start: Instant,
    ) -> RunResult {
        tracing::error!(test = %job.test_name, error = %error, "test could not be run");
        let mut echo = EchoState::new();
        self.screen_and_log(&mut echo, &format!("ERROR: {error}. Failing test."));
        RunResult {
            status: error.into_status(),
            elapsed_secs: start.elapsed().as_secs_f64(),
            ..base
        }
    }

    fn screen_and_log(&self, echo: &mut EchoState, text: &str) {
        echo.echo(&self.console, FAILURE_INDENT, text);
        if let Err(e) = self.log.line(&format!("{FAILURE_INDENT}{text}")) {
            tracing::warn!(error = %e, "failed to write to results log");
        }
    }
}
