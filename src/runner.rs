//! Test sequence driver.
//!
//! Runs the selected tests once per device type, one test at a time (or one
//! test split across concurrent shards), and aggregates results into the
//! results log, the console transcript and the JSON report.

use crate::config::{ConfigError, InterruptPolicy, RunnerConfig};
use crate::console::Console;
use crate::monitor::{Job, Monitor, MonitorSettings};
use crate::output_dir::OutputDir;
use crate::report::{ReportFile, RunReport};
use crate::result_log::{timestamp, ResultLog};
use crate::run_result::{RunResult, RunStatus};
use crate::signals::SignalHandler;
use crate::test_list::{
    DeviceScope, DeviceType, Filter, Patterns, Predicate, SelectionError, TestCase,
    TestListError,
};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

const RULE: &str =
    "========================================================================================";

/// Errors that end the whole run.
#[derive(Debug)]
pub enum RunnerError {
    Config(ConfigError),
    TestList(TestListError),
    Selection(SelectionError),
    LogOpen {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The user chose to abort after an interrupt.
    Aborted,
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Config(e) => write!(f, "{e}"),
            RunnerError::TestList(e) => write!(f, "{e}"),
            RunnerError::Selection(e) => write!(f, "{e}"),
            RunnerError::LogOpen { path, source } => {
                write!(f, "could not open log file {}: {source}", path.display())
            }
            RunnerError::Aborted => write!(f, "test run aborted by user"),
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunnerError::Config(e) => Some(e),
            RunnerError::TestList(e) => Some(e),
            RunnerError::Selection(e) => Some(e),
            RunnerError::LogOpen { source, .. } => Some(source),
            RunnerError::Aborted => None,
        }
    }
}

impl From<ConfigError> for RunnerError {
    fn from(e: ConfigError) -> Self {
        RunnerError::Config(e)
    }
}

impl From<TestListError> for RunnerError {
    fn from(e: TestListError) -> Self {
        RunnerError::TestList(e)
    }
}

impl From<SelectionError> for RunnerError {
    fn from(e: SelectionError) -> Self {
        RunnerError::Selection(e)
    }
}

/// Command-line selector tokens, split by kind.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Selectors {
    pub devices: Vec<DeviceType>,
    pub patterns: Vec<String>,
    /// From a legacy `log=DIR` token.
    pub log_dir: Option<PathBuf>,
}

impl Selectors {
    /// Device tokens select devices, `log=DIR` sets the log directory, and
    /// anything else is a substring pattern. No device tokens means
    /// `CL_DEVICE_TYPE_DEFAULT`.
    pub fn parse(tokens: &[String]) -> Self {
        let mut selectors = Selectors::default();
        for token in tokens {
            if let Ok(device) = token.parse::<DeviceType>() {
                if !selectors.devices.contains(&device) {
                    selectors.devices.push(device);
                }
            } else if let Some(dir) = token.strip_prefix("log=") {
                selectors.log_dir = Some(PathBuf::from(dir.trim_end_matches(MAIN_SEPARATOR)));
            } else {
                selectors.patterns.push(token.clone());
            }
        }
        if selectors.devices.is_empty() {
            selectors.devices.push(DeviceType::Default);
        }
        selectors
    }
}

/// Replace `{shard}` and `{shard_count}` placeholders.
pub fn build_shard_args(template: &[String], shard: u32, shard_count: u32) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{shard}", &shard.to_string())
                .replace("{shard_count}", &shard_count.to_string())
        })
        .collect()
}

/// What to do after the in-flight test was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptDecision {
    Continue,
    Abort,
}

pub struct Runner {
    monitor: Monitor,
    log: Arc<ResultLog>,
    console: Arc<Console>,
    output: OutputDir,
    report_file: ReportFile,
    signals: SignalHandler,
    on_interrupt: InterruptPolicy,
    shards: u32,
    shard_args: Vec<String>,
    keep_captures: bool,
    /// Interrupt generation already accounted for. A newer one seen while no
    /// test is running aborts the run.
    handled_interrupts: AtomicU64,
}

impl Runner {
    pub fn new(
        config: &RunnerConfig,
        monitor: Monitor,
        output: OutputDir,
        signals: SignalHandler,
        log: Arc<ResultLog>,
        console: Arc<Console>,
    ) -> Self {
        Self {
            monitor,
            log,
            console,
            report_file: ReportFile::new(output.report()),
            output,
            handled_interrupts: AtomicU64::new(signals.generation()),
            signals,
            on_interrupt: config.run.on_interrupt,
            shards: config.run.shards.max(1),
            shard_args: config.run.shard_args.clone(),
            keep_captures: config.output.keep_captures,
        }
    }

    /// Write a line to both the console and the results log.
    fn say(&self, text: &str) {
        self.console.line(text);
        if let Err(e) = self.log.line(text) {
            tracing::warn!(error = %e, "failed to write to results log");
        }
    }

    fn log_best_effort(&self, written: std::io::Result<()>) {
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write to results log");
        }
    }

    /// Tests that run on at least one of the devices, in list order.
    pub fn selected<'t>(
        tests: &'t [TestCase],
        devices: &[DeviceType],
        patterns: &[String],
    ) -> Vec<&'t TestCase> {
        let by_pattern = Filter::new().with(Patterns(patterns.to_vec()));
        tests
            .iter()
            .filter(|t| by_pattern.admits(t))
            .filter(|t| devices.iter().any(|d| DeviceScope(*d).admits(t)))
            .collect()
    }

    /// Run every selected test on every device.
    ///
    /// On abort the report is still written (marked aborted) before
    /// `RunnerError::Aborted` is returned.
    pub async fn run(
        &self,
        test_list: &Path,
        tests: &[TestCase],
        devices: &[DeviceType],
        patterns: &[String],
    ) -> Result<RunReport, RunnerError> {
        let selected = Self::selected(tests, devices, patterns);
        let log_path = self
            .log
            .path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output.log());
        let mut report = RunReport::new(test_list, &log_path, selected.len());

        self.announce(test_list, &log_path, devices, &selected);

        for &device in devices {
            let aborted = self.run_device(device, tests, patterns, &mut report).await;
            if aborted {
                report.finish(true);
                self.write_report(&report);
                return Err(RunnerError::Aborted);
            }
        }

        report.finish(false);
        self.say(&format!(
            "({}) Testing complete.  {} failures for {} tests.",
            timestamp(),
            report.total_failures,
            selected.len()
        ));
        self.write_report(&report);
        Ok(report)
    }

    fn announce(
        &self,
        test_list: &Path,
        log_path: &Path,
        devices: &[DeviceType],
        selected: &[&TestCase],
    ) {
        let names: Vec<&str> = devices.iter().map(DeviceType::as_str).collect();
        self.say(&format!("Testing on: [{}]", names.join(", ")));
        self.say(&format!("Logging to file {}.", log_path.display()));
        self.say(&format!(
            "Loaded tests from {}, total of {} tests selected to run:",
            test_list.display(),
            selected.len()
        ));
        for test in selected {
            self.say(&format!("{:<50} ({})", test.name, test.invocation));
        }
    }

    /// Returns true if the user aborted.
    async fn run_device(
        &self,
        device: DeviceType,
        tests: &[TestCase],
        patterns: &[String],
        report: &mut RunReport,
    ) -> bool {
        self.say(RULE);
        self.say(RULE);
        self.say(&format!(
            "{:^90}",
            format!("Setting {} to {}", self.monitor.settings().device_env_var, device)
        ));
        self.say(RULE);
        self.say(RULE);

        let filter = Filter::new()
            .with(DeviceScope(device))
            .with(Patterns(patterns.to_vec()));
        let selected = filter.apply(tests);
        let by_pattern = Patterns(patterns.to_vec());
        for skipped in tests
            .iter()
            .filter(|t| by_pattern.admits(t) && !DeviceScope(device).admits(t))
        {
            if let Some(scope) = skipped.device_scope {
                self.console.line(&format!(
                    "Skipping {} because {} is not {}.",
                    skipped.name, scope, device
                ));
            }
        }

        report.begin_device(device);
        let total = selected.len();
        let mut previous_invocation: Option<&str> = None;
        let mut aborted = false;

        for (idx, test) in selected.into_iter().enumerate() {
            if self.interrupted_while_idle() {
                self.say("Interrupted between tests. Aborting all tests.");
                return true;
            }

            let invocation = test.invocation.as_str();
            if previous_invocation != Some(invocation) {
                self.console.line(&format!("==========   {invocation}"));
                self.log_best_effort(self.log.section_header(invocation));
                previous_invocation = Some(invocation);
            }

            self.console.partial(&format!(
                "({})     BEGIN  {:<40}: ",
                timestamp(),
                test.name
            ));
            self.log_best_effort(self.log.test_header(&test.name));

            let (mut result, interrupted) = self.run_test(test, idx + 1, device).await;
            self.mark_interrupts_handled();
            if interrupted {
                let decision = match self.on_interrupt {
                    InterruptPolicy::Ask => self.ask_abort().await,
                    InterruptPolicy::Continue => InterruptDecision::Continue,
                    InterruptPolicy::Abort => InterruptDecision::Abort,
                };
                let exit_code = match result.status {
                    RunStatus::Crashed { exit_code } => exit_code,
                    _ => -1,
                };
                result.status = RunStatus::Failure {
                    failed_lines: result.failure_count(),
                    exit_code,
                };
                self.mark_interrupts_handled();
                match decision {
                    InterruptDecision::Abort => {
                        self.say("User chose to abort all tests.");
                        aborted = true;
                    }
                    InterruptDecision::Continue => {
                        self.say("User chose to continue with other tests. Reporting this test as failed.");
                    }
                }
            }

            self.finish_test(&result, idx + 1, total);
            if let Some(summary) = report.current_device() {
                summary.record(result);
            }
            self.write_report(report);
            if aborted {
                return true;
            }
        }

        let (passed, failures) = report
            .current_device()
            .map(|d| (d.passed(), d.failures))
            .unwrap_or((true, 0));
        self.say(RULE);
        if passed {
            self.say(&format!(">> TEST on {device} PASSED"));
        } else {
            self.say(&format!(">> TEST on {device} FAILED ({failures} FAILURES)"));
        }
        self.say(RULE);
        false
    }

    fn finish_test(&self, result: &RunResult, number: usize, total: usize) {
        let passed = result.status.is_success();
        let verdict = if passed { "PASSED" } else { "FAILED" };
        self.console.line(&format!(
            "({})     {verdict} {:<40}: ({:>3}s, test {:>3}/{total})",
            timestamp(),
            result.test_name,
            result.elapsed_secs as u64,
            number,
        ));
        tracing::info!(
            test = %result.test_name,
            device = %result.device,
            status = ?result.status,
            elapsed_secs = result.elapsed_secs,
            "test finished"
        );
        self.log_best_effort(self.log.test_summary(
            &result.test_name,
            passed,
            &result.status.summary(),
            result.elapsed_secs,
        ));
    }

    /// Run one test, sharded if configured. Returns the result and whether
    /// it was interrupted.
    async fn run_test(
        &self,
        test: &TestCase,
        index: usize,
        device: DeviceType,
    ) -> (RunResult, bool) {
        if self.shards <= 1 {
            let job = self.job(test, index, device, None);
            let mut interrupt = self.signals.subscribe();
            let outcome = self.monitor.run_and_monitor(&job, &mut interrupt).await;
            let interrupted = outcome.is_interrupted();
            return (outcome.into_result(), interrupted);
        }

        let shard_monitor = self.monitor.with_settings(MonitorSettings {
            status_interval: None,
            ..self.monitor.settings().clone()
        });
        let mut set = JoinSet::new();
        for shard in 1..=self.shards {
            let job = self.job(test, index, device, Some(shard));
            let monitor = shard_monitor.clone();
            let mut interrupt = self.signals.subscribe();
            set.spawn(async move { monitor.run_and_monitor(&job, &mut interrupt).await });
        }

        let mut results = Vec::new();
        let mut interrupted = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    interrupted |= outcome.is_interrupted();
                    results.push(outcome.into_result());
                }
                Err(e) => {
                    tracing::error!(test = %test.name, error = %e, "shard task failed");
                    results.push(RunResult::without_output(
                        &test.name,
                        &test.invocation,
                        device,
                        RunStatus::IoError {
                            reason: format!("shard task failed: {e}"),
                        },
                    ));
                }
            }
        }
        results.sort_by_key(|r| r.shard);
        let merged = RunResult::merge_shards(results).unwrap_or_else(|| {
            RunResult::without_output(&test.name, &test.invocation, device, RunStatus::Success)
        });
        (merged, interrupted)
    }

    fn job(&self, test: &TestCase, index: usize, device: DeviceType, shard: Option<u32>) -> Job {
        Job {
            test_name: test.name.clone(),
            invocation: test.invocation.clone(),
            extra_args: shard
                .map(|k| build_shard_args(&self.shard_args, k, self.shards))
                .unwrap_or_default(),
            device,
            shard,
            keep_capture_as: self
                .keep_captures
                .then(|| self.output.capture_file(device, index, &test.name, shard)),
        }
    }

    /// Prompt on the terminal. Anything containing `y` aborts; EOF or a
    /// further Ctrl-C while waiting for the answer aborts too.
    async fn ask_abort(&self) -> InterruptDecision {
        self.console.partial("Abort all tests? (y/n) ");
        let mut interrupt = self.signals.subscribe();
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|n| (n, line))
        });
        tokio::select! {
            answer = answer => match answer {
                Ok(Ok((n, line))) if n > 0 && !line.contains('y') => InterruptDecision::Continue,
                _ => InterruptDecision::Abort,
            },
            _ = interrupt.wait() => {
                self.console.line("");
                InterruptDecision::Abort
            }
        }
    }

    fn interrupted_while_idle(&self) -> bool {
        self.signals.generation() != self.handled_interrupts.load(Ordering::SeqCst)
    }

    fn mark_interrupts_handled(&self) {
        self.handled_interrupts
            .store(self.signals.generation(), Ordering::SeqCst);
    }

    fn write_report(&self, report: &RunReport) {
        if let Err(e) = self.report_file.write(report) {
            tracing::warn!(error = %e, path = %self.report_file.path().display(), "failed to write run report");
        }
    }
}
