mod archive;
mod classify;
mod config;
mod console;
mod monitor;
mod output_dir;
mod report;
mod result_log;
mod run_result;
mod runner;
mod signals;
mod tail;
mod test_list;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use classify::Classifier;
use config::{ConfigError, InterruptPolicy, RunnerConfig};
use console::Console;
use monitor::{Monitor, MonitorSettings};
use output_dir::OutputDir;
use result_log::ResultLog;
use runner::{Runner, RunnerError, Selectors};
use signals::SignalHandler;
use test_list::TestCase;

/// Exit code for usage errors, missing inputs and user abort.
const EXIT_FATAL: i32 = -1;
/// Largest failure count reported through the exit code.
const EXIT_MAX_FAILURES: u32 = 125;

/// Run an OpenCL conformance test list, one test at a time per device type,
/// and aggregate the results into a timestamped log.
#[derive(Parser, Debug)]
#[command(name = "run-conformance", version, about)]
pub struct Cli {
    /// Test list file (`name,command` or `deviceType,name,command` per line)
    #[arg(value_name = "TEST_LIST")]
    test_list: PathBuf,

    /// Device types (CL_DEVICE_TYPE_*), `log=DIR`, or substring patterns
    #[arg(value_name = "SELECTORS")]
    selectors: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "conformance.toml")]
    config: PathBuf,

    /// Directory for the results log and report (overrides config)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Seconds between capture polls (overrides config)
    #[arg(long)]
    poll_interval: Option<f64>,

    /// Seconds between progress characters, 0 disables (overrides config)
    #[arg(long)]
    status_interval: Option<u64>,

    /// Split each test into N concurrent shards (overrides config)
    #[arg(long)]
    shards: Option<u32>,

    /// What to do when Ctrl-C interrupts a test (overrides config)
    #[arg(long, value_enum)]
    on_interrupt: Option<InterruptPolicy>,

    /// Keep each test's capture file under the log directory
    #[arg(long)]
    keep_captures: bool,

    /// Print the selected tests and resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Suppress per-line echo on the console, keep BEGIN/PASSED/FAILED
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Layer command-line overrides on top of the loaded config.
    fn apply_overrides(&self, config: &mut RunnerConfig, log_dir: Option<PathBuf>) {
        if let Some(dir) = self.log_dir.clone().or(log_dir) {
            config.output.dir = dir;
        }
        if let Some(secs) = self.poll_interval {
            config.monitor.poll_interval_secs = secs;
        }
        if let Some(secs) = self.status_interval {
            config.monitor.status_interval_secs = secs;
        }
        if let Some(shards) = self.shards {
            config.run.shards = shards;
        }
        if let Some(policy) = self.on_interrupt {
            config.run.on_interrupt = policy;
        }
        if self.keep_captures {
            config.output.keep_captures = true;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "run_conformance=debug"
    } else {
        "run_conformance=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli, selectors: &Selectors) -> Result<RunnerConfig, ConfigError> {
    let mut config = RunnerConfig::load(&cli.config)?;
    cli.apply_overrides(&mut config, selectors.log_dir.clone());
    config.validate()?;
    Ok(config)
}

fn print_dry_run(config: &RunnerConfig, tests: &[TestCase], selectors: &Selectors) {
    let devices: Vec<&str> = selectors.devices.iter().map(|d| d.as_str()).collect();
    println!("Devices:        [{}]", devices.join(", "));
    println!("Log directory:  {}", config.output.dir.display());
    println!("Poll interval:  {}s", config.monitor.poll_interval_secs);
    println!("Shards:         {}", config.run.shards);
    println!("On interrupt:   {:?}", config.run.on_interrupt);
    let selected = Runner::selected(tests, &selectors.devices, &selectors.patterns);
    println!("Selected tests: {}", selected.len());
    for test in selected {
        match test.device_scope {
            Some(scope) => println!("  {:<40} {} [{scope}]", test.name, test.invocation),
            None => println!("  {:<40} {}", test.name, test.invocation),
        }
    }
}

/// Clamp a failure count into a usable process exit code.
fn failure_exit_code(failures: u32) -> i32 {
    if failures == 0 {
        0
    } else {
        failures.min(EXIT_MAX_FAILURES) as i32
    }
}

fn fatal(error: &dyn std::error::Error) -> i32 {
    tracing::error!(error = %error, "fatal");
    eprintln!("ERROR: {error}");
    EXIT_FATAL
}

async fn run(cli: Cli) -> Result<u32, RunnerError> {
    let selectors = Selectors::parse(&cli.selectors);
    let config = load_config(&cli, &selectors)?;
    let tests = test_list::load(&cli.test_list)?;

    // Patterns only count against tests that run on a selected device.
    let candidates: Vec<TestCase> = Runner::selected(&tests, &selectors.devices, &[])
        .into_iter()
        .cloned()
        .collect();
    for pattern in test_list::unmatched_patterns(&candidates, &selectors.patterns) {
        eprintln!("Warning: no test matches \"{pattern}\"");
    }
    test_list::check_patterns(&candidates, &selectors.patterns)?;

    if cli.dry_run {
        print_dry_run(&config, &tests, &selectors);
        return Ok(0);
    }

    let output = OutputDir::new(
        &config.output.dir,
        &result_log::log_file_name(&config.output.log_prefix),
    );
    let log_path = output.log();
    output.init().map_err(|e| RunnerError::LogOpen {
        path: log_path.clone(),
        source: e,
    })?;
    let log = Arc::new(
        ResultLog::create(&log_path).map_err(|e| RunnerError::LogOpen {
            path: log_path.clone(),
            source: e,
        })?,
    );
    let console = Arc::new(Console::stdout(cli.quiet));

    let classifier = Classifier::new(&config.markers)
        .map_err(|e| ConfigError::Invalid(format!("invalid marker pattern: {e}")))?;
    let settings = MonitorSettings {
        poll_interval: config.monitor.poll_interval(),
        status_interval: config.monitor.status_interval(),
        device_env_var: config.run.device_env_var.clone(),
        capture_dir: config
            .output
            .keep_captures
            .then(|| output.captures_dir().join(".tmp")),
        compress_captures: config.output.compress_captures,
    };
    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let monitor = Monitor::new(
        working_dir,
        Arc::new(classifier),
        Arc::clone(&log),
        Arc::clone(&console),
        settings,
    );

    let runner = Runner::new(
        &config,
        monitor,
        output,
        SignalHandler::install(),
        log,
        console,
    );
    let report = runner
        .run(
            &cli.test_list,
            &tests,
            &selectors.devices,
            &selectors.patterns,
        )
        .await?;
    Ok(report.total_failures)
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_FATAL } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(failures) => failure_exit_code(failures),
        Err(RunnerError::Aborted) => {
            tracing::warn!("run aborted by user");
            EXIT_FATAL
        }
        Err(e) => fatal(&e),
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_selectors_and_overrides() {
        let cli = Cli::try_parse_from([
            "run-conformance",
            "list.csv",
            "CL_DEVICE_TYPE_GPU",
            "images",
            "--shards",
            "4",
            "--on-interrupt",
            "continue",
            "--poll-interval",
            "0.5",
        ])
        .unwrap();
        assert_eq!(cli.test_list, PathBuf::from("list.csv"));
        assert_eq!(cli.selectors, vec!["CL_DEVICE_TYPE_GPU", "images"]);

        let mut config = RunnerConfig::default();
        cli.apply_overrides(&mut config, None);
        assert_eq!(config.run.shards, 4);
        assert_eq!(config.run.on_interrupt, InterruptPolicy::Continue);
        assert_eq!(config.monitor.poll_interval_secs, 0.5);
    }

    #[test]
    fn test_log_dir_flag_beats_log_selector() {
        let cli = Cli::try_parse_from(["run-conformance", "l", "--log-dir", "/a"]).unwrap();
        let mut config = RunnerConfig::default();
        cli.apply_overrides(&mut config, Some(PathBuf::from("/b")));
        assert_eq!(config.output.dir, PathBuf::from("/a"));

        let cli = Cli::try_parse_from(["run-conformance", "l"]).unwrap();
        cli.apply_overrides(&mut config, Some(PathBuf::from("/b")));
        assert_eq!(config.output.dir, PathBuf::from("/b"));
    }

    #[test]
    fn test_missing_test_list_is_usage_error() {
        assert!(Cli::try_parse_from(["run-conformance"]).is_err());
    }

    #[test]
    fn test_failure_exit_code_clamped() {
        assert_eq!(failure_exit_code(0), 0);
        assert_eq!(failure_exit_code(3), 3);
        assert_eq!(failure_exit_code(1000), 125);
    }

    #[tokio::test]
    async fn test_missing_list_is_fatal() {
        let cli = Cli::try_parse_from([
            "run-conformance",
            "/nonexistent/list.csv",
            "-c",
            "/nonexistent/conformance.toml",
        ])
        .unwrap();
        let err = run(cli).await.unwrap_err();
        assert!(matches!(err, RunnerError::TestList(_)));
    }

    #[tokio::test]
    async fn test_unmatched_patterns_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.csv");
        std::fs::write(&list, "Basic,basic/test_basic\n").unwrap();
        let cli = Cli::try_parse_from([
            "run-conformance",
            list.to_str().unwrap(),
            "nothing_matches",
            "-c",
            "/nonexistent/conformance.toml",
        ])
        .unwrap();
        let err = run(cli).await.unwrap_err();
        assert!(matches!(err, RunnerError::Selection(_)));
    }

    #[tokio::test]
    async fn test_pattern_matching_only_other_device_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.csv");
        std::fs::write(&list, "CL_DEVICE_TYPE_CPU,cpuonly,bin/true\n").unwrap();
        let cli = Cli::try_parse_from([
            "run-conformance",
            list.to_str().unwrap(),
            "cpuonly",
            "--log-dir",
            dir.path().join("logs").to_str().unwrap(),
            "-c",
            "/nonexistent/conformance.toml",
        ])
        .unwrap();
        let err = run(cli).await.unwrap_err();
        assert!(matches!(err, RunnerError::Selection(_)));
        assert!(!dir.path().join("logs").exists());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.csv");
        std::fs::write(&list, "Basic,basic/test_basic\n").unwrap();
        let logs = dir.path().join("logs");
        let cli = Cli::try_parse_from([
            "run-conformance",
            list.to_str().unwrap(),
            "--dry-run",
            "--log-dir",
            logs.to_str().unwrap(),
            "-c",
            "/nonexistent/conformance.toml",
        ])
        .unwrap();
        assert_eq!(run(cli).await.unwrap(), 0);
        assert!(!logs.exists());
    }
}
