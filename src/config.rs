use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from conformance.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RunnerConfig {
    pub monitor: MonitorConfig,
    pub markers: MarkerConfig,
    pub output: OutputConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sleep between reads when the test produced no new output.
    pub poll_interval_secs: f64,
    /// Interval between `.`/`:` progress characters. 0 disables them.
    pub status_interval_secs: u64,
}

/// Regular expressions used to classify test output lines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub failure: String,
    pub error: String,
    pub pass: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub log_prefix: String,
    /// Keep each test's capture file under `<dir>/captures/`.
    pub keep_captures: bool,
    /// zstd-compress kept capture files.
    pub compress_captures: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPolicy {
    /// Prompt on the terminal.
    Ask,
    /// Fail the interrupted test and keep going.
    Continue,
    /// Stop the whole run.
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Environment variable that tells the test which device type to use.
    pub device_env_var: String,
    pub on_interrupt: InterruptPolicy,
    /// Number of concurrent shards per test. 1 runs the test unsharded.
    pub shards: u32,
    /// Arguments appended to each shard's invocation.
    /// `{shard}` and `{shard_count}` are replaced.
    pub shard_args: Vec<String>,
}

// --- Default implementations ---

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1.0,
            status_interval_secs: 60,
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            failure: "FAILED".to_string(),
            error: "ERROR".to_string(),
            pass: "PASSED".to_string(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            log_prefix: "opencl_conformance_results".to_string(),
            keep_captures: false,
            compress_captures: true,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            device_env_var: "CL_DEVICE_TYPE".to_string(),
            on_interrupt: InterruptPolicy::Ask,
            shards: 1,
            shard_args: vec!["--shard".to_string(), "{shard}/{shard_count}".to_string()],
        }
    }
}

impl MonitorConfig {
    /// Falls back to one second for values `validate` would reject.
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval_secs).unwrap_or(Duration::from_secs(1))
    }

    /// `None` when progress characters are disabled.
    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl RunnerConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let poll = self.monitor.poll_interval_secs;
        if !(poll.is_finite() && poll > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "monitor.poll_interval_secs must be > 0 (got {poll})"
            )));
        }
        if let Err(e) = Duration::try_from_secs_f64(poll) {
            return Err(ConfigError::Invalid(format!(
                "monitor.poll_interval_secs out of range (got {poll}): {e}"
            )));
        }
        if self.run.shards == 0 {
            return Err(ConfigError::Invalid("run.shards must be at least 1".into()));
        }
        if self.run.device_env_var.is_empty() {
            return Err(ConfigError::Invalid("run.device_env_var is empty".into()));
        }
        for (name, pattern) in [
            ("failure", &self.markers.failure),
            ("error", &self.markers.error),
            ("pass", &self.markers.pass),
        ] {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::Invalid(format!("markers.{name}: {e}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.monitor.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.monitor.status_interval(), Some(Duration::from_secs(60)));
        assert_eq!(cfg.markers.failure, "FAILED");
        assert_eq!(cfg.output.log_prefix, "opencl_conformance_results");
        assert_eq!(cfg.run.device_env_var, "CL_DEVICE_TYPE");
        assert_eq!(cfg.run.on_interrupt, InterruptPolicy::Ask);
        assert_eq!(cfg.run.shards, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let cfg: RunnerConfig = toml::from_str(
            r#"
[monitor]
poll_interval_secs = 0.25

[run]
on_interrupt = "continue"
shards = 4
"#,
        )
        .unwrap();
        assert_eq!(cfg.monitor.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.monitor.status_interval_secs, 60);
        assert_eq!(cfg.run.on_interrupt, InterruptPolicy::Continue);
        assert_eq!(cfg.run.shards, 4);
        assert_eq!(cfg.run.shard_args, vec!["--shard", "{shard}/{shard_count}"]);
        assert_eq!(cfg.markers.pass, "PASSED");
    }

    #[test]
    fn test_zero_status_interval_disables_progress() {
        let cfg: RunnerConfig = toml::from_str("[monitor]\nstatus_interval_secs = 0\n").unwrap();
        assert_eq!(cfg.monitor.status_interval(), None);
    }

    #[test]
    fn test_validate_rejects_non_positive_poll_interval() {
        let mut cfg = RunnerConfig::default();
        cfg.monitor.poll_interval_secs = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        cfg.monitor.poll_interval_secs = -1.0;
        assert!(cfg.validate().is_err());
        cfg.monitor.poll_interval_secs = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_huge_poll_interval() {
        let mut cfg = RunnerConfig::default();
        cfg.monitor.poll_interval_secs = 1e20;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("out of range"));
        // Never panics, even unvalidated.
        assert_eq!(cfg.monitor.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_shards_and_bad_markers() {
        let mut cfg = RunnerConfig::default();
        cfg.run.shards = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RunnerConfig::default();
        cfg.markers.error = "[".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("markers.error"));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let cfg = RunnerConfig::load(Path::new("/nonexistent/conformance.toml")).unwrap();
        assert_eq!(cfg.run.shards, 1);
    }

    #[test]
    fn test_load_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conformance.toml");
        std::fs::write(&path, "[monitor\npoll = ").unwrap();
        let err = RunnerConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conformance.toml");
        std::fs::write(
            &path,
            "[output]\ndir = \"logs\"\nkeep_captures = true\n\n[markers]\nfailure = \"FAIL\"\n",
        )
        .unwrap();
        let cfg = RunnerConfig::load(&path).unwrap();
        assert_eq!(cfg.output.dir, PathBuf::from("logs"));
        assert!(cfg.output.keep_captures);
        assert!(cfg.output.compress_captures);
        assert_eq!(cfg.markers.failure, "FAIL");
    }
}
