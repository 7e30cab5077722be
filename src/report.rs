/// JSON run report written next to the results log.
///
/// Rewritten after every test, so an aborted run still leaves a report of
/// everything that finished.
use crate::run_result::RunResult;
use crate::test_list::DeviceType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device: DeviceType,
    pub failures: u32,
    pub results: Vec<RunResult>,
}

impl DeviceSummary {
    pub fn new(device: DeviceType) -> Self {
        Self {
            device,
            failures: 0,
            results: Vec::new(),
        }
    }

    pub fn record(&mut self, result: RunResult) {
        if !result.status.is_success() {
            self.failures += 1;
        }
        self.results.push(result);
    }

    pub fn passed(&self) -> bool {
        self.failures == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub test_list: PathBuf,
    pub log_file: PathBuf,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub aborted: bool,
    pub tests_selected: usize,
    pub total_failures: u32,
    pub devices: Vec<DeviceSummary>,
}

impl RunReport {
    pub fn new(test_list: &Path, log_file: &Path, tests_selected: usize) -> Self {
        Self {
            test_list: test_list.to_path_buf(),
            log_file: log_file.to_path_buf(),
            started: Utc::now(),
            finished: None,
            aborted: false,
            tests_selected,
            total_failures: 0,
            devices: Vec::new(),
        }
    }

    /// Start collecting results for a device; returns its summary.
    pub fn begin_device(&mut self, device: DeviceType) -> &mut DeviceSummary {
        self.devices.push(DeviceSummary::new(device));
        let idx = self.devices.len() - 1;
        &mut self.devices[idx]
    }

    pub fn current_device(&mut self) -> Option<&mut DeviceSummary> {
        self.devices.last_mut()
    }

    /// Stamp the finish time and recompute totals.
    pub fn finish(&mut self, aborted: bool) {
        self.finished = Some(Utc::now());
        self.aborted = aborted;
        self.total_failures = self.devices.iter().map(|d| d.failures).sum();
    }
}

/// Atomic writer for the report file.
pub struct ReportFile {
    path: PathBuf,
}

impl ReportFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hidden sibling of the report, e.g. `.run.json.1234.tmp`.
    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report".to_string());
        self.path
            .with_file_name(format!(".{name}.{}.tmp", std::process::id()))
    }

    /// Replace the report on disk. Readers see either the old or the new
    /// report, never a partial one; a failed rename leaves no staging file.
    pub fn write(&self, report: &RunReport) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(report).map_err(ReportError::Serialize)?;
        let staging = self.staging_path();
        std::fs::write(&staging, &json).map_err(|source| ReportError::Stage {
            path: staging.clone(),
            source,
        })?;
        if let Err(source) = std::fs::rename(&staging, &self.path) {
            let _ = std::fs::remove_file(&staging);
            return Err(ReportError::Publish {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

/// Errors from writing the run report.
#[derive(Debug)]
pub enum ReportError {
    Serialize(serde_json::Error),
    /// Writing the staging file failed.
    Stage {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Moving the staging file over the report failed.
    Publish {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialize(e) => write!(f, "could not encode run report: {e}"),
            ReportError::Stage { path, source } => {
                write!(f, "could not stage run report at {}: {source}", path.display())
            }
            ReportError::Publish { path, source } => {
                write!(f, "could not replace run report {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Serialize(e) => Some(e),
            ReportError::Stage { source, .. } | ReportError::Publish { source, .. } => {
                Some(source)
            }
        }
    }
}
