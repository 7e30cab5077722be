/// Per-test outcome and the rules that turn an exit code plus counted
/// failure lines into a final status.
use crate::classify::{ClassifiedLine, LineTally};
use crate::test_list::DeviceType;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Failure markers were seen, or the process exited nonzero.
    Failure { failed_lines: u32, exit_code: i32 },
    /// The process was killed by a signal (negative exit code).
    Crashed { exit_code: i32 },
    /// The executable was missing or could not be spawned.
    LaunchError { reason: String },
    /// The capture file could not be created or read.
    IoError { reason: String },
}

impl RunStatus {
    /// Decide the status of a test that ran to completion.
    ///
    /// A negative exit code is a crash regardless of counted failures.
    /// Exit 0 with failure lines is still a failure.
    pub fn from_exit(exit_code: i32, failed_lines: u32) -> Self {
        if exit_code < 0 {
            RunStatus::Crashed { exit_code }
        } else if exit_code != 0 || failed_lines > 0 {
            RunStatus::Failure {
                failed_lines,
                exit_code,
            }
        } else {
            RunStatus::Success
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success)
    }

    /// Short value written after `==> FAILED:` in the log.
    pub fn summary(&self) -> String {
        match self {
            RunStatus::Success => "0".to_string(),
            RunStatus::Failure {
                failed_lines,
                exit_code: 0,
            } => format!("{failed_lines} FAILED lines"),
            RunStatus::Failure { exit_code, .. } => format!("exit code {exit_code}"),
            RunStatus::Crashed { exit_code } => format!("crashed ({exit_code})"),
            RunStatus::LaunchError { reason } => format!("launch error: {reason}"),
            RunStatus::IoError { reason } => format!("I/O error: {reason}"),
        }
    }

    /// Ordering used when merging shards: the worst status wins.
    fn severity(&self) -> u8 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failure { .. } => 1,
            RunStatus::Crashed { .. } => 2,
            RunStatus::IoError { .. } => 3,
            RunStatus::LaunchError { .. } => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub test_name: String,
    pub invocation: String,
    pub device: DeviceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<u32>,
    pub status: RunStatus,
    pub elapsed_secs: f64,
    pub failure_lines: Vec<String>,
    pub notable_lines: Vec<ClassifiedLine>,
    pub bytes_consumed: u64,
}

impl RunResult {
    /// A result for a test that never produced output.
    pub fn without_output(
        test_name: &str,
        invocation: &str,
        device: DeviceType,
        status: RunStatus,
    ) -> Self {
        Self {
            test_name: test_name.to_string(),
            invocation: invocation.to_string(),
            device,
            shard: None,
            status,
            elapsed_secs: 0.0,
            failure_lines: Vec::new(),
            notable_lines: Vec::new(),
            bytes_consumed: 0,
        }
    }

    /// Number of failure-marked lines seen.
    pub fn failure_count(&self) -> u32 {
        self.failure_lines.len() as u32
    }

    pub fn with_tally(mut self, tally: LineTally) -> Self {
        self.failure_lines = tally.failure_lines;
        self.notable_lines = tally.notable_lines;
        self
    }

    /// Combine shard results of one test into a single result.
    ///
    /// The worst shard status wins; failure counts are summed. Elapsed time
    /// is the longest shard since shards run concurrently.
    pub fn merge_shards(results: Vec<RunResult>) -> Option<RunResult> {
        let mut iter = results.into_iter();
        let mut merged = iter.next()?;
        merged.shard = None;
        for r in iter {
            merged.elapsed_secs = merged.elapsed_secs.max(r.elapsed_secs);
            merged.bytes_consumed += r.bytes_consumed;
            merged.failure_lines.extend(r.failure_lines);
            merged.notable_lines.extend(r.notable_lines);
            if r.status.severity() > merged.status.severity() {
                merged.status = r.status;
            }
        }
        if let RunStatus::Failure {
            ref mut failed_lines,
            ..
        } = merged.status
        {
            *failed_lines = merged.failure_lines.len() as u32;
        }
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: RunStatus, failures: &[&str], elapsed: f64) -> RunResult {
        RunResult {
            failure_lines: failures.iter().map(|s| s.to_string()).collect(),
            elapsed_secs: elapsed,
            ..RunResult::without_output("t", "t", DeviceType::Default, status)
        }
    }

    #[test]
    fn test_exit_zero_without_failures_is_success() {
        assert_eq!(RunStatus::from_exit(0, 0), RunStatus::Success);
    }

    #[test]
    fn test_exit_zero_with_failed_lines_is_failure() {
        assert_eq!(
            RunStatus::from_exit(0, 1),
            RunStatus::Failure {
                failed_lines: 1,
                exit_code: 0
            }
        );
    }

    #[test]
    fn test_negative_exit_is_crash_without_failures() {
        assert_eq!(
            RunStatus::from_exit(-11, 0),
            RunStatus::Crashed { exit_code: -11 }
        );
    }

    #[test]
    fn test_crash_takes_precedence_over_failures() {
        assert_eq!(
            RunStatus::from_exit(-6, 4),
            RunStatus::Crashed { exit_code: -6 }
        );
    }

    #[test]
    fn test_nonzero_exit_without_markers_is_failure() {
        assert_eq!(
            RunStatus::from_exit(3, 0),
            RunStatus::Failure {
                failed_lines: 0,
                exit_code: 3
            }
        );
    }

    #[test]
    fn test_summary_text() {
        assert_eq!(RunStatus::from_exit(0, 2).summary(), "2 FAILED lines");
        assert_eq!(RunStatus::from_exit(1, 2).summary(), "exit code 1");
        assert_eq!(RunStatus::from_exit(-9, 0).summary(), "crashed (-9)");
    }

    #[test]
    fn test_status_serializes_tagged() {
        let json = serde_json::to_value(RunStatus::from_exit(-11, 0)).unwrap();
        assert_eq!(json["kind"], "crashed");
        assert_eq!(json["exit_code"], -11);
    }

    #[test]
    fn test_merge_shards_sums_failures() {
        let merged = RunResult::merge_shards(vec![
            result(RunStatus::Success, &[], 1.0),
            result(RunStatus::from_exit(0, 1), &["a FAILED"], 3.0),
            result(RunStatus::from_exit(1, 2), &["b FAILED", "c FAILED"], 2.0),
        ])
        .unwrap();
        assert_eq!(
            merged.status,
            RunStatus::Failure {
                failed_lines: 3,
                exit_code: 0
            }
        );
        assert_eq!(merged.failure_count(), 3);
        assert_eq!(merged.elapsed_secs, 3.0);
    }

    #[test]
    fn test_merge_shards_crash_wins() {
        let merged = RunResult::merge_shards(vec![
            result(RunStatus::from_exit(0, 1), &["x FAILED"], 1.0),
            result(RunStatus::Crashed { exit_code: -11 }, &[], 1.0),
        ])
        .unwrap();
        assert_eq!(merged.status, RunStatus::Crashed { exit_code: -11 });
    }

    #[test]
    fn test_merge_shards_empty() {
        assert!(RunResult::merge_shards(Vec::new()).is_none());
    }
}
