/// Line classification by marker.
///
/// Each complete output line from a test is checked against three markers
/// (failure, error, pass). The first matching rule wins:
/// - failure and error marker: `FailedError` (counted)
/// - failure marker: `Failed` (counted)
/// - error marker: `Error` (echoed, not counted)
/// - pass marker: `Passed` (informational)
/// - otherwise: `Other`
use crate::config::MarkerConfig;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static DEFAULT_CLASSIFIER: LazyLock<Classifier> = LazyLock::new(|| {
    Classifier::new(&MarkerConfig::default()).expect("default markers are valid regexes")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineClass {
    FailedError,
    Failed,
    Error,
    Passed,
    Other,
}

impl LineClass {
    /// Whether this line increments the failure counter.
    pub fn is_failure(self) -> bool {
        matches!(self, LineClass::FailedError | LineClass::Failed)
    }

    /// Whether this line is echoed to the console as it arrives.
    pub fn is_notable(self) -> bool {
        !matches!(self, LineClass::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedLine {
    pub class: LineClass,
    pub text: String,
}

/// Compiled marker set.
#[derive(Debug, Clone)]
pub struct Classifier {
    failure: Regex,
    error: Regex,
    pass: Regex,
}

impl Classifier {
    pub fn new(markers: &MarkerConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            failure: Regex::new(&markers.failure)?,
            error: Regex::new(&markers.error)?,
            pass: Regex::new(&markers.pass)?,
        })
    }

    pub fn classify(&self, line: &str) -> LineClass {
        let failed = self.failure.is_match(line);
        let errored = self.error.is_match(line);
        if failed && errored {
            LineClass::FailedError
        } else if failed {
            LineClass::Failed
        } else if errored {
            LineClass::Error
        } else if self.pass.is_match(line) {
            LineClass::Passed
        } else {
            LineClass::Other
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        DEFAULT_CLASSIFIER.clone()
    }
}

/// Running totals for one test's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTally {
    pub failures: u32,
    pub lines: u64,
    /// Failure-marked lines, in arrival order.
    pub failure_lines: Vec<String>,
    /// Every non-`Other` line, in arrival order.
    pub notable_lines: Vec<ClassifiedLine>,
}

impl LineTally {
    pub fn record(&mut self, class: LineClass, text: &str) {
        self.lines += 1;
        if class.is_failure() {
            self.failures += 1;
            self.failure_lines.push(text.to_string());
        }
        if class.is_notable() {
            self.notable_lines.push(ClassifiedLine {
                class,
                text: text.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_and_error_is_failed_error() {
        let c = Classifier::default();
        assert_eq!(
            c.classify("ERROR: clEnqueueNDRangeKernel FAILED"),
            LineClass::FailedError
        );
    }

    #[test]
    fn test_failed_alone() {
        let c = Classifier::default();
        assert_eq!(c.classify("test_add FAILED"), LineClass::Failed);
    }

    #[test]
    fn test_error_alone_not_counted() {
        let c = Classifier::default();
        let class = c.classify("ERROR: something odd");
        assert_eq!(class, LineClass::Error);
        assert!(!class.is_failure());
        assert!(class.is_notable());
    }

    #[test]
    fn test_failure_wins_over_pass() {
        let c = Classifier::default();
        assert_eq!(c.classify("PASSED 3 FAILED 1"), LineClass::Failed);
    }

    #[test]
    fn test_passed_and_other() {
        let c = Classifier::default();
        assert_eq!(c.classify("RESULT PASSED"), LineClass::Passed);
        assert_eq!(c.classify("Initializing device"), LineClass::Other);
        assert_eq!(c.classify(""), LineClass::Other);
    }

    #[test]
    fn test_markers_are_case_sensitive_by_default() {
        let c = Classifier::default();
        assert_eq!(c.classify("failed to find"), LineClass::Other);
    }

    #[test]
    fn test_custom_markers() {
        let markers = MarkerConfig {
            failure: r"(?i)\bfail".to_string(),
            error: "FATAL".to_string(),
            pass: r"^ok\b".to_string(),
        };
        let c = Classifier::new(&markers).unwrap();
        assert_eq!(c.classify("test foo ... fail"), LineClass::Failed);
        assert_eq!(c.classify("FATAL: fail"), LineClass::FailedError);
        assert_eq!(c.classify("ok 1 - works"), LineClass::Passed);
    }

    #[test]
    fn test_invalid_marker_regex() {
        let markers = MarkerConfig {
            failure: "(".to_string(),
            ..MarkerConfig::default()
        };
        assert!(Classifier::new(&markers).is_err());
    }

    #[test]
    fn test_tally_records_in_order() {
        let c = Classifier::default();
        let mut tally = LineTally::default();
        for line in ["RESULT PASSED", "noise", "RESULT FAILED"] {
            tally.record(c.classify(line), line);
        }
        assert_eq!(tally.failures, 1);
        assert_eq!(tally.lines, 3);
        assert_eq!(tally.failure_lines, vec!["RESULT FAILED"]);
        assert_eq!(
            tally.notable_lines,
            vec![
                ClassifiedLine {
                    class: LineClass::Passed,
                    text: "RESULT PASSED".into()
                },
                ClassifiedLine {
                    class: LineClass::Failed,
                    text: "RESULT FAILED".into()
                },
            ]
        );
    }
}
