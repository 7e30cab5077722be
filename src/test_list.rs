//! Test list loading and selection.
//!
//! A test list is a line-oriented text file. Each non-comment line is either
//! `name,command` or `deviceType,name,command`. Lines starting with `#` are
//! comments. Device-scoped lines only run on their device type; unscoped lines
//! run on every selected device type.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::str::FromStr;

/// OpenCL device types a test run can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceType {
    #[serde(rename = "CL_DEVICE_TYPE_DEFAULT")]
    Default,
    #[serde(rename = "CL_DEVICE_TYPE_CPU")]
    Cpu,
    #[serde(rename = "CL_DEVICE_TYPE_GPU")]
    Gpu,
    #[serde(rename = "CL_DEVICE_TYPE_ACCELERATOR")]
    Accelerator,
    #[serde(rename = "CL_DEVICE_TYPE_ALL")]
    All,
}

impl DeviceType {
    pub const ALL_TYPES: [DeviceType; 5] = [
        DeviceType::Default,
        DeviceType::Cpu,
        DeviceType::Gpu,
        DeviceType::Accelerator,
        DeviceType::All,
    ];

    /// The token used in list files, on the command line, and in the
    /// environment of the test process.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Default => "CL_DEVICE_TYPE_DEFAULT",
            DeviceType::Cpu => "CL_DEVICE_TYPE_CPU",
            DeviceType::Gpu => "CL_DEVICE_TYPE_GPU",
            DeviceType::Accelerator => "CL_DEVICE_TYPE_ACCELERATOR",
            DeviceType::All => "CL_DEVICE_TYPE_ALL",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::ALL_TYPES
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown device type: {s}"))
    }
}

/// One entry of the test list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    /// Command plus arguments, relative to the runner's working directory.
    pub invocation: String,
    /// `None` means the test runs on every device type.
    pub device_scope: Option<DeviceType>,
}

/// First whitespace-separated token of an invocation string.
pub fn program_of(invocation: &str) -> &str {
    invocation.split_whitespace().next().unwrap_or("")
}

/// Errors that can occur while loading a test list.
#[derive(Debug)]
pub enum TestListError {
    /// The list file does not exist.
    NotFound { path: PathBuf },
    /// The list file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for TestListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestListError::NotFound { path } => {
                write!(f, "test_list \"{}\" does not exist", path.display())
            }
            TestListError::Read { path, source } => {
                write!(f, "failed to read test list {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for TestListError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TestListError::NotFound { .. } => None,
            TestListError::Read { source, .. } => Some(source),
        }
    }
}

/// Load and parse a test list file.
pub fn load(path: &Path) -> Result<Vec<TestCase>, TestListError> {
    if !path.exists() {
        return Err(TestListError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|e| TestListError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tests = parse(&text);
    tracing::debug!(path = %path.display(), count = tests.len(), "loaded test list");
    Ok(tests)
}

/// Parse test list text into an ordered sequence of test cases.
pub fn parse(text: &str) -> Vec<TestCase> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, line)| parse_line(idx + 1, line))
        .collect()
}

fn parse_line(line_no: usize, line: &str) -> Option<TestCase> {
    if line.starts_with('#') || line.trim().is_empty() {
        return None;
    }

    let fields: Vec<&str> = line.splitn(3, ',').map(str::trim).collect();
    if fields.len() == 3 {
        if let Ok(device) = fields[0].parse::<DeviceType>() {
            return make_case(line_no, fields[1], fields[2], Some(device));
        }
    }

    // Not device-scoped: the command keeps any further commas.
    match line.split_once(',') {
        Some((name, command)) => make_case(line_no, name.trim(), command.trim(), None),
        None => {
            tracing::warn!(line_no, line, "skipping test list line without a command");
            None
        }
    }
}

fn make_case(
    line_no: usize,
    name: &str,
    command: &str,
    device_scope: Option<DeviceType>,
) -> Option<TestCase> {
    if name.is_empty() || command.is_empty() {
        tracing::warn!(line_no, "skipping test list line with an empty field");
        return None;
    }
    Some(TestCase {
        name: to_host_separators(name),
        invocation: to_host_separators(command),
        device_scope,
    })
}

fn to_host_separators(s: &str) -> String {
    s.replace('/', &MAIN_SEPARATOR.to_string())
}

/// A membership test over test cases.
pub trait Predicate {
    fn admits(&self, test: &TestCase) -> bool;
}

/// Admits unscoped tests and tests scoped to the given device.
pub struct DeviceScope(pub DeviceType);

impl Predicate for DeviceScope {
    fn admits(&self, test: &TestCase) -> bool {
        match test.device_scope {
            Some(scope) => scope == self.0,
            None => true,
        }
    }
}

/// Admits tests whose name or invocation contains any of the patterns.
pub struct Patterns(pub Vec<String>);

impl Patterns {
    fn matches(pattern: &str, test: &TestCase) -> bool {
        test.name.contains(pattern) || test.invocation.contains(pattern)
    }
}

impl Predicate for Patterns {
    fn admits(&self, test: &TestCase) -> bool {
        self.0.is_empty() || self.0.iter().any(|p| Self::matches(p, test))
    }
}

/// Conjunction of predicates. An empty filter admits everything.
#[derive(Default)]
pub struct Filter {
    predicates: Vec<Box<dyn Predicate + Send + Sync>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: impl Predicate + Send + Sync + 'static) -> Self {
        self.predicates.push(Box::new(predicate));
        self
    }

    pub fn admits(&self, test: &TestCase) -> bool {
        self.predicates.iter().all(|p| p.admits(test))
    }

    /// Apply the filter, preserving list order.
    pub fn apply<'a>(&self, tests: &'a [TestCase]) -> Vec<&'a TestCase> {
        tests.iter().filter(|t| self.admits(t)).collect()
    }
}

/// Errors from resolving caller-supplied patterns against the list.
#[derive(Debug, PartialEq, Eq)]
pub enum SelectionError {
    /// Patterns were given but none of them matched any test.
    NoMatches { patterns: Vec<String> },
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionError::NoMatches { patterns } => write!(
                f,
                "failed to find any tests matching the given options: {}",
                patterns.join(", ")
            ),
        }
    }
}

impl std::error::Error for SelectionError {}

/// Patterns that match no test in the list.
pub fn unmatched_patterns<'a>(tests: &[TestCase], patterns: &'a [String]) -> Vec<&'a str> {
    patterns
        .iter()
        .filter(|p| !tests.iter().any(|t| Patterns::matches(p, t)))
        .map(String::as_str)
        .collect()
}

/// Check that at least one pattern selects something.
pub fn check_patterns(tests: &[TestCase], patterns: &[String]) -> Result<(), SelectionError> {
    if patterns.is_empty() {
        return Ok(());
    }
    if unmatched_patterns(tests, patterns).len() == patterns.len() {
        return Err(SelectionError::NoMatches {
            patterns: patterns.to_vec(),
        });
    }
    Ok(())
}
