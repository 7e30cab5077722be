//! Aggregate results log.
//!
//! Append-only text file shared by every test of a run. Every write is
//! flushed immediately so `tail -f` on the log shows progress in near real
//! time.

use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const RULE_WIDTH: usize = 88;
const BANNER_WIDTH: usize = 91;

/// Local time in the log's `16-Oct 14:03:59` format.
pub fn timestamp() -> String {
    Local::now().format("%d-%b %H:%M:%S").to_string()
}

/// Log file name for a run started now: `{prefix}_YYYY-MM-DD_HH-MM.log`.
pub fn log_file_name(prefix: &str) -> String {
    format!("{prefix}_{}.log", Local::now().format("%Y-%m-%d_%H-%M"))
}

pub struct ResultLog {
    path: Option<PathBuf>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ResultLog {
    /// Create (truncate) the log file.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            out: Mutex::new(Box::new(file)),
        })
    }

    pub fn from_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            path: None,
            out: Mutex::new(out),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one line and flush.
    pub fn line(&self, text: &str) -> std::io::Result<()> {
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        out.write_all(text.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }

    /// One captured output line from a test.
    pub fn output_line(&self, text: &str) -> std::io::Result<()> {
        self.line(&format!("     {text}"))
    }

    /// Header written when the invocation changes between consecutive tests.
    pub fn section_header(&self, invocation: &str) -> std::io::Result<()> {
        let rule = "=".repeat(RULE_WIDTH);
        self.line(&rule)?;
        self.line(&rule)?;
        self.line(&format!("({})     Running Tests: {invocation}", timestamp()))?;
        self.line(&rule)?;
        self.line(&rule)
    }

    pub fn test_header(&self, test_name: &str) -> std::io::Result<()> {
        let rule = format!("     {}", "-".repeat(RULE_WIDTH));
        self.line(&rule)?;
        self.line(&format!(
            "     ({})     Running Sub Test: {test_name}",
            timestamp()
        ))?;
        self.line(&rule)
    }

    /// Summary block closing one test.
    pub fn test_summary(
        &self,
        test_name: &str,
        passed: bool,
        detail: &str,
        elapsed_secs: f64,
    ) -> std::io::Result<()> {
        let rule = format!("     {}", "-".repeat(RULE_WIDTH));
        self.line(&rule)?;
        if passed {
            self.line(&format!(
                "     ({})     Test {test_name} passed in {elapsed_secs:.1}s",
                timestamp()
            ))?;
        } else {
            let stars = format!("  {}", "*".repeat(BANNER_WIDTH));
            self.line(&stars)?;
            self.line(&format!(
                "  *  ({})     Test {test_name} ==> FAILED: {detail} ({elapsed_secs:.1}s)",
                timestamp()
            ))?;
            self.line(&stars)?;
        }
        self.line(&rule)?;
        self.line("")
    }
}
