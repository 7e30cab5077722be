//! Console transcript: the human-facing output on stdout.
//!
//! Diagnostics go through `tracing` to stderr; this is only the run transcript
//! (banners, BEGIN/PASSED/FAILED lines, echoed failure lines and progress
//! characters).

use std::io::Write;
use std::sync::Mutex;

pub struct Console {
    out: Mutex<Box<dyn Write + Send>>,
    quiet: bool,
}

impl Console {
    pub fn stdout(quiet: bool) -> Self {
        Self::from_writer(Box::new(std::io::stdout()), quiet)
    }

    pub fn from_writer(out: Box<dyn Write + Send>, quiet: bool) -> Self {
        Self {
            out: Mutex::new(out),
            quiet,
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Write a full line.
    pub fn line(&self, text: &str) {
        self.emit(&format!("{text}\n"));
    }

    /// Write without a trailing newline (for `BEGIN name: ` and progress).
    pub fn partial(&self, text: &str) {
        self.emit(text);
    }

    /// Write `:` if output arrived since the last tick, `.` otherwise.
    pub fn progress(&self, saw_output: bool) {
        if !self.quiet {
            self.emit(if saw_output { ":" } else { "." });
        }
    }

    fn emit(&self, text: &str) {
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Console write failures (closed pipe) must not fail the run.
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

/// Per-test echo state.
///
/// The first echoed line of a test breaks the `BEGIN name: ` line with a
/// newline; after that, progress characters are suppressed for the rest of
/// the test.
#[derive(Debug, Default)]
pub struct EchoState {
    started: bool,
    prefix: String,
}

impl EchoState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every echoed line (used for shard tags).
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            started: false,
            prefix: prefix.into(),
        }
    }

    pub fn has_echoed(&self) -> bool {
        self.started
    }

    /// Echo a notable line with the given indent marker.
    pub fn echo(&mut self, console: &Console, marker: &str, text: &str) {
        if console.is_quiet() {
            return;
        }
        if !self.started {
            console.line("");
            self.started = true;
        }
        console.line(&format!("{marker}{}{text}", self.prefix));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    /// Cloneable in-memory writer for inspecting console and log output.
    #[derive(Clone, Default)]
    pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::SharedBuf;
    use super::*;

    #[test]
    fn test_progress_characters() {
        let buf = SharedBuf::default();
        let console = Console::from_writer(Box::new(buf.clone()), false);
        console.progress(true);
        console.progress(false);
        assert_eq!(buf.contents(), ":.");
    }

    #[test]
    fn test_quiet_suppresses_progress_and_echo() {
        let buf = SharedBuf::default();
        let console = Console::from_writer(Box::new(buf.clone()), true);
        console.progress(true);
        let mut echo = EchoState::new();
        echo.echo(&console, "==> ", "x FAILED");
        console.line("summary");
        assert_eq!(buf.contents(), "summary\n");
    }

    #[test]
    fn test_first_echo_breaks_line() {
        let buf = SharedBuf::default();
        let console = Console::from_writer(Box::new(buf.clone()), false);
        console.partial("BEGIN x: ");
        let mut echo = EchoState::new();
        assert!(!echo.has_echoed());
        echo.echo(&console, "==> ", "a FAILED");
        echo.echo(&console, "    ", "b PASSED");
        assert!(echo.has_echoed());
        assert_eq!(buf.contents(), "BEGIN x: \n==> a FAILED\n    b PASSED\n");
    }

    #[test]
    fn test_echo_prefix() {
        let buf = SharedBuf::default();
        let console = Console::from_writer(Box::new(buf.clone()), false);
        let mut echo = EchoState::with_prefix("[shard 2] ");
        echo.echo(&console, "==> ", "a FAILED");
        assert_eq!(buf.contents(), "\n==> [shard 2] a FAILED\n");
    }
}
