//! Incremental reader over a capture file that another process appends to.
//!
//! The reader keeps an explicit byte cursor. Each poll seeks to the cursor,
//! reads whatever has been appended since, and splits it into complete lines.
//! Bytes after the last `\n` stay in a pending buffer until their terminator
//! arrives or the tail is finished. The cursor only moves forward, so no byte
//! is read twice and none is skipped.

use std::io::{self, Read, Seek, SeekFrom};

const CHUNK_SIZE: usize = 8 * 1024;

/// Per-process reader state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorState {
    /// Bytes consumed from the start of the capture file.
    pub read_cursor: u64,
    /// Bytes of the current line seen so far (no terminator yet).
    pub pending_line: Vec<u8>,
    /// Set when bytes arrive; cleared by each progress tick.
    pub saw_output_since_last_tick: bool,
}

pub struct CaptureTail<R> {
    reader: R,
    state: MonitorState,
    chunk: Vec<u8>,
}

impl<R: Read + Seek> CaptureTail<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: MonitorState::default(),
            chunk: vec![0; CHUNK_SIZE],
        }
    }

    /// Consume everything appended since the cursor.
    ///
    /// Calls `on_line` once per complete line, without its terminator.
    /// Returns the number of bytes consumed by this call.
    pub fn poll_lines(&mut self, mut on_line: impl FnMut(&str)) -> io::Result<u64> {
        self.reader.seek(SeekFrom::Start(self.state.read_cursor))?;
        let mut consumed = 0u64;
        loop {
            let n = match self.reader.read(&mut self.chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            for &byte in &self.chunk[..n] {
                if byte == b'\n' {
                    on_line(&decode_line(&self.state.pending_line));
                    self.state.pending_line.clear();
                } else {
                    self.state.pending_line.push(byte);
                }
            }
            self.state.read_cursor += n as u64;
            consumed += n as u64;
        }
        if consumed > 0 {
            self.state.saw_output_since_last_tick = true;
        }
        Ok(consumed)
    }

    /// Emit a trailing unterminated line, if any. Call once no more bytes can arrive.
    pub fn finish(&mut self, mut on_line: impl FnMut(&str)) {
        if !self.state.pending_line.is_empty() {
            on_line(&decode_line(&self.state.pending_line));
            self.state.pending_line.clear();
        }
    }

    /// Whether output arrived since the previous call; resets the flag.
    pub fn take_tick_activity(&mut self) -> bool {
        std::mem::take(&mut self.state.saw_output_since_last_tick)
    }

    pub fn cursor(&self) -> u64 {
        self.state.read_cursor
    }

    #[cfg(test)]
    pub fn state(&self) -> &MonitorState {
        &self.state
    }
}

/// Lossy UTF-8 decode with a trailing `\r` stripped.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
