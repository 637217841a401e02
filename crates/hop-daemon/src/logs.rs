//! In-memory log buffer
//!
//! The daemon keeps its recent log lines so a client can fetch them with a
//! `logs` request. Plugged into `tracing_subscriber` as a writer.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::MakeWriter;

/// Default number of retained lines
pub const DEFAULT_LOG_LINES: usize = 2000;

/// Bounded, shareable log line buffer
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(256)))),
            capacity: capacity.max(1),
        }
    }

    pub fn push_line(&self, line: &str) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    /// All retained lines, newline separated
    pub fn contents(&self) -> String {
        let lines = self.lock();
        let mut out = String::new();
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        // A panic mid-push leaves the deque consistent
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_LINES)
    }
}

/// Collects one formatted event, flushed into the buffer on drop
pub struct LogWriter {
    buffer: LogBuffer,
    pending: Vec<u8>,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.pending);
        for line in text.lines().filter(|l| !l.is_empty()) {
            self.buffer.push_line(line);
        }
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            buffer: self.clone(),
            pending: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_capacity_drops_oldest() {
        let buffer = LogBuffer::new(2);

        buffer.push_line("one");
        buffer.push_line("two");
        buffer.push_line("three");

        assert_eq!(buffer.contents(), "two\nthree\n");
    }

    #[test]
    fn test_writer_splits_lines() {
        let buffer = LogBuffer::new(10);

        {
            let mut writer = buffer.make_writer();
            writer.write_all(b"first line\nsecond ").unwrap();
            writer.write_all(b"line\n").unwrap();
        }

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.contents(), "first line\nsecond line\n");
    }

    #[test]
    fn test_clear() {
        let buffer = LogBuffer::default();
        buffer.push_line("something");

        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.contents(), "");
    }
}
