//! Bounded output ring buffer.

use std::collections::VecDeque;

use familiar_core::OutputStream;
use serde::Serialize;

/// Default line cap for an agent's buffer.
pub const DEFAULT_MAX_LINES: usize = 2_000;

/// Default byte cap for an agent's buffer.
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Keeps the most recent output lines, bounded by both line count and total bytes.
/// The oldest lines are dropped first.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    bytes: usize,
    max_lines: usize,
    max_bytes: usize,
    dropped: u64,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES, DEFAULT_MAX_BYTES)
    }
}

impl OutputBuffer {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_lines: max_lines.max(1),
            max_bytes: max_bytes.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, stream: OutputStream, line: impl Into<String>) {
        let mut line = line.into();
        if line.len() > self.max_bytes {
            let mut cut = self.max_bytes;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }
        self.bytes += line.len();
        self.lines.push_back(OutputLine { stream, line });

        while self.lines.len() > self.max_lines || self.bytes > self.max_bytes {
            match self.lines.pop_front() {
                Some(old) => {
                    self.bytes -= old.line.len();
                    self.dropped += 1;
                }
                None => break,
            }
        }
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<OutputLine> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Buffered stdout joined with newlines.
    pub fn stdout_text(&self) -> String {
        self.lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    /// Lines evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_oldest_by_line_count() {
        let mut buf = OutputBuffer::new(3, 1024);
        for i in 0..5 {
            buf.push(OutputStream::Stdout, format!("line {i}"));
        }
        let tail: Vec<String> = buf.tail(10).into_iter().map(|l| l.line).collect();
        assert_eq!(tail, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buf.dropped(), 2);
    }

    #[test]
    fn trims_oldest_by_bytes() {
        let mut buf = OutputBuffer::new(100, 10);
        buf.push(OutputStream::Stdout, "aaaa");
        buf.push(OutputStream::Stderr, "bbbb");
        buf.push(OutputStream::Stdout, "cccc");
        assert_eq!(buf.len(), 2);
        assert!(buf.byte_len() <= 10);
        assert_eq!(buf.tail(1)[0].line, "cccc");

        // A single oversized line is truncated rather than evicting everything.
        buf.push(OutputStream::Stdout, "x".repeat(50));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.byte_len(), 10);
    }

    #[test]
    fn stdout_text_skips_stderr() {
        let mut buf = OutputBuffer::default();
        buf.push(OutputStream::Stdout, "one");
        buf.push(OutputStream::Stderr, "warning");
        buf.push(OutputStream::Stdout, "two");
        assert_eq!(buf.stdout_text(), "one\ntwo");
        assert_eq!(buf.tail(2).len(), 2);
    }
}
