// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Bounded capture of a pier's stdout and stderr.
//!
//! Output is kept for diagnostics only and never feeds pier state. Once the
//! buffer holds `capacity` lines, every new line evicts the oldest.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One captured line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Fixed-capacity ring of output lines.
#[derive(Debug)]
pub struct OutputBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<OutputLine>>,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<OutputLine>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, stream: OutputStream, line: String) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(OutputLine { stream, line });
    }

    /// Every buffered line, oldest first.
    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lock().iter().cloned().collect()
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<OutputLine> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Pump `reader` into `buffer` line by line until EOF.
pub(crate) async fn capture<R>(reader: R, stream: OutputStream, buffer: std::sync::Arc<OutputBuffer>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => buffer.push(stream, line),
            Ok(None) => break,
            Err(e) => {
                // Non-UTF-8 output or a broken pipe; stop capturing this stream.
                tracing::debug!(?stream, error = %e, "Output capture ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let buf = OutputBuffer::new(3);
        for i in 0..5 {
            buf.push(OutputStream::Stdout, format!("line {}", i));
        }
        let lines: Vec<String> = buf.snapshot().into_iter().map(|l| l.line).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_tail() {
        let buf = OutputBuffer::new(10);
        buf.push(OutputStream::Stdout, "a".to_string());
        buf.push(OutputStream::Stderr, "b".to_string());
        buf.push(OutputStream::Stdout, "c".to_string());

        let tail = buf.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, "b");
        assert_eq!(tail[0].stream, OutputStream::Stderr);
        assert_eq!(buf.tail(10).len(), 3);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let buf = OutputBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.push(OutputStream::Stdout, "x".to_string());
        buf.push(OutputStream::Stdout, "y".to_string());
        assert_eq!(buf.snapshot()[0].line, "y");
    }

    #[tokio::test]
    async fn test_capture_reads_lines() {
        let buf = std::sync::Arc::new(OutputBuffer::new(10));
        let input: &[u8] = b"hello\nworld\n";
        capture(input, OutputStream::Stdout, buf.clone()).await;
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.snapshot()[1].line, "world");
    }
}
