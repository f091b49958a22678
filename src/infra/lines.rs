//! Record framing - turns arbitrary read chunks into complete lines
//!
//! Subprocess reads split records anywhere, including inside a UTF-8
//! sequence. Bytes are buffered until a newline is seen, so a record is only
//! ever parsed once it is whole.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Incremental newline framer
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed (without the `\n`).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Flush whatever is left after the stream ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Tail of a side-channel file polled for appended content
///
/// Only whole lines are consumed; the offset stays at the last newline so a
/// half-written record is read again on the next poll.
pub struct TelemetryTail {
    path: PathBuf,
    position: u64,
}

impl TelemetryTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read content appended since the last poll.
    pub fn read_new(&mut self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to open telemetry file {}", self.path.display()))?;
        let file_len = file.metadata()?.len();

        // truncated or rotated
        if file_len < self.position {
            tracing::debug!(path = %self.path.display(), "Telemetry file shrank, rewinding");
            self.position = 0;
        }
        if file_len == self.position {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(self.position))?;
        let mut buf = Vec::with_capacity((file_len - self.position) as usize);
        file.read_to_end(&mut buf)?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(None);
        };
        let complete = &buf[..=last_newline];
        self.position += complete.len() as u64;
        Ok(Some(String::from_utf8_lossy(complete).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_feed_buffers_partial_lines() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.feed(br#"{"type":"assis"#).is_empty());
        let lines = buffer.feed(b"tant\"}\n{\"type\":");
        assert_eq!(lines, vec![r#"{"type":"assistant"}"#.to_string()]);
        assert_eq!(buffer.pending_len(), 8);
        assert_eq!(buffer.finish().as_deref(), Some(r#"{"type":"#));
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_feed_handles_split_utf8() {
        let mut buffer = LineBuffer::new();
        let text = "héllo\n".as_bytes();
        assert!(buffer.feed(&text[..2]).is_empty());
        assert_eq!(buffer.feed(&text[2..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_feed_multiple_lines_in_one_chunk() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.feed(b"a\n\nb\n");
        assert_eq!(lines, vec!["a".to_string(), String::new(), "b".to_string()]);
    }

    #[test]
    fn test_tail_reads_only_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.log");
        let mut tail = TelemetryTail::new(&path);
        assert!(tail.read_new().unwrap().is_none());

        let mut file = File::create(&path).unwrap();
        write!(file, "{{\n  \"a\": 1").unwrap();
        file.flush().unwrap();
        assert_eq!(tail.read_new().unwrap().as_deref(), Some("{\n"));

        writeln!(file, "\n}}").unwrap();
        file.flush().unwrap();
        assert_eq!(tail.read_new().unwrap().as_deref(), Some("  \"a\": 1\n}\n"));
        assert!(tail.read_new().unwrap().is_none());
    }

    #[test]
    fn test_tail_rewinds_when_file_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.log");
        std::fs::write(&path, "first line\nsecond line\n").unwrap();

        let mut tail = TelemetryTail::new(&path);
        assert!(tail.read_new().unwrap().is_some());
        assert_eq!(tail.position(), 23);

        std::fs::write(&path, "new\n").unwrap();
        assert_eq!(tail.read_new().unwrap().as_deref(), Some("new\n"));
        assert_eq!(tail.position(), 4);
    }
}
