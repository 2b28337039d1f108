//! Log reporter - streams the backend's log sink.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::retry::{Clock, TokioClock};

const FOLLOW_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Start from the last N lines instead of the beginning
    pub lines: Option<usize>,
    /// Keep printing appended output until cancelled
    pub follow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutcome {
    /// Tier has no log sink configured.
    NoSink,
    /// Sink path does not exist (yet).
    Missing(PathBuf),
    Streamed { bytes: u64 },
}

/// Read-only view of a tier's log sink.
pub struct LogReporter {
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    poll: Duration,
}

impl LogReporter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            clock: Arc::new(TokioClock),
            poll: FOLLOW_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn stream<W>(&self, out: &mut W, options: LogOptions, cancel: CancellationToken) -> Result<LogOutcome>
    where
        W: Write + Send,
    {
        let Some(path) = &self.path else {
            return Ok(LogOutcome::NoSink);
        };

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LogOutcome::Missing(path.clone())),
            Err(e) => return Err(e.into()),
        };

        let mut bytes = write_initial(&mut file, out, options.lines)?;
        out.flush()?;

        if !options.follow {
            return Ok(LogOutcome::Streamed { bytes });
        }

        let mut position = file.stream_position()?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(self.poll) => {}
            }

            // Truncated or rotated underneath us: start over.
            let len = file.metadata().map(|m| m.len()).unwrap_or(position);
            if len < position {
                position = file.seek(SeekFrom::Start(0))?;
            }

            let mut chunk = Vec::new();
            let read = file.read_to_end(&mut chunk)?;
            if read > 0 {
                out.write_all(&chunk)?;
                out.flush()?;
                bytes += read as u64;
                position += read as u64;
            }
        }

        Ok(LogOutcome::Streamed { bytes })
    }
}

fn write_initial<W: Write>(file: &mut File, out: &mut W, lines: Option<usize>) -> std::io::Result<u64> {
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;

    let start = match lines {
        Some(n) => tail_offset(&content, n),
        None => 0,
    };
    out.write_all(&content[start..])?;
    Ok((content.len() - start) as u64)
}

/// Byte offset where the last `n` lines begin.
fn tail_offset(content: &[u8], n: usize) -> usize {
    if n == 0 {
        return content.len();
    }
    // A trailing newline terminates the last line rather than starting a new one.
    let body = content.strip_suffix(b"\n").unwrap_or(content);
    body.iter()
        .enumerate()
        .rev()
        .filter(|(_, b)| **b == b'\n')
        .nth(n - 1)
        .map(|(i, _)| i + 1)
        .unwrap_or(0)
}
