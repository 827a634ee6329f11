//! File Tailer — follows one session transcript file from a byte offset,
//! emitting parsed records as they arrive.
//!
//! State is an offset plus a carried-over partial-line tail: truncation is
//! handled by resetting both to zero, chunks are read as `[offset, size)`
//! and split on `\n` with the last (possibly partial) piece held back for
//! the next read.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_protocol::Record;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::record::{self, ParseError};

#[derive(Debug, Error)]
pub enum TailError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tailer for {0} terminated")]
    Terminated(String),
}

/// What a tail pass produced.
#[derive(Debug, Clone)]
pub enum TailEvent {
    /// A fully parsed record, tagged with whether it was part of the
    /// initial historical catch-up read (file contents present before the
    /// tailer started) or observed live.
    Record { record: Record, historical: bool },
    /// A line was present but failed to parse; logged and skipped rather
    /// than stalling the rest of the file.
    Malformed { reason: String },
    /// The file shrank since the last read — truncated or replaced.
    Truncated,
}

/// Per-file state: byte offset already consumed, and any trailing partial
/// line carried over from the previous read.
pub struct Tailer {
    pub path: PathBuf,
    pub session_id: String,
    offset: u64,
    tail: String,
    historical_phase: bool,
    backoff: Duration,
}

const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

impl Tailer {
    /// A fresh tailer starting at offset 0. The first [`Tailer::poll`] call
    /// will read the whole file and tag every record `historical = true`.
    pub fn new(path: PathBuf, session_id: String) -> Self {
        Self {
            path,
            session_id,
            offset: 0,
            tail: String::new(),
            historical_phase: true,
            backoff: MIN_BACKOFF,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read any bytes appended since the last poll and return the events
    /// they produced. Safe to call repeatedly; a no-op if nothing changed.
    pub fn poll(&mut self) -> Result<Vec<TailEvent>, TailError> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TailError::Terminated(self.session_id.clone()))
            }
            Err(e) => {
                return Err(TailError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        let size = metadata.len();

        let mut events = Vec::new();
        if size < self.offset {
            self.offset = 0;
            self.tail.clear();
            self.historical_phase = true;
            events.push(TailEvent::Truncated);
        }

        if size == self.offset {
            // Nothing new, but a poll still completes the historical catch-up
            // phase: a file that was empty at discovery has no historical
            // content to tag, so the next line appended is live.
            self.historical_phase = false;
            return Ok(events);
        }

        let chunk = read_chunk(&self.path, self.offset, size)?;
        self.offset = size;

        let combined = format!("{}{}", self.tail, chunk);
        let mut lines: Vec<&str> = combined.split('\n').collect();
        self.tail = lines.pop().unwrap_or_default().to_string();

        let historical = self.historical_phase;
        for line in lines {
            match record::parse(line) {
                Ok(Some(rec)) => events.push(TailEvent::Record {
                    record: rec,
                    historical,
                }),
                Ok(None) => {}
                Err(ParseError::Syntax { reason, excerpt } | ParseError::Schema { reason, excerpt }) => {
                    warn!(
                        component = "tailer",
                        event = "tailer.malformed_line",
                        session_id = %self.session_id,
                        reason = %reason,
                        excerpt = %excerpt,
                    );
                    events.push(TailEvent::Malformed { reason });
                }
            }
        }
        self.historical_phase = false;

        self.backoff = MIN_BACKOFF;
        Ok(events)
    }

    /// Exponential backoff to use before the next retry after an I/O error.
    pub fn next_backoff(&mut self) -> Duration {
        let current = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        current
    }
}

fn read_chunk(path: &Path, offset: u64, size: u64) -> Result<String, TailError> {
    let mut file = std::fs::File::open(path).map_err(|e| TailError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    file.seek(SeekFrom::Start(offset)).map_err(|e| TailError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut buf = vec![0u8; (size - offset) as usize];
    file.read_exact(&mut buf).map_err(|e| TailError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Runs a tailer to completion, forwarding events to `tx` with a blocking
/// (never-drop) send, backing off on I/O errors, polling `poll_every`
/// between wakeups and on every `notify::Event` touching this file routed
/// through `wake_rx`.
pub async fn run(
    mut tailer: Tailer,
    tx: mpsc::Sender<(String, TailEvent)>,
    mut wake_rx: mpsc::Receiver<()>,
    poll_every: Duration,
) {
    let session_id = tailer.session_id.clone();
    loop {
        match tailer.poll() {
            Ok(events) => {
                for event in events {
                    if tx.send((session_id.clone(), event)).await.is_err() {
                        return;
                    }
                }
            }
            Err(TailError::Terminated(_)) => return,
            Err(e) => {
                warn!(
                    component = "tailer",
                    event = "tailer.io_error",
                    session_id = %session_id,
                    error = %e,
                );
                tokio::time::sleep(tailer.next_backoff()).await;
                continue;
            }
        }

        tokio::select! {
            woken = wake_rx.recv() => {
                if woken.is_none() {
                    return;
                }
            }
            _ = tokio::time::sleep(poll_every) => {}
        }
    }
}
