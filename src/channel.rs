//! Channel readers: one independently scheduled reader per monitored stream.
//!
//! Each reader consumes raw bytes from its descriptor, reassembles them into
//! lines, records activity on the shared tracker, and forwards events to the
//! coordinator over an mpsc channel. Per-channel line order is preserved by
//! the mpsc FIFO; cross-channel interleaving is best-effort. A read error is
//! treated as that channel's EOF and never disturbs other channels.

use crate::state::{ActivityTracker, StopFlag};
use std::io::Read;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifies one monitored stream by its descriptor number in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub i32);

impl ChannelId {
    pub const STDOUT: ChannelId = ChannelId(1);
    pub const STDERR: ChannelId = ChannelId(2);
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            1 => write!(f, "stdout"),
            2 => write!(f, "stderr"),
            n => write!(f, "fd{n}"),
        }
    }
}

/// Forwarding mode for a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Forward each line the instant its newline is observed (default).
    #[default]
    Unbuffered,
    /// Forward all lines of a read wakeup as one batch; fewer coordinator
    /// wakeups at the cost of immediacy.
    Buffered,
}

/// Events produced by channel readers.
#[derive(Debug)]
pub enum ReaderEvent {
    Line { channel: ChannelId, text: String },
    Batch { channel: ChannelId, lines: Vec<String> },
    Eof { channel: ChannelId },
}

/// Reassembles a byte stream into text lines.
///
/// Splits on `\n`, strips a preceding `\r`, and flushes any final partial
/// line as-is at stream close. Non-UTF-8 bytes are replaced, never dropped.
#[derive(Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; completed lines are appended to `out`.
    pub fn push(&mut self, bytes: &[u8], out: &mut Vec<String>) {
        self.buf.extend_from_slice(bytes);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            out.push(String::from_utf8_lossy(&line).into_owned());
        }
    }

    /// Flush the trailing partial line at stream close, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}

async fn deliver(
    tx: &mpsc::Sender<ReaderEvent>,
    channel: ChannelId,
    mode: ReadMode,
    lines: &mut Vec<String>,
) -> bool {
    match mode {
        ReadMode::Unbuffered => {
            for text in lines.drain(..) {
                if tx.send(ReaderEvent::Line { channel, text }).await.is_err() {
                    return false;
                }
            }
        }
        ReadMode::Buffered => {
            let batch = std::mem::take(lines);
            if tx
                .send(ReaderEvent::Batch {
                    channel,
                    lines: batch,
                })
                .await
                .is_err()
            {
                return false;
            }
        }
    }
    true
}

/// Spawn an async reader task for a child pipe (stdout/stderr).
pub fn spawn_reader<R>(
    mut reader: R,
    channel: ChannelId,
    mode: ReadMode,
    tracker: Arc<ActivityTracker>,
    stop: StopFlag,
    tx: mpsc::Sender<ReaderEvent>,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        let mut framer = LineFramer::new();
        let mut lines = Vec::new();
        loop {
            if stop.is_set() {
                break;
            }
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    if let Some(rest) = framer.finish() {
                        lines.push(rest);
                        tracker.record_line();
                        deliver(&tx, channel, mode, &mut lines).await;
                    }
                    break;
                }
                Ok(n) => {
                    framer.push(&chunk[..n], &mut lines);
                    if !lines.is_empty() {
                        tracker.record_line();
                        if !deliver(&tx, channel, mode, &mut lines).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    // Contained: this channel reports EOF, others keep going
                    tracing::warn!(channel = %channel, error = %e, "read error, treating as EOF");
                    break;
                }
            }
        }
        let _ = tx.send(ReaderEvent::Eof { channel }).await;
    })
}

/// Spawn a blocking-thread reader for an auxiliary descriptor pipe.
///
/// Aux pipes are plain fds without reactor registration; reads block a
/// dedicated thread, matching the one-unit-per-channel scheduling model.
pub fn spawn_fd_reader(
    mut file: std::fs::File,
    channel: ChannelId,
    mode: ReadMode,
    tracker: Arc<ActivityTracker>,
    stop: StopFlag,
    tx: mpsc::Sender<ReaderEvent>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut chunk = [0u8; 8192];
        let mut framer = LineFramer::new();
        let mut lines = Vec::new();
        loop {
            if stop.is_set() {
                break;
            }
            match file.read(&mut chunk) {
                Ok(0) => {
                    if let Some(rest) = framer.finish() {
                        lines.push(rest);
                        tracker.record_line();
                        deliver_blocking(&tx, channel, mode, &mut lines);
                    }
                    break;
                }
                Ok(n) => {
                    framer.push(&chunk[..n], &mut lines);
                    if !lines.is_empty() {
                        tracker.record_line();
                        if !deliver_blocking(&tx, channel, mode, &mut lines) {
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "read error, treating as EOF");
                    break;
                }
            }
        }
        let _ = tx.blocking_send(ReaderEvent::Eof { channel });
    })
}

fn deliver_blocking(
    tx: &mpsc::Sender<ReaderEvent>,
    channel: ChannelId,
    mode: ReadMode,
    lines: &mut Vec<String>,
) -> bool {
    match mode {
        ReadMode::Unbuffered => {
            for text in lines.drain(..) {
                if tx
                    .blocking_send(ReaderEvent::Line { channel, text })
                    .is_err()
                {
                    return false;
                }
            }
        }
        ReadMode::Buffered => {
            let batch = std::mem::take(lines);
            if tx
                .blocking_send(ReaderEvent::Batch {
                    channel,
                    lines: batch,
                })
                .is_err()
            {
                return false;
            }
        }
    }
    true
}
