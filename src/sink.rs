//! Output sink: fan-out of every forwarded line to the console and an
//! optional log file.
//!
//! The core guarantees each line is offered to the sink exactly once, in
//! per-channel order. Naming, append-vs-truncate, and compression of the
//! completed log live here, at the collaborator boundary. Log write errors
//! are contained: they disable the log with a warning and never disturb
//! monitoring.

use crate::channel::ChannelId;
use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Log destination settings, resolved from config.
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// Explicit log file path. Wins over `dir`/`prefix` auto naming.
    pub file: Option<PathBuf>,
    /// Directory for auto-named logs; no logging when both are unset.
    pub dir: Option<PathBuf>,
    pub prefix: String,
    /// Append to an existing file instead of truncating.
    pub append: bool,
    /// zstd-compress the completed log on finish.
    pub compress: bool,
    /// Prefix each logged line with a timestamp and channel tag.
    pub timestamps: bool,
}

/// Errors raised while opening the log destination. Surfaced before launch.
#[derive(Debug)]
pub enum SinkError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Open { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Open { source, .. } => Some(source),
        }
    }
}

/// Build an auto-generated log path: `{dir}/{prefix}-{YYYYmmdd-HHMMSS}.log`.
pub fn auto_log_path(dir: &Path, prefix: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    dir.join(format!("{prefix}-{stamp}.log"))
}

struct LogFile {
    path: PathBuf,
    writer: std::io::BufWriter<std::fs::File>,
    compress: bool,
    broken: bool,
}

/// Fans each line out to console echo and the log file.
pub struct OutputSink {
    echo: bool,
    timestamps: bool,
    log: Option<LogFile>,
}

impl OutputSink {
    /// Open the sink. `echo` off means quiet mode (log only).
    pub fn new(settings: &LogSettings, echo: bool) -> Result<Self, SinkError> {
        let log = match resolve_path(settings) {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(settings.append)
                    .write(true)
                    .truncate(!settings.append)
                    .open(&path)
                    .map_err(|e| SinkError::Open {
                        path: path.clone(),
                        source: e,
                    })?;
                tracing::info!(path = %path.display(), append = settings.append, "logging to file");
                Some(LogFile {
                    path,
                    writer: std::io::BufWriter::new(file),
                    compress: settings.compress,
                    broken: false,
                })
            }
            None => None,
        };
        Ok(Self {
            echo,
            timestamps: settings.timestamps,
            log,
        })
    }

    /// Forward one line. stdout-channel lines echo to our stdout, all other
    /// channels echo to our stderr.
    pub fn write_line(&mut self, channel: ChannelId, line: &str) {
        if self.echo {
            if channel == ChannelId::STDOUT {
                println!("{line}");
            } else {
                eprintln!("{line}");
            }
        }
        if let Some(log) = self.log.as_mut() {
            if log.broken {
                return;
            }
            let result = if self.timestamps {
                let stamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
                writeln!(log.writer, "{stamp} [{channel}] {line}")
            } else {
                writeln!(log.writer, "{line}")
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, path = %log.path.display(), "log write failed, disabling log");
                log.broken = true;
            }
        }
    }

    /// Flush, optionally compress the completed log, and return its final
    /// path. Compression failure keeps the uncompressed file.
    pub fn finish(self) -> Option<PathBuf> {
        let mut log = self.log?;
        if let Err(e) = log.writer.flush() {
            tracing::warn!(error = %e, "failed to flush log file");
        }
        drop(log.writer);
        if log.compress && !log.broken {
            match compress_file(&log.path) {
                Ok(dest) => return Some(dest),
                Err(e) => {
                    tracing::warn!(error = %e, file = %log.path.display(), "failed to compress log file");
                }
            }
        }
        Some(log.path)
    }

    /// Path of the active log file, if any.
    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(|l| l.path.as_path())
    }
}

fn resolve_path(settings: &LogSettings) -> Option<PathBuf> {
    if let Some(file) = &settings.file {
        return Some(file.clone());
    }
    settings
        .dir
        .as_deref()
        .map(|dir| auto_log_path(dir, &settings.prefix))
}

/// Compress a completed log with zstd, writing `{path}.zst` and removing
/// the original.
fn compress_file(path: &Path) -> std::io::Result<PathBuf> {
    let mut dest = path.as_os_str().to_owned();
    dest.push(".zst");
    let dest = PathBuf::from(dest);
    let input = std::fs::read(path)?;
    let compressed = zstd::encode_all(input.as_slice(), 3)?;
    std::fs::write(&dest, compressed)?;
    std::fs::remove_file(path)?;
    Ok(dest)
}
