//! Profile loading and validation.
//!
//! A run is configured from an optional TOML profile (`linewatch.toml` by
//! default) merged with CLI overrides. All validation — pattern compilation
//! included — happens here, before any process is launched.

use crate::channel::ChannelId;
use crate::delay::DelayPolicy;
use crate::pattern::{BackendKind, PatternError, PatternRule, RuleBook, RuleConfig, RuleSet, TieBreak};
use crate::sink::LogSettings;
use crate::timeout::TimeoutPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level profile loaded from linewatch.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Profile {
    pub pattern: PatternSection,
    pub timeout: TimeoutSection,
    pub delay: DelaySection,
    pub terminate: TerminateSection,
    pub log: LogSection,
    pub channels: ChannelsSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PatternSection {
    /// Primary (success) pattern.
    pub pattern: Option<String>,
    pub case_insensitive: bool,
    pub invert: bool,
    pub exclude: Vec<String>,
    pub max_matches: Option<u32>,
    pub backend: BackendKind,
    pub tie_break: TieBreak,
    /// Independent error rule; presence enables dual-pattern mode.
    pub error: Option<RuleConfig>,
    /// Optional stderr-specific override of the primary rule.
    pub stderr: Option<RuleConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub overall_secs: Option<f64>,
    pub idle_secs: Option<f64>,
    pub first_output_secs: Option<f64>,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DelaySection {
    pub extra_lines: Option<u64>,
    pub extra_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TerminateSection {
    pub grace_secs: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub file: Option<PathBuf>,
    pub dir: Option<PathBuf>,
    pub prefix: String,
    pub append: bool,
    pub compress: bool,
    pub timestamps: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ChannelsSection {
    /// Auxiliary descriptor numbers to monitor beyond stdout/stderr.
    pub aux_fds: Vec<i32>,
    /// Batch lines per read wakeup instead of forwarding per line.
    pub buffered: bool,
}

/// Configuration errors. All fail before launch; none are recoverable.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Pattern(PatternError),
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read profile {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse profile {}: {}", path.display(), source)
            }
            ConfigError::Pattern(e) => write!(f, "{e}"),
            ConfigError::Invalid { field, message } => {
                write!(f, "invalid value for {field}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Pattern(e) => Some(e),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl From<PatternError> for ConfigError {
    fn from(e: PatternError) -> Self {
        ConfigError::Pattern(e)
    }
}

fn positive_secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::Invalid {
            field,
            message: format!("must be a positive number of seconds, got {value}"),
        });
    }
    Ok(Duration::from_secs_f64(value))
}

impl Profile {
    /// Load a profile from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// The primary rule as a standalone config.
    fn success_rule(&self) -> RuleConfig {
        RuleConfig {
            pattern: self.pattern.pattern.clone(),
            case_insensitive: self.pattern.case_insensitive,
            invert: self.pattern.invert,
            exclude: self.pattern.exclude.clone(),
            max_matches: self.pattern.max_matches,
        }
    }

    /// Compile one rule set per monitored channel. Fails fast on any
    /// invalid expression.
    pub fn compile_rules(&self) -> Result<RuleBook, ConfigError> {
        let backend = self.pattern.backend;
        let tie_break = self.pattern.tie_break;
        let success = self.success_rule();

        let build = |rule_cfg: &RuleConfig| -> Result<RuleSet, ConfigError> {
            let primary = PatternRule::compile(rule_cfg, backend)?;
            let error = self
                .pattern
                .error
                .as_ref()
                .map(|cfg| PatternRule::compile(cfg, backend))
                .transpose()?;
            Ok(RuleSet::new(primary, error, tie_break))
        };

        let mut book = RuleBook::new(Vec::new());
        book.push(ChannelId::STDOUT, build(&success)?);
        let stderr_cfg = self.pattern.stderr.clone().unwrap_or_else(|| success.clone());
        book.push(ChannelId::STDERR, build(&stderr_cfg)?);
        for &fd in &self.channels.aux_fds {
            book.push(ChannelId(fd), build(&success)?);
        }
        Ok(book)
    }

    /// Timeout clocks, validated.
    pub fn timeout_policy(&self) -> Result<TimeoutPolicy, ConfigError> {
        Ok(TimeoutPolicy {
            overall: self
                .timeout
                .overall_secs
                .map(|v| positive_secs("timeout.overall_secs", v))
                .transpose()?,
            idle: self
                .timeout
                .idle_secs
                .map(|v| positive_secs("timeout.idle_secs", v))
                .transpose()?,
            first_output: self
                .timeout
                .first_output_secs
                .map(|v| positive_secs("timeout.first_output_secs", v))
                .transpose()?,
        })
    }

    /// Supervisor poll interval, validated.
    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        if self.timeout.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout.poll_interval_ms",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Duration::from_millis(self.timeout.poll_interval_ms))
    }

    /// Post-match capture bounds, validated.
    pub fn delay_policy(&self) -> Result<DelayPolicy, ConfigError> {
        Ok(DelayPolicy {
            extra_lines: self.delay.extra_lines,
            extra_time: self
                .delay
                .extra_secs
                .map(|v| positive_secs("delay.extra_secs", v))
                .transpose()?,
        })
    }

    /// Grace period for the kill sequence, validated.
    pub fn grace(&self) -> Result<Duration, ConfigError> {
        positive_secs("terminate.grace_secs", self.terminate.grace_secs)
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            file: self.log.file.clone(),
            dir: self.log.dir.clone(),
            prefix: self.log.prefix.clone(),
            append: self.log.append,
            compress: self.log.compress,
            timestamps: self.log.timestamps,
        }
    }
}

// --- Default implementations ---

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            overall_secs: None,
            idle_secs: None,
            first_output_secs: None,
            poll_interval_ms: 100,
        }
    }
}

impl Default for TerminateSection {
    fn default() -> Self {
        Self { grace_secs: 5.0 }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            file: None,
            dir: None,
            prefix: "linewatch".to_string(),
            append: false,
            compress: false,
            timestamps: false,
        }
    }
}
