mod channel;
mod config;
mod delay;
mod engine;
mod launch;
mod pattern;
mod sink;
mod state;
mod terminate;
mod timeout;

use channel::ReadMode;
use clap::Parser;
use config::{ConfigError, Profile};
use engine::EngineConfig;
use launch::LaunchSpec;
use pattern::{BackendKind, RuleConfig};
use sink::OutputSink;
use std::path::{Path, PathBuf};
use terminate::TerminationMode;
use tracing_subscriber::EnvFilter;

/// Supervise a command's output streams: match patterns against each line,
/// enforce overall/idle/first-output timeouts, capture trailing context
/// after a match, and terminate the process group cleanly.
///
/// Exit codes: 0 pattern matched, 1 no match, 2 timeout, 3 launch or
/// runtime error.
#[derive(Parser, Debug)]
#[command(name = "linewatch", version, about)]
pub struct Cli {
    /// Command to run and monitor (everything after the flags)
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Profile file path (default: linewatch.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pattern to watch for (overrides profile)
    #[arg(short = 'e', long)]
    pattern: Option<String>,

    /// Error pattern; enables dual success/error mode
    #[arg(long)]
    error_pattern: Option<String>,

    /// Case-insensitive matching
    #[arg(short, long)]
    ignore_case: bool,

    /// Report a match when the pattern does NOT match a line
    #[arg(long)]
    invert: bool,

    /// Lines matching an exclude expression are never a match (repeatable)
    #[arg(short = 'x', long = "exclude")]
    exclude: Vec<String>,

    /// Stop signaling a rule after N matches
    #[arg(short, long)]
    max_count: Option<u32>,

    /// Matching backend: regex or literal
    #[arg(long)]
    backend: Option<String>,

    /// Overall timeout in seconds
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Idle timeout in seconds (silence across all channels)
    #[arg(long)]
    idle_timeout: Option<f64>,

    /// First-output timeout in seconds
    #[arg(long)]
    first_output_timeout: Option<f64>,

    /// Keep forwarding N extra lines after a match
    #[arg(long)]
    delay_lines: Option<u64>,

    /// Keep forwarding for N extra seconds after a match
    #[arg(long)]
    delay_secs: Option<f64>,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[arg(long)]
    grace: Option<f64>,

    /// Extra descriptor numbers to monitor (repeatable)
    #[arg(long = "fd")]
    aux_fds: Vec<i32>,

    /// KEY=VALUE environment entries for the child (repeatable)
    #[arg(long = "env")]
    env: Vec<String>,

    /// Batch lines per read wakeup (fewer wakeups, less immediacy)
    #[arg(long)]
    buffered: bool,

    /// Log file path
    #[arg(short = 'o', long)]
    log_file: Option<PathBuf>,

    /// Directory for auto-named log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Append to the log file instead of truncating
    #[arg(long)]
    append: bool,

    /// zstd-compress the completed log file
    #[arg(long)]
    compress: bool,

    /// Monitor stdin instead of spawning a command (cooperative termination)
    #[arg(long)]
    pipe: bool,

    /// Suppress console echo; log file only
    #[arg(short, long)]
    quiet: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (supervisor checks, reader events)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "linewatch failed");
            3
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let mut profile = load_profile(&cli)?;
    apply_overrides(&cli, &mut profile)?;

    // Everything validates before launch: patterns, clocks, grace period.
    let rules = profile.compile_rules()?;
    let timeouts = profile.timeout_policy()?;
    let poll_interval = profile.poll_interval()?;
    let delay = profile.delay_policy()?;
    let grace = profile.grace()?;
    let read_mode = if profile.channels.buffered {
        ReadMode::Buffered
    } else {
        ReadMode::Unbuffered
    };

    if cli.dry_run {
        print_resolved(&profile, &cli);
        return Ok(0);
    }

    let mode = termination_mode(&cli);
    if mode == TerminationMode::Owned && cli.command.is_empty() {
        return Err(Box::new(ConfigError::Invalid {
            field: "command",
            message: "no command given (or use --pipe to monitor stdin)".to_string(),
        }));
    }

    let sink = OutputSink::new(&profile.log_settings(), !cli.quiet)?;
    let cfg = EngineConfig {
        rules,
        timeouts,
        poll_interval,
        delay,
        grace,
        read_mode,
        sink,
    };

    let outcome = match mode {
        TerminationMode::Cooperative => engine::run_pipe(cfg).await,
        TerminationMode::Owned => {
            let spec = LaunchSpec {
                command: cli.command[0].clone(),
                args: cli.command[1..].to_vec(),
                env: parse_env(&cli.env)?,
                aux_fds: profile.channels.aux_fds.clone(),
            };
            engine::run(cfg, &spec).await?
        }
    };

    tracing::info!(
        decision = %outcome.decision,
        exit_code = outcome.exit_code(),
        lines = outcome.lines_seen,
        "finished"
    );
    Ok(outcome.exit_code())
}

/// Owned mode signals the child's process group; pipe mode can only stop
/// reading and rely on upstream SIGPIPE.
fn termination_mode(cli: &Cli) -> TerminationMode {
    if cli.pipe {
        TerminationMode::Cooperative
    } else {
        TerminationMode::Owned
    }
}

fn load_profile(cli: &Cli) -> Result<Profile, ConfigError> {
    match &cli.config {
        Some(path) => Profile::load(path),
        None => {
            let default = Path::new("linewatch.toml");
            if default.exists() {
                Profile::load(default)
            } else {
                Ok(Profile::default())
            }
        }
    }
}

fn parse_backend(s: &str) -> Result<BackendKind, ConfigError> {
    match s {
        "regex" => Ok(BackendKind::Regex),
        "literal" => Ok(BackendKind::Literal),
        other => Err(ConfigError::Invalid {
            field: "backend",
            message: format!("expected \"regex\" or \"literal\", got {other:?}"),
        }),
    }
}

fn parse_env(entries: &[String]) -> Result<Vec<(String, String)>, ConfigError> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| ConfigError::Invalid {
                    field: "env",
                    message: format!("expected KEY=VALUE, got {entry:?}"),
                })
        })
        .collect()
}

/// Fold CLI flags into the loaded profile. CLI wins over the file.
fn apply_overrides(cli: &Cli, profile: &mut Profile) -> Result<(), ConfigError> {
    if let Some(p) = &cli.pattern {
        profile.pattern.pattern = Some(p.clone());
    }
    if let Some(p) = &cli.error_pattern {
        profile.pattern.error = Some(RuleConfig {
            pattern: Some(p.clone()),
            case_insensitive: cli.ignore_case,
            ..Default::default()
        });
    }
    if cli.ignore_case {
        profile.pattern.case_insensitive = true;
    }
    if cli.invert {
        profile.pattern.invert = true;
    }
    if !cli.exclude.is_empty() {
        profile.pattern.exclude.extend(cli.exclude.iter().cloned());
    }
    if let Some(n) = cli.max_count {
        profile.pattern.max_matches = Some(n);
    }
    if let Some(b) = &cli.backend {
        profile.pattern.backend = parse_backend(b)?;
    }
    if let Some(v) = cli.timeout {
        profile.timeout.overall_secs = Some(v);
    }
    if let Some(v) = cli.idle_timeout {
        profile.timeout.idle_secs = Some(v);
    }
    if let Some(v) = cli.first_output_timeout {
        profile.timeout.first_output_secs = Some(v);
    }
    if let Some(n) = cli.delay_lines {
        profile.delay.extra_lines = Some(n);
    }
    if let Some(v) = cli.delay_secs {
        profile.delay.extra_secs = Some(v);
    }
    if let Some(v) = cli.grace {
        profile.terminate.grace_secs = v;
    }
    if !cli.aux_fds.is_empty() {
        profile.channels.aux_fds.extend(cli.aux_fds.iter().copied());
    }
    if cli.buffered {
        profile.channels.buffered = true;
    }
    if let Some(p) = &cli.log_file {
        profile.log.file = Some(p.clone());
    }
    if let Some(p) = &cli.log_dir {
        profile.log.dir = Some(p.clone());
    }
    if cli.append {
        profile.log.append = true;
    }
    if cli.compress {
        profile.log.compress = true;
    }
    Ok(())
}

fn print_resolved(profile: &Profile, cli: &Cli) {
    println!("linewatch v{}", env!("CARGO_PKG_VERSION"));
    println!("pattern:        {:?}", profile.pattern.pattern);
    println!(
        "error pattern:  {:?}",
        profile.pattern.error.as_ref().and_then(|r| r.pattern.clone())
    );
    println!("backend:        {:?}", profile.pattern.backend);
    println!("invert:         {}", profile.pattern.invert);
    println!("exclude:        {:?}", profile.pattern.exclude);
    println!("overall:        {:?}", profile.timeout.overall_secs);
    println!("idle:           {:?}", profile.timeout.idle_secs);
    println!("first-output:   {:?}", profile.timeout.first_output_secs);
    println!("delay lines:    {:?}", profile.delay.extra_lines);
    println!("delay secs:     {:?}", profile.delay.extra_secs);
    println!("grace:          {}s", profile.terminate.grace_secs);
    println!("aux fds:        {:?}", profile.channels.aux_fds);
    println!("mode:           {}", if cli.pipe { "pipe" } else { "owned" });
    println!("Dry run: configuration is valid, not running.");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("linewatch").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_overrides_pattern_settings() {
        let cli = cli(&["-e", "ERROR", "-i", "--invert", "-x", "noise", "--", "true"]);
        let mut profile = Profile::default();
        apply_overrides(&cli, &mut profile).unwrap();
        assert_eq!(profile.pattern.pattern.as_deref(), Some("ERROR"));
        assert!(profile.pattern.case_insensitive);
        assert!(profile.pattern.invert);
        assert_eq!(profile.pattern.exclude, vec!["noise"]);
    }

    #[test]
    fn test_cli_overrides_timeouts() {
        let cli = cli(&[
            "-e",
            "x",
            "-t",
            "60",
            "--idle-timeout",
            "5",
            "--first-output-timeout",
            "2",
            "true",
        ]);
        let mut profile = Profile::default();
        apply_overrides(&cli, &mut profile).unwrap();
        assert_eq!(profile.timeout.overall_secs, Some(60.0));
        assert_eq!(profile.timeout.idle_secs, Some(5.0));
        assert_eq!(profile.timeout.first_output_secs, Some(2.0));
    }

    #[test]
    fn test_cli_error_pattern_enables_dual_mode() {
        let cli = cli(&["-e", "PASS", "--error-pattern", "FAIL", "true"]);
        let mut profile = Profile::default();
        apply_overrides(&cli, &mut profile).unwrap();
        assert!(profile.pattern.error.is_some());
        profile.compile_rules().unwrap();
    }

    #[test]
    fn test_cli_bad_backend_rejected() {
        let cli = cli(&["-e", "x", "--backend", "pcre2", "true"]);
        let mut profile = Profile::default();
        let err = apply_overrides(&cli, &mut profile).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "backend",
                ..
            }
        ));
    }

    #[test]
    fn test_parse_env_entries() {
        let env = parse_env(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(
            env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
        assert!(parse_env(&["NOVALUE".to_string()]).is_err());
    }

    #[test]
    fn test_pipe_flag_selects_cooperative_termination() {
        assert_eq!(
            termination_mode(&cli(&["-e", "x", "--pipe"])),
            TerminationMode::Cooperative
        );
        assert_eq!(
            termination_mode(&cli(&["-e", "x", "true"])),
            TerminationMode::Owned
        );
    }

    #[test]
    fn test_trailing_command_captured() {
        let cli = cli(&["-e", "x", "--", "sh", "-c", "echo hi"]);
        assert_eq!(cli.command, vec!["sh", "-c", "echo hi"]);
    }
}
