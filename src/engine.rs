//! The coordinator: wires the launcher, channel readers, timeout supervisor,
//! delay-exit window, and termination controller into one supervised run.
//!
//! One reader task per channel, one supervisor task, and this loop selecting
//! over {child exit, reader events, timeout events, delay deadline}. Exactly
//! one `ExitDecision` is produced per run; once a match freezes the decision,
//! later lines only extend the captured context, never the verdict.

use crate::channel::{spawn_fd_reader, spawn_reader, ChannelId, ReadMode, ReaderEvent};
use crate::delay::{DelayPolicy, DelayWindow};
use crate::launch::{launch, LaunchError, LaunchSpec, LaunchedProcess};
use crate::pattern::{RuleBook, RuleHit};
use crate::sink::OutputSink;
use crate::state::{ActivityTracker, StopFlag};
use crate::terminate::Terminator;
use crate::timeout::{supervise, TimeoutKind, TimeoutPolicy};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A qualifying pattern match.
#[derive(Debug, Clone)]
pub struct MatchEvent {
    pub channel: ChannelId,
    pub line: String,
    pub timestamp: DateTime<Local>,
    /// True when the error rule of a dual-pattern set produced the hit.
    pub is_error: bool,
}

/// The single verdict of a run.
#[derive(Debug)]
pub enum ExitDecision {
    /// A pattern match occurred (exit 0, mirroring text-search convention).
    PatternMatched(MatchEvent),
    /// The process completed naturally with no match (exit 1).
    NoMatch,
    /// A timeout fired, tagged with which clock (exit 2).
    TimedOut(TimeoutKind),
    /// The run failed for reasons unrelated to pattern or timeout (exit 3).
    ProcessError(String),
}

impl ExitDecision {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitDecision::PatternMatched(_) => 0,
            ExitDecision::NoMatch => 1,
            ExitDecision::TimedOut(_) => 2,
            ExitDecision::ProcessError(_) => 3,
        }
    }
}

impl std::fmt::Display for ExitDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitDecision::PatternMatched(ev) if ev.is_error => {
                write!(
                    f,
                    "error pattern matched on {} at {}",
                    ev.channel,
                    ev.timestamp.format("%H:%M:%S")
                )
            }
            ExitDecision::PatternMatched(ev) => {
                write!(
                    f,
                    "pattern matched on {} at {}",
                    ev.channel,
                    ev.timestamp.format("%H:%M:%S")
                )
            }
            ExitDecision::NoMatch => write!(f, "completed with no match"),
            ExitDecision::TimedOut(kind) => write!(f, "{kind} timeout"),
            ExitDecision::ProcessError(msg) => write!(f, "process error: {msg}"),
        }
    }
}

/// Everything the coordinator needs for one run.
pub struct EngineConfig {
    pub rules: RuleBook,
    pub timeouts: TimeoutPolicy,
    pub poll_interval: Duration,
    pub delay: DelayPolicy,
    pub grace: Duration,
    pub read_mode: ReadMode,
    pub sink: OutputSink,
}

/// Result of a completed run.
#[derive(Debug)]
pub struct MonitorOutcome {
    pub decision: ExitDecision,
    /// Native status of the child (None in pipe mode, or if reaping failed).
    pub child_status: Option<ExitStatus>,
    pub lines_seen: u64,
    pub duration: Duration,
    pub log_path: Option<PathBuf>,
    /// The kill sequence itself failed; overrides the exit code to 3.
    pub termination_failed: bool,
}

impl MonitorOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.termination_failed {
            3
        } else {
            self.decision.exit_code()
        }
    }
}

enum Action {
    Continue,
    Finish,
}

/// Route one line through the sink and the decision logic.
#[allow(clippy::too_many_arguments)]
fn process_line(
    channel: ChannelId,
    text: String,
    sink: &mut OutputSink,
    rules: &mut RuleBook,
    delay_policy: &DelayPolicy,
    decision: &mut Option<ExitDecision>,
    delay: &mut Option<DelayWindow>,
    lines_seen: &mut u64,
) -> Action {
    *lines_seen += 1;
    sink.write_line(channel, &text);
    match decision {
        None => {
            if let Some(hit) = rules.observe(channel, &text) {
                let is_error = hit == RuleHit::Error;
                tracing::info!(channel = %channel, is_error, line = %text, "pattern matched");
                *decision = Some(ExitDecision::PatternMatched(MatchEvent {
                    channel,
                    line: text,
                    timestamp: Local::now(),
                    is_error,
                }));
                let window = delay_policy.open(Instant::now());
                if window.closed() {
                    return Action::Finish;
                }
                tracing::debug!("delay-exit window opened");
                *delay = Some(window);
            }
        }
        Some(ExitDecision::PatternMatched(_)) => {
            // Decision is frozen; lines only consume the capture budget
            if let Some(window) = delay.as_mut() {
                if window.note_line() {
                    tracing::debug!("delay-exit line budget reached");
                    return Action::Finish;
                }
            }
        }
        _ => {}
    }
    Action::Continue
}

/// Run a full supervised session over a spawned child (owned-process mode).
pub async fn run(mut cfg: EngineConfig, spec: &LaunchSpec) -> Result<MonitorOutcome, LaunchError> {
    let started = Instant::now();
    let tracker = Arc::new(ActivityTracker::new());
    let stop = StopFlag::new();

    let LaunchedProcess {
        mut child,
        stdout,
        stderr,
        aux,
        pid,
    } = launch(spec)?;

    let (tx, mut rx) = mpsc::channel::<ReaderEvent>(256);
    let mut open_channels = 2 + aux.len();
    spawn_reader(
        stdout,
        ChannelId::STDOUT,
        cfg.read_mode,
        tracker.clone(),
        stop.clone(),
        tx.clone(),
    );
    spawn_reader(
        stderr,
        ChannelId::STDERR,
        cfg.read_mode,
        tracker.clone(),
        stop.clone(),
        tx.clone(),
    );
    for (id, file) in aux {
        spawn_fd_reader(
            file,
            id,
            cfg.read_mode,
            tracker.clone(),
            stop.clone(),
            tx.clone(),
        );
    }
    drop(tx);

    let (timeout_tx, mut timeout_rx) = mpsc::channel::<TimeoutKind>(1);
    tokio::spawn(supervise(
        cfg.timeouts,
        tracker.clone(),
        stop.clone(),
        cfg.poll_interval,
        timeout_tx,
    ));

    let mut decision: Option<ExitDecision> = None;
    let mut delay: Option<DelayWindow> = None;
    let mut child_status: Option<ExitStatus> = None;
    let mut lines_seen = 0u64;
    let mut drained = false;

    'monitor: loop {
        if drained && child_status.is_some() {
            break;
        }
        let delay_deadline = delay.and_then(|w| w.deadline());
        let delay_sleep = delay_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        tokio::select! {
            biased;

            status = child.wait(), if child_status.is_none() => {
                match status {
                    Ok(st) => {
                        tracing::info!(pid, status = %st, "process exited");
                        child_status = Some(st);
                    }
                    Err(e) => {
                        decision.get_or_insert(ExitDecision::ProcessError(format!(
                            "failed to wait for child: {e}"
                        )));
                        break;
                    }
                }
                // Natural exit ends an open delay window early
                if decision.is_some() {
                    break;
                }
            }

            maybe_ev = rx.recv(), if !drained => {
                match maybe_ev {
                    None => drained = true,
                    Some(ReaderEvent::Eof { channel }) => {
                        tracing::debug!(channel = %channel, "channel EOF");
                        open_channels -= 1;
                        if open_channels == 0 {
                            drained = true;
                        }
                    }
                    Some(ReaderEvent::Line { channel, text }) => {
                        if let Action::Finish = process_line(
                            channel, text, &mut cfg.sink, &mut cfg.rules, &cfg.delay,
                            &mut decision, &mut delay, &mut lines_seen,
                        ) {
                            break;
                        }
                    }
                    Some(ReaderEvent::Batch { channel, lines }) => {
                        for text in lines {
                            if let Action::Finish = process_line(
                                channel, text, &mut cfg.sink, &mut cfg.rules, &cfg.delay,
                                &mut decision, &mut delay, &mut lines_seen,
                            ) {
                                break 'monitor;
                            }
                        }
                    }
                }
            }

            Some(kind) = timeout_rx.recv() => {
                match decision {
                    None => decision = Some(ExitDecision::TimedOut(kind)),
                    // Decision stands; the clock only ends the capture window
                    Some(_) => tracing::debug!(kind = %kind, "timeout during delay-exit window"),
                }
                break;
            }

            _ = tokio::time::sleep_until(delay_sleep.into()), if delay_deadline.is_some() => {
                tracing::debug!("delay-exit time budget reached");
                break;
            }
        }
    }

    stop.set();
    let decision = decision.unwrap_or(ExitDecision::NoMatch);

    let mut termination_failed = false;
    if child_status.is_none() {
        match Terminator::new(cfg.grace).shut_down(&mut child, pid).await {
            Ok(status) => child_status = Some(status),
            Err(e) => {
                tracing::error!(pid, error = %e, "termination sequence failed");
                termination_failed = true;
            }
        }
    }

    // Drain already-buffered lines for logging completeness only; the
    // decision is final.
    loop {
        match tokio::time::timeout(Duration::from_millis(250), rx.recv()).await {
            Ok(Some(ReaderEvent::Line { channel, text })) => {
                lines_seen += 1;
                cfg.sink.write_line(channel, &text);
            }
            Ok(Some(ReaderEvent::Batch { channel, lines })) => {
                for text in lines {
                    lines_seen += 1;
                    cfg.sink.write_line(channel, &text);
                }
            }
            Ok(Some(ReaderEvent::Eof { .. })) => {}
            Ok(None) | Err(_) => break,
        }
    }

    let duration = started.elapsed();
    let log_path = cfg.sink.finish();
    tracing::info!(
        decision = %decision,
        lines_seen,
        duration_secs = duration.as_secs_f64(),
        "run complete"
    );

    Ok(MonitorOutcome {
        decision,
        child_status,
        lines_seen,
        duration,
        log_path,
        termination_failed,
    })
}

/// Run in pipe mode: monitor our own stdin as the sole channel.
///
/// Cooperative termination only: on decision we stop reading and exit;
/// the upstream process takes SIGPIPE on its next write. No forced-kill
/// escalation is possible in this topology.
pub async fn run_pipe(mut cfg: EngineConfig) -> MonitorOutcome {
    let started = Instant::now();
    let tracker = Arc::new(ActivityTracker::new());
    let stop = StopFlag::new();

    let (tx, mut rx) = mpsc::channel::<ReaderEvent>(256);
    spawn_reader(
        tokio::io::stdin(),
        ChannelId::STDOUT,
        cfg.read_mode,
        tracker.clone(),
        stop.clone(),
        tx,
    );

    let (timeout_tx, mut timeout_rx) = mpsc::channel::<TimeoutKind>(1);
    tokio::spawn(supervise(
        cfg.timeouts,
        tracker.clone(),
        stop.clone(),
        cfg.poll_interval,
        timeout_tx,
    ));

    let mut decision: Option<ExitDecision> = None;
    let mut delay: Option<DelayWindow> = None;
    let mut lines_seen = 0u64;
    let mut drained = false;

    'monitor: while !drained {
        let delay_deadline = delay.and_then(|w| w.deadline());
        let delay_sleep = delay_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        tokio::select! {
            maybe_ev = rx.recv() => {
                match maybe_ev {
                    None | Some(ReaderEvent::Eof { .. }) => drained = true,
                    Some(ReaderEvent::Line { channel, text }) => {
                        if let Action::Finish = process_line(
                            channel, text, &mut cfg.sink, &mut cfg.rules, &cfg.delay,
                            &mut decision, &mut delay, &mut lines_seen,
                        ) {
                            break;
                        }
                    }
                    Some(ReaderEvent::Batch { channel, lines }) => {
                        for text in lines {
                            if let Action::Finish = process_line(
                                channel, text, &mut cfg.sink, &mut cfg.rules, &cfg.delay,
                                &mut decision, &mut delay, &mut lines_seen,
                            ) {
                                break 'monitor;
                            }
                        }
                    }
                }
            }

            Some(kind) = timeout_rx.recv() => {
                if decision.is_none() {
                    decision = Some(ExitDecision::TimedOut(kind));
                }
                break;
            }

            _ = tokio::time::sleep_until(delay_sleep.into()), if delay_deadline.is_some() => {
                break;
            }
        }
    }

    stop.set();
    tracing::debug!("cooperative termination: ceasing reads, upstream will see EPIPE");
    let decision = decision.unwrap_or(ExitDecision::NoMatch);
    let duration = started.elapsed();
    let log_path = cfg.sink.finish();
    tracing::info!(decision = %decision, lines_seen, "pipe run complete");

    MonitorOutcome {
        decision,
        child_status: None,
        lines_seen,
        duration,
        log_path,
        termination_failed: false,
    }
}
