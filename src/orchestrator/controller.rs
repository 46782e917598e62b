//! Runner lifecycle controller.
//!
//! Owns the runner, turns commands into invocations, awaits their outcomes and
//! emits events for presentation layers.

use anyhow::Result;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use request_runner::model::{FetchError, FetchResponse, SessionEvent};
use request_runner::{RequestRunner, RunError};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, Instant};

pub(crate) type FetchRunner = RequestRunner<String, FetchResponse, FetchError>;

/// How long to wait for in-flight executions after the controller stops.
const DRAIN_GRACE: Duration = Duration::from_secs(3);

/// Commands accepted by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Run(Vec<String>),
    Refresh,
    Cancel,
    Status,
    Quit,
}

impl Command {
    /// Parse one line of interactive input. Blank lines yield `Ok(None)`.
    pub(crate) fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let cmd = match verb {
            "run" | "r" => Command::Run(words.map(str::to_owned).collect()),
            "refresh" | "f" => Command::Refresh,
            "cancel" | "c" => Command::Cancel,
            "status" | "s" => Command::Status,
            "quit" | "q" | "exit" => Command::Quit,
            other => {
                return Err(format!(
                    "Unknown command '{other}' (expected run, refresh, cancel, status, quit)"
                ))
            }
        };
        Ok(Some(cmd))
    }
}

pub(crate) struct ControllerOptions {
    /// Params for an invocation issued as soon as the controller starts.
    pub initial: Option<Vec<String>>,
    /// Stop once nothing is in flight and no polling chain is active.
    pub stop_when_idle: bool,
    pub deadline: Option<Instant>,
}

/// Drive `runner` from `cmd_rx` until quit, Ctrl-C, the deadline, or idleness.
pub(crate) async fn run_controller(
    runner: FetchRunner,
    opts: ControllerOptions,
    event_tx: UnboundedSender<SessionEvent>,
    mut cmd_rx: UnboundedReceiver<Command>,
) -> Result<()> {
    let mut in_flight = FuturesUnordered::new();
    let mut busy_rx = runner.subscribe_busy();
    let mut polling_rx = runner.subscribe_polling();
    let mut commands_open = true;

    if let Some(params) = opts.initial {
        in_flight.push(runner.invoke(params));
    }

    let deadline = opts.deadline;
    let deadline = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => futures::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if opts.stop_when_idle && in_flight.is_empty() && !runner.is_polling() {
            break;
        }

        tokio::select! {
            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(Command::Run(params)) => in_flight.push(runner.invoke(params)),
                    Some(Command::Refresh) => in_flight.push(runner.refresh()),
                    Some(Command::Cancel) => {
                        runner.cancel();
                        let _ = event_tx.send(SessionEvent::Info("Cancelled".into()));
                    }
                    Some(Command::Status) => {
                        let _ = event_tx.send(SessionEvent::Info(status_line(&runner)));
                    }
                    Some(Command::Quit) => break,
                    None => {
                        commands_open = false;
                        if !opts.stop_when_idle {
                            break;
                        }
                    }
                }
            }
            Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                if let Some(msg) = describe_outcome(&outcome) {
                    let _ = event_tx.send(SessionEvent::Info(msg));
                }
            }
            Ok(()) = busy_rx.changed() => {
                let busy = *busy_rx.borrow_and_update();
                let _ = event_tx.send(SessionEvent::Busy(busy));
            }
            Ok(()) = polling_rx.changed() => {
                if !*polling_rx.borrow_and_update() {
                    let _ = event_tx.send(SessionEvent::PollingStopped);
                }
            }
            _ = &mut deadline => {
                let _ = event_tx.send(SessionEvent::Info("Duration elapsed".into()));
                break;
            }
            _ = &mut ctrl_c => {
                let _ = event_tx.send(SessionEvent::Info("Interrupted".into()));
                break;
            }
        }
    }

    runner.cancel();

    // Executions already in flight still settle; give them a bounded window so
    // their results land in the session report.
    if !in_flight.is_empty() {
        let _ = event_tx.send(SessionEvent::Info("Waiting for in-flight requests…".into()));
        let drain = async { while in_flight.next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            let _ = event_tx.send(SessionEvent::Info(
                "Gave up waiting for in-flight requests".into(),
            ));
        }
    }

    Ok(())
}

fn status_line(runner: &FetchRunner) -> String {
    let result = match runner.result() {
        Some(r) => format!("{} ({} B, {:.1} ms)", r.status, r.bytes, r.latency_ms),
        None => "-".into(),
    };
    let failure = runner
        .failure()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "-".into());
    format!(
        "busy={} polling={} retries={} params=[{}] result={} failure={}",
        runner.is_busy(),
        runner.is_polling(),
        runner.polling_retry_count(),
        runner.params().join(" "),
        result,
        failure,
    )
}

/// Operation outcomes are already reported by the hooks; only gate and
/// cancellation outcomes need a message here.
fn describe_outcome(outcome: &Result<FetchResponse, RunError<FetchError>>) -> Option<String> {
    match outcome {
        Ok(_) | Err(RunError::Operation(_)) => None,
        Err(RunError::Aborted) => Some("Skipped: runner was cancelled".into()),
        Err(RunError::Discarded) => Some("Superseded by a later call".into()),
        Err(RunError::Throttled) => Some("Dropped by throttle window".into()),
    }
}
