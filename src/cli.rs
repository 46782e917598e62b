use crate::orchestrator::{self, Command, ControllerOptions, FetchRunner};
use anyhow::{Context, Result};
use clap::Parser;
use request_runner::engine::http::HttpOperation;
use request_runner::model::{ExecutionRecord, RunnerConfig, SessionEvent};
use request_runner::RequestRunner;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "request-runner",
    version,
    about = "Run an HTTP request with loading delay, debounce/throttle, polling and cancellation"
)]
pub struct Cli {
    /// Endpoint to request
    pub url: String,

    /// Default params: `key=value` adds a query pair, anything else a path segment
    #[arg(long = "param", short = 'p')]
    pub params: Vec<String>,

    /// JSON runner config; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Delay before the busy indicator is shown
    #[arg(long)]
    pub loading_delay: Option<humantime::Duration>,

    /// Poll at this interval (0s disables polling)
    #[arg(long)]
    pub polling_interval: Option<humantime::Duration>,

    /// Consecutive polling failures before polling stops
    #[arg(long)]
    pub max_error_retries: Option<u32>,

    /// Collapse rapid invocations into the last one after this quiet period
    #[arg(long)]
    pub debounce: Option<humantime::Duration>,

    /// Admit at most one invocation per window
    #[arg(long)]
    pub throttle: Option<humantime::Duration>,

    /// Wait for a `run` command instead of running on launch (interactive mode)
    #[arg(long)]
    pub manual: bool,

    /// Per-request timeout
    #[arg(long, default_value = "10s")]
    pub timeout: humantime::Duration,

    /// Stop the session after this long
    #[arg(long)]
    pub duration: Option<humantime::Duration>,

    /// Read commands from stdin: run [params..], refresh, cancel, status, quit
    #[arg(long, short = 'i')]
    pub interactive: bool,

    /// Print the session report as JSON
    #[arg(long)]
    pub json: bool,

    /// Print a text summary (default)
    #[arg(long, conflicts_with = "json")]
    pub text: bool,

    /// Export the session report as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Build the runner config: file values first, then flag overrides.
pub fn build_config(args: &Cli) -> Result<RunnerConfig> {
    let mut cfg = match args.config.as_deref() {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };

    cfg.manual |= args.manual;
    if let Some(d) = args.loading_delay {
        cfg.loading_delay = d.into();
    }
    if let Some(d) = args.polling_interval {
        cfg.polling_interval = d.into();
    }
    if let Some(n) = args.max_error_retries {
        cfg.polling_max_error_retries = n;
    }
    if let Some(d) = args.debounce {
        cfg.debounce = d.into();
    }
    if let Some(d) = args.throttle {
        cfg.throttle = d.into();
    }
    Ok(cfg)
}

/// Build the runner around the HTTP operation, forwarding lifecycle hooks as events.
fn build_runner(
    op: HttpOperation,
    config: RunnerConfig,
    default_params: Vec<String>,
    event_tx: &mpsc::UnboundedSender<SessionEvent>,
) -> FetchRunner {
    let before_tx = event_tx.clone();
    let success_tx = event_tx.clone();
    let error_tx = event_tx.clone();
    let settle_tx = event_tx.clone();

    RequestRunner::builder(move |params: Vec<String>| {
        let op = op.clone();
        async move { op.fetch(params).await }
    })
    .config(config)
    .default_params(default_params)
    .before_run(move |params| {
        let _ = before_tx.send(SessionEvent::Started {
            params: params.to_vec(),
        });
    })
    .on_success(move |response, params| {
        let _ = success_tx.send(SessionEvent::Succeeded {
            response: response.clone(),
            params: params.to_vec(),
        });
    })
    .on_error(move |error, params| {
        let _ = error_tx.send(SessionEvent::Failed {
            error: error.clone(),
            params: params.to_vec(),
        });
    })
    .on_settle(move |params, _, _| {
        let _ = settle_tx.send(SessionEvent::Settled {
            params: params.to_vec(),
        });
    })
    .build()
}

/// Forward parsed stdin lines to the controller.
fn spawn_command_reader(
    cmd_tx: mpsc::UnboundedSender<Command>,
    out_tx: mpsc::UnboundedSender<OutputLine>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match Command::parse(&line) {
                Ok(Some(cmd)) => {
                    let quit = cmd == Command::Quit;
                    if cmd_tx.send(cmd).is_err() || quit {
                        break;
                    }
                }
                Ok(None) => {}
                Err(msg) => {
                    let _ = out_tx.send(OutputLine::Stderr(msg));
                }
            }
        }
    })
}

/// Render a progress line for text and interactive modes.
fn describe_event(ev: &SessionEvent) -> Option<String> {
    match ev {
        SessionEvent::Started { params } if params.is_empty() => Some("→ run".into()),
        SessionEvent::Started { params } => Some(format!("→ run {}", params.join(" "))),
        SessionEvent::Busy(true) => Some("… loading".into()),
        SessionEvent::Busy(false) | SessionEvent::Settled { .. } => None,
        SessionEvent::Succeeded { response, .. } => Some(format!(
            "✓ {} {} B in {:.1} ms",
            response.status, response.bytes, response.latency_ms
        )),
        SessionEvent::Failed { error, .. } => Some(format!("✗ {error}")),
        SessionEvent::PollingStopped => Some("Polling stopped".into()),
        SessionEvent::Info(msg) => Some(msg.clone()),
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let mut config = build_config(&args)?;
    let op = HttpOperation::new(&args.url, Duration::from(args.timeout))?;
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();

    let report_config = config.clone();
    // Outside interactive mode the controller issues the first run itself so it
    // can tell when the session is idle.
    let initial = if args.interactive {
        None
    } else {
        config.manual = true;
        Some(args.params.clone())
    };

    let runner = build_runner(op, config, args.params.clone(), &evt_tx);

    let reader = if args.interactive {
        let _ = out_tx.send(OutputLine::Stderr(
            "Commands: run [params..], refresh, cancel, status, quit".into(),
        ));
        Some(spawn_command_reader(cmd_tx, out_tx.clone()))
    } else {
        drop(cmd_tx);
        None
    };

    let opts = ControllerOptions {
        initial,
        stop_when_idle: !args.interactive,
        deadline: args
            .duration
            .map(|d| tokio::time::Instant::now() + Duration::from(d)),
    };
    // The event stream ends once the controller and every runner task have let go of it.
    let controller =
        tokio::spawn(async move { orchestrator::run_controller(runner, opts, evt_tx, cmd_rx).await });

    let text_mode = args.text || !args.json;
    let mut executions = Vec::new();
    while let Some(ev) = evt_rx.recv().await {
        match &ev {
            SessionEvent::Succeeded { response, params } => {
                executions.push(ExecutionRecord::success(response, params.clone()));
            }
            SessionEvent::Failed { error, params } => {
                executions.push(ExecutionRecord::failure(error, params.clone()));
            }
            _ => {}
        }
        if text_mode {
            if let Some(line) = describe_event(&ev) {
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
        }
    }

    controller.await.context("controller task failed")??;
    if let Some(reader) = reader {
        reader.abort();
    }

    let processed = orchestrator::process_session(
        &args.url,
        &report_config,
        &args.params,
        executions,
        args.export_json.as_deref(),
    );
    for msg in processed.export_messages {
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }

    if text_mode {
        let summary = crate::text_summary::build_text_summary(&processed.report);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    } else {
        let out = serde_json::to_string_pretty(&processed.report)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}
