//! Post-session processing.
//!
//! Builds the session report from collected execution records and handles exports.

use anyhow::{Context, Result};
use rand::RngCore;
use request_runner::metrics;
use request_runner::model::{ExecutionRecord, RunnerConfig, SessionReport};
use std::path::Path;

/// Report plus any messages produced while exporting it.
pub(crate) struct ProcessedSession {
    pub report: SessionReport,
    pub export_messages: Vec<String>,
}

/// Generate a random id for the session.
pub(crate) fn gen_session_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

pub(crate) fn build_report(
    session_id: String,
    url: &str,
    config: &RunnerConfig,
    default_params: &[String],
    executions: Vec<ExecutionRecord>,
) -> SessionReport {
    let latencies: Vec<f64> = executions.iter().filter_map(|e| e.latency_ms).collect();
    let successes = executions.iter().filter(|e| e.ok).count() as u64;
    let failures = executions.len() as u64 - successes;
    let last_error = executions.iter().rev().find_map(|e| e.error.clone());

    SessionReport {
        timestamp_utc: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        session_id,
        url: url.to_string(),
        config: config.clone(),
        default_params: default_params.to_vec(),
        latency: metrics::latency_summary(&latencies),
        executions,
        successes,
        failures,
        last_error,
    }
}

/// Build the report and run the requested export.
pub(crate) fn process_session(
    url: &str,
    config: &RunnerConfig,
    default_params: &[String],
    executions: Vec<ExecutionRecord>,
    export_json_path: Option<&Path>,
) -> ProcessedSession {
    let report = build_report(gen_session_id(), url, config, default_params, executions);

    let mut export_messages = Vec::new();
    if let Some(path) = export_json_path {
        match export_json(path, &report) {
            Ok(()) => export_messages.push(format!("Exported JSON: {}", path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    ProcessedSession {
        report,
        export_messages,
    }
}

pub(crate) fn export_json(path: &Path, report: &SessionReport) -> Result<()> {
    let out = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    std::fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}
