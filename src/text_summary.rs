//! Text summary builder for CLI output.
//!
//! Formats a session report into human-readable lines for text mode.

use request_runner::model::{LatencySummary, SessionReport};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn ms(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.1}")).unwrap_or_else(|| "-".into())
}

fn latency_line(l: &LatencySummary) -> String {
    format!(
        "Latency (ms): min {} avg {} med {} p25 {} p75 {} max {} jitter {}",
        ms(l.min_ms),
        ms(l.mean_ms),
        ms(l.median_ms),
        ms(l.p25_ms),
        ms(l.p75_ms),
        ms(l.max_ms),
        ms(l.jitter_ms),
    )
}

/// Build a text summary from a session report.
pub(crate) fn build_text_summary(report: &SessionReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("URL: {}", report.url));
    if !report.default_params.is_empty() {
        lines.push(format!("Params: {}", report.default_params.join(" ")));
    }

    let cfg = &report.config;
    if cfg.polling_enabled() {
        lines.push(format!(
            "Polling: every {} (max {} consecutive errors)",
            humantime::format_duration(cfg.polling_interval),
            cfg.polling_max_error_retries
        ));
    }

    lines.push(format!(
        "Executions: {} ({} ok, {} failed)",
        report.executions.len(),
        report.successes,
        report.failures
    ));

    if report.latency.samples > 0 {
        lines.push(latency_line(&report.latency));
    }
    let bytes: u64 = report.executions.iter().filter_map(|e| e.bytes).sum();
    if bytes > 0 {
        lines.push(format!("Received: {bytes} B"));
    }
    if let Some(err) = report.last_error.as_deref() {
        lines.push(format!("Last error: {err}"));
    }

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use request_runner::model::{ExecutionRecord, FetchError, RunnerConfig};
    use std::time::Duration;

    fn report(executions: Vec<ExecutionRecord>, config: RunnerConfig) -> SessionReport {
        SessionReport {
            timestamp_utc: String::new(),
            session_id: "s".into(),
            url: "http://test/".into(),
            config,
            default_params: vec![],
            successes: executions.iter().filter(|e| e.ok).count() as u64,
            failures: executions.iter().filter(|e| !e.ok).count() as u64,
            last_error: executions.iter().rev().find_map(|e| e.error.clone()),
            executions,
            latency: LatencySummary::default(),
        }
    }

    #[test]
    fn failed_polling_session_mentions_last_error() {
        let cfg = RunnerConfig {
            polling_interval: Duration::from_secs(1),
            polling_max_error_retries: 2,
            ..Default::default()
        };
        let s = build_text_summary(&report(
            vec![
                ExecutionRecord::failure(&FetchError::Status(502), vec![]),
                ExecutionRecord::failure(&FetchError::Status(503), vec![]),
            ],
            cfg,
        ));
        assert!(s.lines.contains(&"Polling: every 1s (max 2 consecutive errors)".to_string()));
        assert!(s.lines.contains(&"Executions: 2 (0 ok, 2 failed)".to_string()));
        assert_eq!(
            s.lines.last().map(String::as_str),
            Some("Last error: server responded with status 503")
        );
        assert!(!s.lines.iter().any(|l| l.starts_with("Latency")));
    }
}
