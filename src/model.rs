use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Execution policy for a [`RequestRunner`](crate::engine::RequestRunner).
///
/// A zero duration disables the corresponding feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Suppress the automatic first invocation.
    pub manual: bool,
    /// Delay before the busy flag becomes visible.
    #[serde(with = "humantime_serde")]
    pub loading_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub polling_interval: Duration,
    /// Consecutive failures that terminate a polling chain.
    pub polling_max_error_retries: u32,
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
    #[serde(with = "humantime_serde")]
    pub throttle: Duration,
}

/// How calls to `invoke` are admitted to execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationGate {
    Immediate,
    /// Trailing call wins after a quiet window.
    Debounce(Duration),
    /// Leading call wins; the rest of the window is dropped.
    Throttle(Duration),
}

impl RunnerConfig {
    /// Load a config from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn polling_enabled(&self) -> bool {
        !self.polling_interval.is_zero()
    }

    /// Debounce takes priority when both windows are configured.
    pub fn invocation_gate(&self) -> InvocationGate {
        if !self.debounce.is_zero() {
            InvocationGate::Debounce(self.debounce)
        } else if !self.throttle.is_zero() {
            InvocationGate::Throttle(self.throttle)
        } else {
            InvocationGate::Immediate
        }
    }
}

/// Response of the HTTP operation driven by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub bytes: u64,
    pub latency_ms: f64,
}

/// Failure of the HTTP operation. Cloneable so the runner can keep it in context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum FetchError {
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("server responded with status {0}")]
    Status(u16),
}

/// Events emitted by the runner hooks and the controller, consumed by the CLI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started {
        params: Vec<String>,
    },
    Busy(bool),
    Succeeded {
        response: FetchResponse,
        params: Vec<String>,
    },
    Failed {
        error: FetchError,
        params: Vec<String>,
    },
    Settled {
        params: Vec<String>,
    },
    PollingStopped,
    Info(String),
}

/// One settled execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub params: Vec<String>,
    pub ok: bool,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn success(response: &FetchResponse, params: Vec<String>) -> Self {
        Self {
            params,
            ok: true,
            status: Some(response.status),
            bytes: Some(response.bytes),
            latency_ms: Some(response.latency_ms),
            error: None,
        }
    }

    pub fn failure(error: &FetchError, params: Vec<String>) -> Self {
        let status = match error {
            FetchError::Status(code) => Some(*code),
            _ => None,
        };
        Self {
            params,
            ok: false,
            status,
            bytes: None,
            latency_ms: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub min_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub p25_ms: Option<f64>,
    pub p75_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    #[serde(default)]
    pub timestamp_utc: String,
    pub session_id: String,
    pub url: String,
    pub config: RunnerConfig,
    pub default_params: Vec<String>,
    pub executions: Vec<ExecutionRecord>,
    pub successes: u64,
    pub failures: u64,
    pub latency: LatencySummary,
    #[serde(default)]
    pub last_error: Option<String>,
}
