//! HTTP GET operation used by the command-line front end.

use crate::model::{FetchError, FetchResponse};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Url;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct HttpOperation {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpOperation {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid url: {base_url}"))?;
        let http = reqwest::Client::builder()
            .user_agent(format!("request-runner/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, base_url })
    }

    /// `key=value` params become query pairs; bare params become path segments.
    pub fn request_url(&self, params: &[String]) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();

        let segments: Vec<&str> = params
            .iter()
            .filter(|p| !p.contains('='))
            .map(String::as_str)
            .collect();
        if !segments.is_empty() {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| FetchError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty().extend(segments);
        }

        let pairs: Vec<(&str, &str)> = params.iter().filter_map(|p| p.split_once('=')).collect();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        Ok(url)
    }

    pub async fn fetch(&self, params: Vec<String>) -> Result<FetchResponse, FetchError> {
        let url = self.request_url(&params)?;
        let start = Instant::now();

        let resp = self.http.get(url).send().await.map_err(classify)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let final_url = resp.url().to_string();

        let mut bytes = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk.map_err(classify)?;
            bytes += chunk.len() as u64;
        }

        Ok(FetchResponse {
            url: final_url,
            status: status.as_u16(),
            bytes,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}
