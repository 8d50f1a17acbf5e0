use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use stackup_core::ComponentSpec;
use std::time::Duration;

use crate::health::{ProbeSignal, ReadinessProbe};

const USER_AGENT: &str = concat!("stackup/", env!("CARGO_PKG_VERSION"));

pub fn build_http_client(request_timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(request_timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build HTTP client")
}

/// Readiness over the component's HTTP endpoint: any 2xx answer is ready.
pub struct HttpReadinessProbe {
    client: Client,
}

impl HttpReadinessProbe {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_http_client(request_timeout)?,
        })
    }
}

impl ReadinessProbe for HttpReadinessProbe {
    fn poll(&self, component: &ComponentSpec) -> ProbeSignal {
        match self.client.get(&component.health_url).send() {
            Ok(response) if response.status().is_success() => {
                ProbeSignal::ready(format!("HTTP {}", response.status()))
            }
            Ok(response) => ProbeSignal::not_ready(format!(
                "HTTP {} from {}",
                response.status(),
                component.health_url
            )),
            Err(err) => ProbeSignal::not_ready(format!("{}: {err}", component.health_url)),
        }
    }
}

/// Fetches a build-info document and extracts the version text, either the
/// whole body or the string found at a JSON pointer. `None` when nothing accepts
/// connections at `url`.
pub fn fetch_reported_version(
    client: &Client,
    url: &str,
    pointer: Option<&str>,
) -> Result<Option<String>> {
    let response = match client.get(url).send() {
        Ok(response) => response,
        Err(err) if err.is_connect() => {
            tracing::debug!(url, error = %err, "build-info endpoint refused the connection");
            return Ok(None);
        }
        Err(err) => return Err(err).with_context(|| format!("failed to query {url}")),
    };
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("{url} answered HTTP {status}"));
    }
    let body = response
        .text()
        .with_context(|| format!("failed to read response body from {url}"))?;

    let Some(pointer) = pointer else {
        return Ok(Some(body));
    };
    let document: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("response from {url} is not JSON"))?;
    match document.pointer(pointer) {
        Some(serde_json::Value::String(version)) => Ok(Some(version.clone())),
        Some(other) => Ok(Some(other.to_string())),
        None => Err(anyhow!("{url} response has no value at {pointer}")),
    }
}
