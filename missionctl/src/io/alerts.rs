//! Operator alert sinks used by the watchdog and the guard-block monitor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{error, warn};

use crate::io::config::AlertConfig;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, title: &str, body: &str) -> Result<()>;
}

/// Deliver an alert, logging instead of propagating any failure.
pub async fn notify_best_effort(sink: &dyn AlertSink, title: &str, body: &str) {
    if let Err(err) = sink.notify(title, body).await {
        let detail = format!("{err:#}");
        error!(title, error = %detail, "alert delivery failed");
    }
}

/// Writes alerts to the log.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, title: &str, body: &str) -> Result<()> {
        warn!(title, body, "operator alert");
        Ok(())
    }
}

/// POSTs `{"title": ..., "body": ...}` to a webhook.
pub struct WebhookAlertSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build alert client")?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, title: &str, body: &str) -> Result<()> {
        self.http
            .post(&self.url)
            .json(&json!({ "title": title, "body": body }))
            .send()
            .await
            .context("send alert")?
            .error_for_status()
            .context("alert rejected")?;
        Ok(())
    }
}

/// Sink selected by configuration: webhook when a URL is set, else the log.
pub fn sink_from_config(cfg: &AlertConfig) -> Result<Arc<dyn AlertSink>> {
    match cfg.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => Ok(Arc::new(WebhookAlertSink::new(url)?)),
        None => Ok(Arc::new(LogAlertSink)),
    }
}
