//! Worker abstraction for stage execution.
//!
//! The [`Worker`] trait decouples the execution loop from the agent backend.
//! [`CommandWorker`] spawns a configured command with the prompt on stdin;
//! tests use scripted workers that return predetermined replies.
//!
//! A command worker requests system-of-record tools by printing lines of the
//! form `::tool {"tool": ..., "owner": ..., "repo": ..., "args": {...}}`.
//! Each request runs through the worker's [`ScopedToolbox`] after the command
//! exits and its outcome is appended to the reply.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::io::config::WorkerConfig;
use crate::scope::{ScopedToolbox, ToolCall, ToolOutcome};

/// Environment variable carrying the worker identity into the command.
pub const IDENTITY_ENV: &str = "MISSIONCTL_WORKER";
const TOOL_PREFIX: &str = "::tool ";
const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Text produced by one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReply {
    pub text: String,
    pub success: bool,
}

impl WorkerReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: true,
        }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: false,
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    /// Run `prompt` as `identity`. Errors are converted to a failed reply by
    /// the caller.
    async fn run(
        &self,
        prompt: &str,
        identity: &str,
        tools: &ScopedToolbox,
    ) -> Result<WorkerReply>;
}

/// Worker that spawns an external command.
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandWorker {
    pub fn from_config(cfg: &WorkerConfig) -> Result<Self> {
        let (program, args) = cfg
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker.command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        })
    }
}

#[derive(Deserialize)]
struct ToolRequest {
    tool: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    repo: String,
    #[serde(default)]
    args: Value,
}

#[async_trait]
impl Worker for CommandWorker {
    #[instrument(skip_all, fields(worker = identity, timeout_secs = self.timeout.as_secs()))]
    async fn run(
        &self,
        prompt: &str,
        identity: &str,
        tools: &ScopedToolbox,
    ) -> Result<WorkerReply> {
        info!(program = %self.program, "starting worker command");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(IDENTITY_ENV, identity)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn worker command {}", self.program))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let feed = async move {
            let written = stdin.write_all(prompt.as_bytes()).await;
            drop(stdin);
            written
        };
        // Stdin is fed while the output pipes drain; dropping the future on
        // timeout kills the child.
        let exchange = async move { tokio::join!(feed, child.wait_with_output()) };
        let (fed, output) = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(pair) => pair,
            Err(_) => bail!("worker timed out after {}s", self.timeout.as_secs()),
        };
        let output = output.context("wait for worker command")?;
        if let Err(err) = fed {
            debug!(error = %err, "worker closed stdin before reading the whole prompt");
        }

        let (stdout, truncated) = limit_output(&output.stdout, OUTPUT_LIMIT_BYTES);
        if truncated > 0 {
            warn!(truncated, "worker output truncated");
        }
        let mut text = String::new();
        for line in stdout.lines() {
            match line.strip_prefix(TOOL_PREFIX) {
                Some(raw) => {
                    let outcome = run_tool_request(tools, raw).await;
                    text.push_str(&outcome);
                    text.push('\n');
                }
                None => {
                    text.push_str(line);
                    text.push('\n');
                }
            }
        }
        let success = output.status.success();
        if !success {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                text.push_str(stderr.trim_end());
                text.push('\n');
            }
        }
        debug!(exit_code = ?output.status.code(), success, "worker command finished");
        Ok(WorkerReply {
            text: text.trim_end().to_string(),
            success,
        })
    }
}

async fn run_tool_request(tools: &ScopedToolbox, raw: &str) -> String {
    let request: ToolRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(err) => return format!("tool request rejected: {err}"),
    };
    let call = ToolCall::new(&request.tool, &request.owner, &request.repo, request.args);
    match tools.call(&call).await {
        Ok(ToolOutcome::Done(value)) => format!("{}: {value}", call.tool),
        Ok(ToolOutcome::Refused(message)) => message,
        Err(err) => format!("{}: error: {err:#}", call.tool),
    }
}

fn limit_output(bytes: &[u8], limit: usize) -> (String, usize) {
    if bytes.len() <= limit {
        return (String::from_utf8_lossy(bytes).into_owned(), 0);
    }
    (
        String::from_utf8_lossy(&bytes[..limit]).into_owned(),
        bytes.len() - limit,
    )
}
