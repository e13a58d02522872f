//! Learning sink: receives transition and error events and supplies learned
//! context for prompts. Every call is best-effort.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::core::types::TaskId;

/// One attempted stage transition, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub worker: String,
    pub mission_type: String,
    pub task_id: TaskId,
    pub from_state: String,
    pub to_state: String,
    pub duration_secs: f64,
    pub guard: Option<String>,
    pub guard_result: Option<bool>,
}

#[async_trait]
pub trait LearningSink: Send + Sync {
    async fn capture_transition(&self, event: &TransitionEvent) -> Result<()>;
    async fn capture_error(
        &self,
        worker: &str,
        mission_type: &str,
        task_id: &TaskId,
        error: &str,
    ) -> Result<()>;
    /// Formatted patterns relevant to `query`; empty when none apply.
    async fn learned_context(&self, mission_type: &str, query: &str) -> Result<String>;
}

/// Sink that learns nothing.
pub struct NoopLearning;

#[async_trait]
impl LearningSink for NoopLearning {
    async fn capture_transition(&self, _event: &TransitionEvent) -> Result<()> {
        Ok(())
    }

    async fn capture_error(
        &self,
        _worker: &str,
        _mission_type: &str,
        _task_id: &TaskId,
        _error: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn learned_context(&self, _mission_type: &str, _query: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// Infallible front for a [`LearningSink`]: failures are logged and dropped.
#[derive(Clone)]
pub struct Learning(Arc<dyn LearningSink>);

impl Learning {
    pub fn new(sink: Arc<dyn LearningSink>) -> Self {
        Self(sink)
    }

    pub fn noop() -> Self {
        Self(Arc::new(NoopLearning))
    }

    pub async fn transition(&self, event: TransitionEvent) {
        if let Err(err) = self.0.capture_transition(&event).await {
            debug!(error = %err, "transition capture dropped");
        }
    }

    pub async fn error(&self, worker: &str, mission_type: &str, task_id: &TaskId, error: &str) {
        if let Err(err) = self.0.capture_error(worker, mission_type, task_id, error).await {
            debug!(error = %err, "error capture dropped");
        }
    }

    pub async fn context(&self, mission_type: &str, query: &str) -> String {
        self.0
            .learned_context(mission_type, query)
            .await
            .unwrap_or_else(|err| {
                debug!(error = %err, "learned context unavailable");
                String::new()
            })
    }
}
