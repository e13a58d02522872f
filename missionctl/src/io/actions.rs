//! Action runner: named side effects run before and after a stage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::core::graph::ActionConfig;
use crate::core::render::{render, render_value, truncate_chars};
use crate::io::config::SearchConfig;
use crate::io::github::SystemOfRecord;

/// Template variables visible to actions.
pub type Vars = BTreeMap<String, String>;

/// Parameters after `{key}` substitution.
pub type Params = BTreeMap<String, Value>;

#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, params: &Params, vars: &Vars) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(sor: Arc<dyn SystemOfRecord>, search: SearchConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register("web_search", Arc::new(WebSearch::new(search)?));
        registry.register("repo_read", Arc::new(RepoRead(sor.clone())));
        registry.register("repo_commit", Arc::new(RepoCommit(sor.clone())));
        registry.register("ensure_branch", Arc::new(EnsureBranch(sor)));
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, action: Arc<dyn Action>) {
        self.actions.insert(name.to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.actions.keys().cloned().collect()
    }
}

/// Runs actions against a mutable map of template variables.
pub struct ActionRunner {
    registry: Arc<ActionRegistry>,
    vars: Vars,
}

impl ActionRunner {
    pub fn new(registry: Arc<ActionRegistry>, vars: Vars) -> Self {
        Self { registry, vars }
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn set_var(&mut self, key: &str, value: impl Into<String>) {
        self.vars.insert(key.to_string(), value.into());
    }

    pub fn render(&self, template: &str) -> String {
        render(template, &self.vars)
    }

    /// Run one action with `extra` overlaid on the variables for the call.
    ///
    /// Unknown actions and failing actions log a warning and return `None`.
    pub async fn run(&mut self, cfg: &ActionConfig, extra: &Vars) -> Option<Value> {
        let Some(action) = self.registry.get(&cfg.action) else {
            warn!(action = %cfg.action, "unknown action");
            return None;
        };
        let saved = self.vars.clone();
        self.vars
            .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        let params: Params = cfg
            .params
            .iter()
            .map(|(k, v)| (k.clone(), render_value(v, &self.vars)))
            .collect();
        let result = action.run(&params, &self.vars).await;
        self.vars = saved;
        match result {
            Ok(value) => {
                debug!(action = %cfg.action, "action completed");
                Some(value)
            }
            Err(err) => {
                let detail = format!("{err:#}");
                warn!(action = %cfg.action, error = %detail, "action failed");
                None
            }
        }
    }

    /// Run `configs` in order; results are keyed by action name.
    pub async fn run_all(
        &mut self,
        configs: &[ActionConfig],
        extra: &Vars,
    ) -> Vec<(String, Option<Value>)> {
        let mut results = Vec::with_capacity(configs.len());
        for cfg in configs {
            let result = self.run(cfg, extra).await;
            results.push((cfg.action.clone(), result));
        }
        results
    }
}

/// Text form of an action result; empty-ish results yield `None`.
pub fn result_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn param_or(params: &Params, key: &str, default: &str, vars: &Vars) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| render(default, vars))
}

struct WebSearch {
    http: reqwest::Client,
    config: SearchConfig,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
}

impl WebSearch {
    fn new(config: SearchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build search client")?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl Action for WebSearch {
    async fn run(&self, params: &Params, vars: &Vars) -> Result<Value> {
        let query = param_or(params, "query", "{title}", vars);
        let max_results = params
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(self.config.max_results));
        let Some(key) = self.config.key() else {
            return Ok(json!(
                "(web search not configured; using the task description as context)"
            ));
        };
        let data = self
            .http
            .post(&self.config.url)
            .json(&json!({
                "api_key": key,
                "query": query,
                "max_results": max_results,
                "include_answer": true,
            }))
            .send()
            .await
            .context("search request")?
            .error_for_status()
            .context("search request")?
            .json::<SearchResponse>()
            .await
            .context("decode search response")?;
        Ok(json!(format_search(&data)))
    }
}

fn format_search(data: &SearchResponse) -> String {
    let mut parts = Vec::new();
    if let Some(answer) = data.answer.as_deref().filter(|a| !a.is_empty()) {
        parts.push(format!("**Summary:** {answer}\n"));
    }
    for hit in &data.results {
        parts.push(format!(
            "- [{}]({})\n  {}\n",
            hit.title.as_deref().unwrap_or("Untitled"),
            hit.url,
            truncate_chars(&hit.content, 300)
        ));
    }
    if parts.is_empty() {
        "(no results found)".to_string()
    } else {
        parts.join("\n")
    }
}

/// Read a file from a reference repository.
struct RepoRead(Arc<dyn SystemOfRecord>);

#[async_trait]
impl Action for RepoRead {
    async fn run(&self, params: &Params, vars: &Vars) -> Result<Value> {
        let repo = param_or(params, "repo", "{repository}", vars);
        let path = param_or(params, "path", "", vars);
        let git_ref = param_or(params, "ref", "main", vars);
        let content = self.0.read_file(&repo, &path, &git_ref).await?;
        Ok(json!(
            content.unwrap_or_else(|| format!("(file not found: {path})"))
        ))
    }
}

/// Create or update a file; content comes from a named variable.
struct RepoCommit(Arc<dyn SystemOfRecord>);

#[async_trait]
impl Action for RepoCommit {
    async fn run(&self, params: &Params, vars: &Vars) -> Result<Value> {
        let repo = param_or(params, "repo", "{repository}", vars);
        let path = param_or(params, "path", "", vars);
        let branch = param_or(params, "branch", "main", vars);
        let message = param_or(params, "message", "content: {title}", vars);
        let source = param_or(params, "content_source", "llm_output", vars);
        let content = vars.get(&source).map(String::as_str).unwrap_or_default();
        let pushed = self
            .0
            .put_file(&repo, &path, &branch, content, &message)
            .await?;
        if pushed {
            info!(%repo, %path, %branch, "committed file");
        }
        Ok(json!(pushed))
    }
}

/// Create the task branch unless it already exists.
struct EnsureBranch(Arc<dyn SystemOfRecord>);

#[async_trait]
impl Action for EnsureBranch {
    async fn run(&self, params: &Params, vars: &Vars) -> Result<Value> {
        let repo = param_or(params, "repository", "{repository}", vars);
        let branch = param_or(params, "branch", "{branch_name}", vars);
        let base = param_or(params, "base", "{source_branch}", vars);
        if self.0.branch_exists(&repo, &branch).await? {
            return Ok(json!(true));
        }
        Ok(json!(self.0.create_branch(&repo, &branch, &base).await?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::test_support::FakeRecord;

    /// Records the params and variables it was called with.
    #[derive(Default)]
    struct Probe {
        calls: Mutex<Vec<(Params, Vars)>>,
    }

    #[async_trait]
    impl Action for Probe {
        async fn run(&self, params: &Params, vars: &Vars) -> Result<Value> {
            self.calls
                .lock()
                .expect("lock")
                .push((params.clone(), vars.clone()));
            Ok(json!(params.get("say").cloned().unwrap_or(Value::Null)))
        }
    }

    fn vars() -> Vars {
        Vars::from([
            ("title".to_string(), "Fix login".to_string()),
            ("repository".to_string(), "acme/app".to_string()),
            ("branch_name".to_string(), "dev/ab12cd34".to_string()),
            ("source_branch".to_string(), "main".to_string()),
        ])
    }

    fn runner_with_probe() -> (ActionRunner, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let mut registry = ActionRegistry::new();
        registry.register("probe", probe.clone());
        (ActionRunner::new(Arc::new(registry), vars()), probe)
    }

    #[tokio::test]
    async fn renders_params_and_restores_overlay() {
        let (mut runner, probe) = runner_with_probe();
        let cfg = ActionConfig::new("probe").with_param("say", "{title}: {llm_output}");
        let extra = Vars::from([("llm_output".to_string(), "done".to_string())]);

        let result = runner.run(&cfg, &extra).await;

        assert_eq!(result, Some(json!("Fix login: done")));
        let calls = probe.calls.lock().expect("lock");
        assert_eq!(calls[0].1.get("llm_output").map(String::as_str), Some("done"));
        assert!(!runner.vars().contains_key("llm_output"));
    }

    #[tokio::test]
    async fn unknown_action_returns_none() {
        let (mut runner, _) = runner_with_probe();
        assert_eq!(runner.run(&ActionConfig::new("teleport"), &Vars::new()).await, None);
    }

    #[tokio::test]
    async fn run_all_keeps_order() {
        let (mut runner, _) = runner_with_probe();
        let results = runner
            .run_all(
                &[
                    ActionConfig::new("probe").with_param("say", "one"),
                    ActionConfig::new("missing"),
                    ActionConfig::new("probe").with_param("say", "two"),
                ],
                &Vars::new(),
            )
            .await;
        let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["probe", "missing", "probe"]);
        assert_eq!(results[2].1, Some(json!("two")));
    }

    #[test]
    fn render_substitutes_vars() {
        let (runner, _) = runner_with_probe();
        assert_eq!(runner.render("{repository}#{title}"), "acme/app#Fix login");
    }

    #[test]
    fn result_text_skips_empty_results() {
        assert_eq!(result_text(&Value::Null), None);
        assert_eq!(result_text(&json!(false)), None);
        assert_eq!(result_text(&json!("  ")), None);
        assert_eq!(result_text(&json!("notes")).as_deref(), Some("notes"));
        assert_eq!(result_text(&json!(true)).as_deref(), Some("true"));
    }

    fn builtin_runner(sor: &Arc<FakeRecord>) -> ActionRunner {
        let registry =
            ActionRegistry::with_builtins(sor.clone(), SearchConfig::default()).expect("registry");
        ActionRunner::new(Arc::new(registry), vars())
    }

    #[tokio::test]
    async fn repo_commit_is_idempotent() {
        let sor = Arc::new(FakeRecord::new());
        let mut runner = builtin_runner(&sor);
        let cfg = ActionConfig::new("repo_commit")
            .with_param("path", "content/drafts/{title}.md")
            .with_param("branch", "{branch_name}");
        let extra = Vars::from([("llm_output".to_string(), "draft body".to_string())]);

        assert_eq!(runner.run(&cfg, &extra).await, Some(json!(true)));
        assert_eq!(runner.run(&cfg, &extra).await, Some(json!(true)));

        assert_eq!(
            sor.file("acme/app", "content/drafts/Fix login.md").as_deref(),
            Some("draft body")
        );
        assert_eq!(sor.file_writes(), 2);
    }

    #[tokio::test]
    async fn ensure_branch_skips_existing_branch() {
        let sor = Arc::new(FakeRecord::new());
        sor.add_branch("acme/app", "dev/ab12cd34");
        let mut runner = builtin_runner(&sor);
        let result = runner
            .run(&ActionConfig::new("ensure_branch"), &Vars::new())
            .await;
        assert_eq!(result, Some(json!(true)));
        assert!(sor.created_branches().is_empty());
    }

    #[tokio::test]
    async fn ensure_branch_creates_missing_branch_from_source() {
        let sor = Arc::new(FakeRecord::new());
        sor.add_branch("acme/app", "main");
        let mut runner = builtin_runner(&sor);
        let result = runner
            .run(&ActionConfig::new("ensure_branch"), &Vars::new())
            .await;
        assert_eq!(result, Some(json!(true)));
        assert_eq!(
            sor.created_branches(),
            vec![("acme/app".to_string(), "dev/ab12cd34".to_string())]
        );
    }

    #[tokio::test]
    async fn repo_read_reports_missing_file() {
        let sor = Arc::new(FakeRecord::new());
        sor.add_file("acme/app", "docs/STYLE.md", "be terse");
        let mut runner = builtin_runner(&sor);
        let read = ActionConfig::new("repo_read").with_param("path", "docs/STYLE.md");
        assert_eq!(runner.run(&read, &Vars::new()).await, Some(json!("be terse")));
        let missing = ActionConfig::new("repo_read").with_param("path", "nope.md");
        assert_eq!(
            runner.run(&missing, &Vars::new()).await,
            Some(json!("(file not found: nope.md)"))
        );
    }

    #[test]
    fn search_results_are_formatted() {
        let data = SearchResponse {
            answer: Some("Short answer".to_string()),
            results: vec![SearchHit {
                title: None,
                url: "https://example.com".to_string(),
                content: "body".to_string(),
            }],
        };
        let text = format_search(&data);
        assert!(text.starts_with("**Summary:** Short answer"));
        assert!(text.contains("- [Untitled](https://example.com)\n  body"));
    }
}
