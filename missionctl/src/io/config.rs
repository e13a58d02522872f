//! Control-plane configuration stored in `missionctl.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Control-plane configuration (TOML).
///
/// Missing fields default to the production values; a missing file yields
/// [`ControlConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlConfig {
    /// Declarative pipeline document.
    pub workflows_path: PathBuf,
    /// Directory holding `<name>.md` prompt templates.
    pub prompts_dir: PathBuf,
    /// JSON snapshot of tasks, assignments, heartbeats and alerts.
    pub state_path: Option<PathBuf>,

    pub scheduler: SchedulerConfig,
    pub watchdog: WatchdogConfig,
    pub monitor: MonitorConfig,
    pub github: GithubConfig,
    pub search: SearchConfig,
    pub alerts: AlertConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Hard wall-clock limit for one wake-up.
    pub heartbeat_timeout_secs: u64,
    /// Cycle for agents that do not set `heartbeat_interval`.
    pub default_cycle_minutes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 300,
            default_cycle_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_minutes: u32,
    pub grace_minutes: u32,
    /// Per-worker alert suppression window.
    pub suppression_minutes: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 10,
            grace_minutes: 5,
            suppression_minutes: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub window_hours: u32,
    pub threshold: usize,
    pub capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            threshold: 3,
            capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GithubConfig {
    pub api_base: String,
    /// Name of the environment variable holding the API token.
    pub token_env: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

impl GithubConfig {
    /// Token from the environment; empty values count as absent.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

/// Web search backend used by the `web_search` action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    pub url: String,
    /// Name of the environment variable holding the API key.
    pub key_env: String,
    pub max_results: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: "https://api.tavily.com/search".to_string(),
            key_env: "TAVILY_API_KEY".to_string(),
            max_results: 5,
        }
    }
}

impl SearchConfig {
    pub fn key(&self) -> Option<String> {
        std::env::var(&self.key_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlertConfig {
    /// POST `{title, body}` here; unset logs alerts instead.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Command that receives the prompt on stdin and answers on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 240,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            workflows_path: PathBuf::from("workflows.toml"),
            prompts_dir: PathBuf::from("prompts"),
            state_path: Some(PathBuf::from(".missionctl/state.json")),
            scheduler: SchedulerConfig::default(),
            watchdog: WatchdogConfig::default(),
            monitor: MonitorConfig::default(),
            github: GithubConfig::default(),
            search: SearchConfig::default(),
            alerts: AlertConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.heartbeat_timeout_secs == 0 {
            return Err(anyhow!("scheduler.heartbeat_timeout_secs must be > 0"));
        }
        let cycle = self.scheduler.default_cycle_minutes;
        if cycle == 0 || 60 % cycle != 0 {
            return Err(anyhow!(
                "scheduler.default_cycle_minutes must divide the hour (got {cycle})"
            ));
        }
        if self.watchdog.interval_minutes == 0 {
            return Err(anyhow!("watchdog.interval_minutes must be > 0"));
        }
        if self.monitor.threshold == 0 {
            return Err(anyhow!("monitor.threshold must be > 0"));
        }
        if self.monitor.capacity < self.monitor.threshold {
            return Err(anyhow!("monitor.capacity must be >= monitor.threshold"));
        }
        if self.github.token_env.trim().is_empty() {
            return Err(anyhow!("github.token_env must be non-empty"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self.worker.timeout_secs == 0 {
            return Err(anyhow!("worker.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.heartbeat_timeout_secs)
    }

    /// Resolve relative paths against the directory holding the config file.
    pub fn resolve_paths(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.workflows_path);
        rebase(&mut self.prompts_dir);
        if let Some(state) = self.state_path.as_mut() {
            rebase(state);
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ControlConfig::default()`.
pub fn load_config(path: &Path) -> Result<ControlConfig> {
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        ControlConfig::default()
    };
    if let Some(base) = path.parent() {
        cfg.resolve_paths(base);
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg.scheduler, SchedulerConfig::default());
        assert_eq!(cfg.workflows_path, temp.path().join("workflows.toml"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("missionctl.toml");
        fs::write(
            &path,
            "[watchdog]\ngrace_minutes = 10\n\n[alerts]\nwebhook_url = \"https://hooks.example/x\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.watchdog.grace_minutes, 10);
        assert_eq!(cfg.watchdog.suppression_minutes, 120);
        assert_eq!(cfg.monitor, MonitorConfig::default());
        assert_eq!(
            cfg.alerts.webhook_url.as_deref(),
            Some("https://hooks.example/x")
        );
    }

    #[test]
    fn rejects_cycle_that_does_not_divide_hour() {
        let mut cfg = ControlConfig::default();
        cfg.scheduler.default_cycle_minutes = 25;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_worker_command() {
        let mut cfg = ControlConfig::default();
        cfg.worker.command = Vec::new();
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("worker.command"));
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("state.json");
        write_atomic(&path, "one").expect("write");
        write_atomic(&path, "two").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        assert!(!temp.path().join("nested").join("state.json.tmp").exists());
    }
}
