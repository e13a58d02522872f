//! Heartbeat-driven control plane for agent mission pipelines.
//!
//! Reads `missionctl.toml` for process settings and the workflow document it
//! points at for missions and agents. `run` keeps the scheduler and watchdog
//! alive; the other commands are one-shot operator tools.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use missionctl::control::{ControlPlane, SubmitRequest, UnknownName, validate_workflows};
use missionctl::exit_codes;
use missionctl::heartbeat::WakeUp;
use missionctl::io::config::{ControlConfig, load_config};
use missionctl::logging;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "missionctl",
    version,
    about = "Heartbeat-driven control plane for agent mission pipelines"
)]
struct Cli {
    /// Control-plane config file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "missionctl.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the workflow document and print every finding.
    Validate,
    /// Run the heartbeat scheduler and the watchdog until interrupted.
    Run,
    /// Wake one agent immediately and print what it did.
    Wake { agent: String },
    /// Create a task.
    Submit {
        mission: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Initial status; defaults to ASSIGNED when an agent takes the task.
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
        /// Task config entry, repeatable. Values that parse as JSON are kept as JSON.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// List tasks, assignments, last heartbeats and next scheduled runs.
    Status,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            let code = if err.downcast_ref::<UnknownName>().is_some() {
                exit_codes::UNKNOWN
            } else {
                exit_codes::INVALID
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init();
    let cfg = load_config(&cli.config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Command::Validate => cmd_validate(&cfg),
            Command::Run => cmd_run(&ControlPlane::build(cfg)?).await,
            Command::Wake { agent } => cmd_wake(&ControlPlane::build(cfg)?, &agent).await,
            Command::Submit {
                mission,
                title,
                description,
                status,
                assignee,
                set,
            } => {
                let request = SubmitRequest {
                    mission,
                    title,
                    description,
                    status,
                    assignee,
                    config: set,
                };
                let task = ControlPlane::build(cfg)?.submit(request).await?;
                println!("{}", task.id);
                Ok(exit_codes::OK)
            }
            Command::Status => {
                let plane = ControlPlane::build(cfg)?;
                print!("{}", plane.status_report(Utc::now()).await?);
                Ok(exit_codes::OK)
            }
        }
    })
}

fn cmd_validate(cfg: &ControlConfig) -> Result<i32> {
    let findings = validate_workflows(cfg)?;
    for finding in &findings {
        println!("{finding}");
    }
    let errors = findings.iter().filter(|f| f.is_error()).count();
    if errors > 0 {
        println!("{errors} error(s) in {}", cfg.workflows_path.display());
        return Ok(exit_codes::FINDINGS);
    }
    println!("{} ok", cfg.workflows_path.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(plane: &ControlPlane) -> Result<i32> {
    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            on_interrupt.cancel();
        }
    });
    plane.run(shutdown).await?;
    Ok(exit_codes::OK)
}

async fn cmd_wake(plane: &ControlPlane, agent: &str) -> Result<i32> {
    let beat = plane
        .heartbeat_for(agent)
        .ok_or_else(|| UnknownName::Agent(agent.to_string()))?;
    let report = beat.wake().await?;
    println!("{}", report.summary());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_wake() {
        let cli = Cli::parse_from(["missionctl", "wake", "dev"]);
        assert!(matches!(cli.command, Command::Wake { agent } if agent == "dev"));
        assert_eq!(cli.config, PathBuf::from("missionctl.toml"));
    }

    #[test]
    fn parse_submit_with_config_entries() {
        let cli = Cli::parse_from([
            "missionctl",
            "--config",
            "ops/missionctl.toml",
            "submit",
            "build",
            "--title",
            "Fix login",
            "--set",
            "repository=acme/app",
            "--set",
            "max_files=20",
        ]);
        assert_eq!(cli.config, PathBuf::from("ops/missionctl.toml"));
        let Command::Submit {
            mission,
            title,
            status,
            set,
            ..
        } = cli.command
        else {
            panic!("expected submit");
        };
        assert_eq!(mission, "build");
        assert_eq!(title, "Fix login");
        assert_eq!(status, None);
        assert_eq!(set, vec!["repository=acme/app", "max_files=20"]);
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["missionctl", "status", "--config", "x.toml"]);
        assert!(matches!(cli.command, Command::Status));
        assert_eq!(cli.config, PathBuf::from("x.toml"));
    }
}
