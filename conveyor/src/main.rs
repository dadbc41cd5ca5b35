//! Operator CLI for the conveyor pipeline.
//!
//! Inspects checkpoints, worktrees, run reports and configuration under
//! `.conveyor/`. Pipelines themselves are driven through the library by a
//! tracker-specific frontend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use conveyor::exit_codes;
use conveyor::io::checkpoint::CheckpointStore;
use conveyor::io::config::{CONFIG_PATH, OrchestratorConfig, load_config};
use conveyor::io::registry::ProcessRegistry;
use conveyor::io::report::summarize_reports;
use conveyor::io::workspace::WorkspaceManager;
use conveyor::logging;

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Autonomous work-item pipeline orchestrator")]
struct Cli {
    /// Repository root containing `.conveyor/`.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    /// Config file, relative to the repository root.
    #[arg(long, global = true, default_value = CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the checkpoint of a work item.
    Status { item_id: u64 },
    /// List git worktrees under the configured worktree directory.
    Worktrees,
    /// Remove every pipeline worktree (the trunk checkout is kept).
    Clean,
    /// Aggregate run reports: successes, failures by phase, cost.
    Report,
    /// Load and validate the configuration, then print the step list.
    CheckConfig,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = resolve(&cli.repo, &cli.config);
    let cfg = load_config(&config_path)?;
    match cli.command {
        Command::Status { item_id } => cmd_status(&cli.repo, &cfg, item_id),
        Command::Worktrees => cmd_worktrees(&cli.repo, &cfg),
        Command::Clean => cmd_clean(&cli.repo, &cfg),
        Command::Report => cmd_report(&cli.repo, &cfg),
        Command::CheckConfig => cmd_check_config(&cfg),
    }
}

fn cmd_status(repo: &Path, cfg: &OrchestratorConfig, item_id: u64) -> Result<i32> {
    let store = CheckpointStore::new(cfg.resolve(repo, &cfg.state_dir));
    let Some(state) = store.load(item_id) else {
        println!("no checkpoint for item #{item_id}");
        return Ok(exit_codes::INVALID);
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&state).context("serialize checkpoint")?
    );
    Ok(exit_codes::OK)
}

fn cmd_worktrees(repo: &Path, cfg: &OrchestratorConfig) -> Result<i32> {
    let manager = workspace_manager(repo, cfg);
    for entry in manager.list()? {
        let branch = entry.branch.as_deref().unwrap_or("(detached)");
        println!("{}\t{branch}", entry.path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_clean(repo: &Path, cfg: &OrchestratorConfig) -> Result<i32> {
    let removed = workspace_manager(repo, cfg).clean_stale()?;
    println!("removed {removed} worktree(s)");
    Ok(exit_codes::OK)
}

fn cmd_report(repo: &Path, cfg: &OrchestratorConfig) -> Result<i32> {
    let summary = summarize_reports(&cfg.resolve(repo, &cfg.reports_dir))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serialize report summary")?
    );
    Ok(exit_codes::OK)
}

fn cmd_check_config(cfg: &OrchestratorConfig) -> Result<i32> {
    println!("config ok: trunk {}, {} step(s)", cfg.trunk, cfg.steps.len());
    for (index, step) in cfg.steps.iter().enumerate() {
        println!("  {index}: {} ({})", step.role, step.agent);
    }
    Ok(exit_codes::OK)
}

fn workspace_manager(repo: &Path, cfg: &OrchestratorConfig) -> WorkspaceManager {
    WorkspaceManager::new(
        repo,
        cfg.resolve(repo, &cfg.worktree_dir),
        &cfg.branch_prefix,
        &cfg.trunk,
        Arc::new(ProcessRegistry::new()),
    )
}

fn resolve(repo: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status() {
        let cli = Cli::parse_from(["conveyor", "status", "42"]);
        assert!(matches!(cli.command, Command::Status { item_id: 42 }));
        assert_eq!(cli.repo, PathBuf::from("."));
    }

    #[test]
    fn parse_global_repo_after_subcommand() {
        let cli = Cli::parse_from(["conveyor", "clean", "--repo", "/srv/repo"]);
        assert!(matches!(cli.command, Command::Clean));
        assert_eq!(cli.repo, PathBuf::from("/srv/repo"));
    }

    #[test]
    fn parse_check_config() {
        let cli = Cli::parse_from(["conveyor", "check-config"]);
        assert!(matches!(cli.command, Command::CheckConfig));
        assert_eq!(cli.config, PathBuf::from(CONFIG_PATH));
    }

    #[test]
    fn missing_checkpoint_is_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let code = cmd_status(temp.path(), &OrchestratorConfig::default(), 7).expect("status");
        assert_eq!(code, exit_codes::INVALID);
    }
}
