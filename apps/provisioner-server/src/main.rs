#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod config;
mod logging;
mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mimalloc::MiMalloc;
use provisioning::infra::{GraphDirectory, SpoolQueue};
use provisioning::{
    Collaborators, LifecycleAdmin, ProvisioningModule, ProvisioningTask, TaskQueue, UserId,
    Username,
};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Provisioner - per-user environment lifecycle worker
#[derive(Parser)]
#[command(name = "provisioner-server")]
#[command(about = "Provisioner - per-user environment lifecycle worker")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Replace directory, host, proxy and queue with in-memory adapters
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the queue consumer
    Run,
    /// Validate configuration and exit
    Check,
    /// Put a task on the spool queue
    Enqueue {
        #[arg(value_enum)]
        task_type: TaskKind,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        username: String,
    },
    /// Apply an administrative transition to a user
    Admin {
        #[arg(value_enum)]
        action: AdminAction,
        #[arg(long)]
        user_id: String,
    },
    /// List dead-lettered tasks
    DeadLetters {
        /// Emit one JSON object per line
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TaskKind {
    Provision,
    Deprovision,
}

#[derive(Clone, Copy, ValueEnum)]
enum AdminAction {
    Approve,
    Reject,
    Revoke,
    Delete,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config
        && !Path::new(path).is_file()
    {
        anyhow::bail!("config file does not exist: {}", path.display());
    }

    let config = AppConfig::load(cli.config.as_deref())?;
    logging::init_logging(&config.logging, cli.verbose)?;

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(&config, cli.mock).await,
        Commands::Check => check_config(&config),
        Commands::Enqueue {
            task_type,
            user_id,
            username,
        } => enqueue(&config, task_type, &user_id, &username).await,
        Commands::Admin { action, user_id } => admin(&config, cli.mock, action, &user_id).await,
        Commands::DeadLetters { json } => list_dead_letters(&config, json).await,
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("Checking configuration...");
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}

fn build_module(config: &AppConfig, mock: bool) -> Result<ProvisioningModule> {
    let parts = if mock {
        tracing::info!("Mock mode enabled: using in-memory adapters");
        Collaborators::mock()
    } else {
        Collaborators::live(&config.provisioning)?
    };
    ProvisioningModule::new(&config.provisioning, parts)
}

async fn run_server(config: &AppConfig, mock: bool) -> Result<()> {
    tracing::info!("Provisioner starting");
    let module = build_module(config, mock)?;

    let cancel = CancellationToken::new();
    signals::cancel_on_shutdown(cancel.clone());

    module.run(cancel).await;
    tracing::info!("Provisioner stopped");
    Ok(())
}

fn open_spool(config: &AppConfig) -> Result<SpoolQueue> {
    let dir = &config.provisioning.queue.spool_dir;
    SpoolQueue::open(dir).with_context(|| format!("failed to open spool at {}", dir.display()))
}

async fn enqueue(config: &AppConfig, kind: TaskKind, user_id: &str, username: &str) -> Result<()> {
    let username = Username::parse(username)?;
    let user_id = UserId::new(user_id);
    let task = match kind {
        TaskKind::Provision => ProvisioningTask::provision(user_id, username),
        TaskKind::Deprovision => ProvisioningTask::deprovision(user_id, username),
    };

    open_spool(config)?.enqueue(task.clone()).await?;
    println!("queued {} for {} ({})", task.task_type, task.user_id, task.username);
    Ok(())
}

/// Admin transitions only touch the directory and the spool; the allocation
/// table stays owned by the running worker.
async fn admin(config: &AppConfig, mock: bool, action: AdminAction, user_id: &str) -> Result<()> {
    if mock {
        anyhow::bail!("admin does not support --mock");
    }
    let directory = GraphDirectory::new(&config.provisioning.directory)
        .context("failed to configure identity directory")?;
    let admin = LifecycleAdmin::new(
        Arc::new(directory),
        Arc::new(open_spool(config)?),
        config.provisioning.call_timeout,
    );
    let id = UserId::new(user_id);

    match action {
        AdminAction::Approve => {
            let task = admin.approve(&id).await?;
            println!("approved {id}; queued {} for {}", task.task_type, task.username);
        }
        AdminAction::Reject => {
            admin.reject(&id).await?;
            println!("rejected {id}");
        }
        AdminAction::Revoke => {
            let task = admin.revoke(&id).await?;
            println!("revoking {id}; queued {} for {}", task.task_type, task.username);
        }
        AdminAction::Delete => {
            admin.delete(&id).await?;
            println!("deleted {id}");
        }
    }
    Ok(())
}

async fn list_dead_letters(config: &AppConfig, json: bool) -> Result<()> {
    let entries = open_spool(config)?.dead_letters().await?;

    if json {
        for entry in &entries {
            println!("{}", serde_json::to_string(entry)?);
        }
        return Ok(());
    }

    if entries.is_empty() {
        println!("no dead-lettered tasks");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{} {} {} user={} username={} attempts={} reason={} detail={}",
            entry.at.to_rfc3339(),
            entry.id,
            entry.task.task_type,
            entry.task.user_id,
            entry.task.username,
            entry.attempts,
            entry.reason,
            entry.detail,
        );
    }
    Ok(())
}
