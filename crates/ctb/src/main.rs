use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ctb_agent_cli::ContainerAgentProcess;
use ctb_core::{
    config::Config, queue::GroupQueue, router::Router, runner::AgentRunner,
    scheduler::TaskScheduler, security::SingletonLock, Error,
};
use ctb_store_sqlite::SqliteStore;
use ctb_telegram::TelegramChannel;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Most configuration lives in the environment / `.env` (see `Config`); these
/// flags exist for the handful of overrides an operator reaches for when
/// starting the process by hand.
#[derive(Parser, Debug)]
#[command(name = "ctb", version, about = "Multi-channel chat bridge to containerized agents")]
struct Cli {
    /// Override WORKSPACE_ROOT for this run.
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Override DATABASE_URL for this run.
    #[arg(long)]
    database_url: Option<String>,
}

impl Cli {
    fn apply_env_overrides(&self) {
        if let Some(root) = &self.workspace_root {
            std::env::set_var("WORKSPACE_ROOT", root);
        }
        if let Some(url) = &self.database_url {
            std::env::set_var("DATABASE_URL", url);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    ctb_core::logging::init("ctb")?;

    Cli::parse().apply_env_overrides();
    let cfg = Config::load()?;
    let _lock = SingletonLock::acquire(&cfg.lock_path)?;
    info!(workspace = %cfg.workspace_root.display(), "starting bridge");

    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);

    let token = cfg
        .telegram_bot_token
        .clone()
        .ok_or_else(|| Error::Config("TELEGRAM_BOT_TOKEN must be set".to_string()))?;
    let channel = Arc::new(TelegramChannel::new(teloxide::Bot::new(token)));

    let process = Arc::new(ContainerAgentProcess::new(
        cfg.agent_command.clone(),
        cfg.agent_args.clone(),
    ));

    // Constructed without a process fn first: the runner needs the queue to
    // register/deregister live agents, and the queue needs the runner's
    // process fn — `set_process_fn` below breaks the cycle.
    let queue = Arc::new(GroupQueue::new());

    let runner = Arc::new(AgentRunner::new(
        process,
        store.clone(),
        channel.clone(),
        queue.clone(),
        cfg.idle_timeout,
        cfg.assistant_name.clone(),
        cfg.main_group_folder.clone(),
    ));
    queue.set_process_fn(runner.into_process_fn());

    let router = Arc::new(Router::new(
        store.clone(),
        queue.clone(),
        channel,
        cfg.router_require_trigger,
        cfg.trigger_pattern.as_deref(),
    )?);

    let recovered = router.recover_pending().await?;
    if recovered > 0 {
        info!(recovered, "redelivered pending messages from a prior run");
    }

    let scheduler = TaskScheduler::new(store, queue.clone(), cfg.scheduler_poll_interval);

    let cancel = CancellationToken::new();

    let router_cancel = cancel.clone();
    let poll_interval = cfg.poll_interval;
    let router_task = tokio::spawn(async move { router.run(poll_interval, router_cancel).await });

    let scheduler_cancel = cancel.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_cancel).await });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c, shutting down anyway");
    }
    info!("shutdown requested, draining in-flight agent runs");
    cancel.cancel();

    let _ = router_task.await;
    let _ = scheduler_task.await;
    queue.shutdown(SHUTDOWN_GRACE).await;

    info!("shutdown complete");
    Ok(())
}
