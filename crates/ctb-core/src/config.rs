use std::{
    env,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the bridge core.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub workspace_root: PathBuf,
    pub database_url: String,
    pub assistant_name: String,
    pub main_group_folder: String,

    // Router / dispatch
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub router_require_trigger: bool,
    pub trigger_pattern: Option<String>,

    // Agent process
    pub agent_command: String,
    pub agent_args: Vec<String>,

    // Scheduler
    pub scheduler_poll_interval: Duration,

    // Singleton lock
    pub lock_path: PathBuf,

    // Telegram channel adapter
    pub telegram_bot_token: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let workspace_root =
            env_path("WORKSPACE_ROOT").unwrap_or_else(|| PathBuf::from("./workspace"));
        fs::create_dir_all(&workspace_root)?;

        let database_url = env_str("DATABASE_URL")
            .unwrap_or_else(|| format!("sqlite://{}/bridge.db", workspace_root.display()));

        let assistant_name = env_str("ASSISTANT_NAME").unwrap_or_else(|| "assistant".to_string());

        let main_group_folder = env_str("MAIN_GROUP_FOLDER").ok_or_else(|| {
            Error::Config("MAIN_GROUP_FOLDER environment variable is required".to_string())
        })?;

        let poll_interval = Duration::from_millis(env_u64("POLL_INTERVAL").unwrap_or(2_000));
        let idle_timeout = Duration::from_millis(env_u64("IDLE_TIMEOUT").unwrap_or(120_000));

        let router_require_trigger = env_bool("ROUTER_REQUIRE_TRIGGER").unwrap_or(false);
        let trigger_pattern = env_str("TRIGGER_PATTERN").and_then(non_empty);
        if router_require_trigger && trigger_pattern.is_none() {
            return Err(Error::Config(
                "ROUTER_REQUIRE_TRIGGER=true requires TRIGGER_PATTERN to be set".to_string(),
            ));
        }

        let agent_command =
            env_str("AGENT_COMMAND").unwrap_or_else(|| "docker".to_string());
        let agent_args = parse_csv(env_str("AGENT_ARGS")).unwrap_or_else(|| {
            vec![
                "run".to_string(),
                "--rm".to_string(),
                "-i".to_string(),
                "agent-image".to_string(),
            ]
        });

        let scheduler_poll_interval =
            Duration::from_millis(env_u64("SCHEDULER_POLL_INTERVAL").unwrap_or(15_000));

        let lock_path =
            env_path("SINGLETON_LOCK_PATH").unwrap_or_else(|| workspace_root.join("bridge.lock"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").and_then(non_empty);

        Ok(Self {
            workspace_root,
            database_url,
            assistant_name,
            main_group_folder,
            poll_interval,
            idle_timeout,
            router_require_trigger,
            trigger_pattern,
            agent_command,
            agent_args,
            scheduler_poll_interval,
            lock_path,
            telegram_bot_token,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Option<Vec<String>> {
    let v = v?;
    let out = v
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
