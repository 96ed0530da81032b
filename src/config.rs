use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub notifications: NotificationsConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub node_name: String,
    /// Limit which GPUs the scheduler can use (None = all GPUs).
    pub gpus: Option<Vec<u32>>,
    /// Seconds between scheduler ticks.
    pub refresh_rate_secs: u64,
    /// Bound on external subprocess / HTTP calls made by the scheduler.
    pub call_timeout_secs: u64,
    /// Age cap (seconds) after which wandb URL discovery stops polling a job.
    pub wandb_discovery_cap_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_name: default_node_name(),
            gpus: None,
            refresh_rate_secs: 3,
            call_timeout_secs: 10,
            wandb_discovery_cap_secs: 3600,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    pub webhooks: Vec<WebhookConfig>,
    pub max_concurrent_deliveries: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WebhookConfig {
    /// `discord` or `phone` — matches `Job::notifications` destinations.
    pub channel: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_webhook_max_retries")]
    pub max_retries: u32,
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_webhook_max_retries() -> u32 {
    3
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    59100
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "nexus".to_string())
}

/// Resolves the server home directory: `$NEXUS_HOME` if set, else the platform data dir.
pub fn home_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("NEXUS_HOME") {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|d| d.join("nexus"))
        .ok_or_else(|| anyhow::anyhow!("failed to resolve a data directory; set NEXUS_HOME"))
}

pub fn config_path(home: &Path) -> PathBuf {
    home.join("config.toml")
}

pub fn token_path(home: &Path) -> PathBuf {
    home.join("api_token")
}

pub fn db_path(home: &Path) -> PathBuf {
    home.join("jobs.db")
}

pub fn jobs_dir(home: &Path) -> PathBuf {
    home.join("jobs")
}

/// Loads config layered as: built-in defaults -> `config.toml` in the home dir ->
/// `NEXUS_`-prefixed environment variables. Writes a starter file on first boot.
pub fn load_config(home: &Path) -> anyhow::Result<Config> {
    let path = config_path(home);
    if !path.exists() {
        std::fs::create_dir_all(home)?;
        let starter = toml::to_string_pretty(&Config::default())?;
        std::fs::write(&path, starter)?;
        tracing::info!(path = %path.display(), "wrote starter config.toml");
    }

    let settings = config::Config::builder()
        .add_source(config::File::from(path.as_path()))
        .add_source(
            config::Environment::with_prefix("NEXUS")
                .separator("_")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("daemon.gpus"),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
