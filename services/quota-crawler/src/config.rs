//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys never live in the TOML; they are imported from
//! `credentials.keys_file` or added through the admin API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use credential_pool::CostTable;
use dispatcher::{DispatcherConfig, RetryPolicy};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub retry: RetrySection,
    /// Call kind → quota units, overriding the built-in table
    #[serde(default)]
    pub costs: HashMap<String, u64>,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Durable quota ledger settings
#[derive(Debug, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

/// Worker pool settings
#[derive(Debug, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_reload_failures")]
    pub max_reload_failures: u32,
    /// Call kinds made for every keyword, in order
    #[serde(default = "default_plan")]
    pub plan: Vec<String>,
}

/// Backoff for transient upstream failures
#[derive(Debug, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

/// Metered API endpoint settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Query parameter carrying the keyword
    #[serde(default = "default_task_param")]
    pub task_param: String,
    /// Query parameter carrying the API key
    #[serde(default = "default_key_param")]
    pub key_param: String,
    /// Call kind → path under `base_url`
    #[serde(default = "default_paths")]
    pub paths: HashMap<String, String>,
    #[serde(default)]
    pub params: Vec<NameValue>,
    #[serde(default)]
    pub headers: Vec<NameValue>,
}

/// Query parameter or header added to every upstream request
#[derive(Debug, Clone, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

/// Credential import settings
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    /// One API key per line, imported at startup when not yet in the ledger
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    /// Quota given to imported, added and reset credentials
    #[serde(default = "default_quota")]
    pub default_quota: u64,
}

/// Admin listener settings
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Where task reports go
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_results_path")]
    pub results_path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("quota-ledger.json")
}

fn default_flush_interval() -> u64 {
    5
}

fn default_reload_interval() -> u64 {
    60
}

fn default_parallelism() -> usize {
    4
}

fn default_liveness_timeout() -> u64 {
    300
}

fn default_call_timeout() -> u64 {
    30
}

fn default_max_reload_failures() -> u32 {
    5
}

fn default_plan() -> Vec<String> {
    vec!["search".to_string()]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_task_param() -> String {
    "q".to_string()
}

fn default_key_param() -> String {
    "key".to_string()
}

fn default_paths() -> HashMap<String, String> {
    [
        ("search", "search"),
        ("list-comments", "commentThreads"),
        ("channels", "channels"),
        ("playlist-items", "playlistItems"),
        ("videos", "videos"),
    ]
    .into_iter()
    .map(|(kind, path)| (kind.to_string(), path.to_string()))
    .collect()
}

fn default_quota() -> u64 {
    10_000
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    64
}

fn default_results_path() -> PathBuf {
    PathBuf::from("results.jsonl")
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            flush_interval_secs: default_flush_interval(),
            reload_interval_secs: default_reload_interval(),
        }
    }
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            liveness_timeout_secs: default_liveness_timeout(),
            call_timeout_secs: default_call_timeout(),
            max_reload_failures: default_max_reload_failures(),
            plan: default_plan(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: true,
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            keys_file: None,
            default_quota: default_quota(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_admin_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_path: default_results_path(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// `QUOTA_LEDGER_PATH` overrides `ledger.path`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(ledger_path) = std::env::var("QUOTA_LEDGER_PATH") {
            config.ledger.path = PathBuf::from(ledger_path);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        use common::Error;

        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(Error::invalid(
                "upstream.base_url",
                format!("must start with http:// or https://, got: {}", self.upstream.base_url),
            ));
        }
        if self.ledger.flush_interval_secs == 0 {
            return Err(Error::invalid("ledger.flush_interval_secs", "must be greater than 0"));
        }
        if self.ledger.reload_interval_secs == 0 {
            return Err(Error::invalid("ledger.reload_interval_secs", "must be greater than 0"));
        }
        if self.dispatcher.parallelism == 0 {
            return Err(Error::invalid("dispatcher.parallelism", "must be at least 1"));
        }
        if self.dispatcher.call_timeout_secs == 0 {
            return Err(Error::invalid("dispatcher.call_timeout_secs", "must be greater than 0"));
        }
        if self.dispatcher.liveness_timeout_secs <= self.dispatcher.call_timeout_secs {
            return Err(Error::invalid(
                "dispatcher.liveness_timeout_secs",
                format!(
                    "{} must exceed call_timeout_secs ({})",
                    self.dispatcher.liveness_timeout_secs, self.dispatcher.call_timeout_secs
                ),
            ));
        }
        if self.dispatcher.max_reload_failures == 0 {
            return Err(Error::invalid("dispatcher.max_reload_failures", "must be at least 1"));
        }
        if self.dispatcher.plan.is_empty() {
            return Err(Error::invalid("dispatcher.plan", "must name at least one call kind"));
        }
        let costs = self.cost_table();
        if let Some(kind) = self.dispatcher.plan.iter().find(|k| !costs.contains(k)) {
            return Err(Error::invalid("dispatcher.plan", format!("kind {kind:?} has no cost")));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::invalid("retry.max_delay_ms", "must be at least retry.base_delay_ms"));
        }
        if self.admin.max_connections == 0 {
            return Err(Error::invalid("admin.max_connections", "must be greater than 0"));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("quota-crawler.toml")
    }

    pub fn cost_table(&self) -> CostTable {
        CostTable::with_overrides(&self.costs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            parallelism: self.dispatcher.parallelism,
            liveness_timeout: Duration::from_secs(self.dispatcher.liveness_timeout_secs),
            reload_interval: Duration::from_secs(self.ledger.reload_interval_secs),
            max_reload_failures: self.dispatcher.max_reload_failures,
            plan: self.dispatcher.plan.clone(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatcher.call_timeout_secs)
    }
}
