use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8085;
pub const DEFAULT_BIND: &str = "127.0.0.1";

// Scheduler tunables
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_STUCK_AFTER_SECS: u64 = 180; // 3 minutes without a completion report
pub const DEFAULT_PAGE_LIMIT: u32 = 200; // rows per sweep / dispatch pass
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 2;
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 60;

/// Top-level config (taskq.toml + TASKQ_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskqConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Startup gives up if the store is still unreachable after this long.
    #[serde(default = "default_wait_max_secs")]
    pub wait_max_secs: u64,
    #[serde(default = "default_wait_interval_ms")]
    pub wait_interval_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            wait_max_secs: default_wait_max_secs(),
            wait_interval_ms: default_wait_interval_ms(),
        }
    }
}

/// Polling loop tunables. None of these are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A STARTED task with no result after this many seconds is considered stuck.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
    /// Upper bound on rows touched by one sweep or one dispatch pass.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// Also push `run_at` forward when a previously failed task is dispatched.
    /// Off by default: backoff is applied once, when the failure is recorded.
    #[serde(default)]
    pub rearm_on_dispatch: bool,
    /// Return ENQUEUED rows to PENDING when the engine starts. Needed when
    /// the broker is in-process and loses its queue on restart.
    #[serde(default = "bool_true")]
    pub requeue_enqueued_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stuck_after_secs: DEFAULT_STUCK_AFTER_SECS,
            page_limit: DEFAULT_PAGE_LIMIT,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_cap_secs: DEFAULT_BACKOFF_CAP_SECS,
            rearm_on_dispatch: false,
            requeue_enqueued_on_startup: true,
        }
    }
}

/// In-process worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent executions per lane.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Buffered hand-offs per lane before `enqueue` reports the lane as full.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskq/taskq.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_wait_max_secs() -> u64 {
    60
}
fn default_wait_interval_ms() -> u64 {
    1_000
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_stuck_after_secs() -> u64 {
    DEFAULT_STUCK_AFTER_SECS
}
fn default_page_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}
fn default_backoff_base_secs() -> u64 {
    DEFAULT_BACKOFF_BASE_SECS
}
fn default_backoff_cap_secs() -> u64 {
    DEFAULT_BACKOFF_CAP_SECS
}
fn default_concurrency() -> usize {
    4
}
fn default_channel_capacity() -> usize {
    1024
}

impl TaskqConfig {
    /// Load config from a TOML file with TASKQ_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `TASKQ_SCHEDULER__POLL_INTERVAL_MS=500`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("TASKQ_").split("__")),
        )
    }

    /// Extract from an already-assembled figment. Split out so tests can feed
    /// inline TOML.
    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::TaskqError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskq/taskq.toml", home)
}
