//! Configuration resolution for `DocVerify`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/docverify/settings.json)
//! 3. Project config (.docverify/settings.json)
//! 4. Environment variables (`DOCVERIFY_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete `DocVerify` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    /// External agent commands keyed by agent kind (`identity`, `financial`, `academic`).
    #[serde(default)]
    pub agents: BTreeMap<String, AgentCommandConfig>,
    /// Completeness rules; empty means the built-in one-document-per-category policy.
    #[serde(default)]
    pub completeness: Vec<CompletenessRuleConfig>,
}

/// Daemon-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Global cap on concurrently executing pipelines.
    pub max_concurrent_pipelines: usize,
    pub database_path: Option<PathBuf>,
    /// Root under which each session gets `<id>/uploads`.
    pub sessions_dir: Option<PathBuf>,
    pub log_level: String,
    /// Sessions older than this are removed by the expiry sweep.
    pub session_ttl_hours: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: 2,
            database_path: None,
            sessions_dir: None,
            log_level: "info".to_string(),
            session_ttl_hours: 24,
        }
    }
}

/// Job retry and deadline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Wall-clock deadline for a single pipeline attempt.
    pub attempt_timeout_secs: u64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base of the exponential backoff between timed-out attempts.
    pub retry_base_delay_ms: u64,
    /// How often a running job refreshes its lease on the session.
    pub heartbeat_interval_secs: u64,
    /// A processing session whose lease is older than this is treated as orphaned.
    pub lease_ttl_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 600,
            max_attempts: 3,
            retry_base_delay_ms: 2_000,
            heartbeat_interval_secs: 10,
            lease_ttl_secs: 60,
        }
    }
}

/// How documents are assigned to categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationStrategy {
    /// Filename patterns first, external classifier for whatever is left unknown.
    #[default]
    Hybrid,
    FilenameOnly,
    ExternalOnly,
}

/// Master pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run agents on parallel OS threads instead of one after another.
    pub parallel_dispatch: bool,
    /// Overall deadline for the parallel agent fan-out.
    pub agent_deadline_secs: u64,
    pub name_match_threshold: f64,
    pub max_file_size_bytes: u64,
    pub classification_strategy: ClassificationStrategy,
    pub financial_threshold_eur: f64,
    /// Capacity of the typed progress channel between stages and the publisher.
    pub progress_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallel_dispatch: false,
            agent_deadline_secs: 300,
            name_match_threshold: 0.85,
            max_file_size_bytes: 50 * 1024 * 1024, // 50 MB
            classification_strategy: ClassificationStrategy::Hybrid,
            financial_threshold_eur: 15_000.0,
            progress_channel_capacity: 64,
        }
    }
}

/// Which publish/subscribe transport carries progress messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// In-process broadcast; only subscribers in this process see updates.
    #[default]
    Local,
    /// Rows in the shared database; works across processes.
    Database,
}

/// Progress fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Upper bound on how long a relay or subscriber waits before re-checking status.
    pub poll_interval_ms: u64,
    /// Per-subscriber queue bound; the oldest update is dropped when full.
    pub subscriber_capacity: usize,
    pub broker: BrokerKind,
    /// How often the database broker polls for new rows.
    pub broker_poll_interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            subscriber_capacity: 64,
            broker: BrokerKind::Local,
            broker_poll_interval_ms: 200,
        }
    }
}

/// External command implementing one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment passed to the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One data-driven completeness rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletenessRuleConfig {
    pub category: String,
    #[serde(default = "default_min_documents")]
    pub min_documents: usize,
    /// Raw output fields whose presence alone satisfies the rule.
    #[serde(default)]
    pub sufficient_markers: Vec<String>,
}

const fn default_min_documents() -> usize {
    1
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = load_layers(global_config_path().as_deref(), project_dir)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Merge the global file and the project file over the defaults.
///
/// Files are merged as JSON trees before deserializing, so a key a file does
/// not mention keeps the value from the layer below.
fn load_layers(global_path: Option<&Path>, project_dir: Option<&Path>) -> Result<Config> {
    let mut merged = Value::Object(Map::new());

    if let Some(path) = global_path.filter(|p| p.exists()) {
        merge_json(&mut merged, load_config_file(path)?);
    }
    if let Some(dir) = project_dir {
        let path = dir.join(".docverify").join("settings.json");
        if path.exists() {
            merge_json(&mut merged, load_config_file(&path)?);
        }
    }

    Ok(serde_json::from_value(merged)?)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_home().map(|p| p.join("docverify").join("settings.json"))
}

/// Default database path for the daemon.
pub fn database_path() -> Option<PathBuf> {
    config_home().map(|p| p.join("docverify").join("docverify.db"))
}

/// Default root for per-session upload and output directories.
pub fn sessions_dir() -> Option<PathBuf> {
    config_home().map(|p| p.join("docverify").join("sessions"))
}

fn config_home() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Parse a JSON config document; missing sections take their defaults.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(serde_json::from_str(content)?)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other value (arrays included) replaces what was there.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `DOCVERIFY_*` overrides read through `lookup`.
///
/// Values that fail to parse are ignored and the previous value is kept.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        lookup(key).and_then(|v| v.trim().parse().ok())
    }

    if let Some(n) = parsed(&lookup, "DOCVERIFY_MAX_PIPELINES") {
        config.daemon.max_concurrent_pipelines = n;
    }
    if let Some(val) = lookup("DOCVERIFY_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = lookup("DOCVERIFY_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("DOCVERIFY_SESSIONS_DIR") {
        config.daemon.sessions_dir = Some(PathBuf::from(val));
    }
    if let Some(n) = parsed(&lookup, "DOCVERIFY_ATTEMPT_TIMEOUT_SECS") {
        config.dispatch.attempt_timeout_secs = n;
    }
    if let Some(n) = parsed(&lookup, "DOCVERIFY_MAX_ATTEMPTS") {
        config.dispatch.max_attempts = n;
    }
    if let Some(b) = parsed(&lookup, "DOCVERIFY_PARALLEL_DISPATCH") {
        config.pipeline.parallel_dispatch = b;
    }
    if let Some(n) = parsed(&lookup, "DOCVERIFY_AGENT_DEADLINE_SECS") {
        config.pipeline.agent_deadline_secs = n;
    }
    if let Some(t) = parsed(&lookup, "DOCVERIFY_NAME_MATCH_THRESHOLD") {
        config.pipeline.name_match_threshold = t;
    }
}
