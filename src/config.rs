//! Configuration types, built from environment variables.
//!
//! Unparseable values fall back to the default with a warning; nothing here
//! aborts startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Which messaging surface the binary runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Cli,
    Web,
}

impl FromStr for ChannelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cli" => Ok(Self::Cli),
            "web" => Ok(Self::Web),
            other => Err(ConfigError::InvalidValue {
                key: "INBOX_CHANNEL".into(),
                message: format!("unknown channel '{other}', expected cli or web"),
            }),
        }
    }
}

/// Queue, storage and surface settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Upper bound on simultaneously running tasks.
    pub max_concurrent: usize,
    /// Delay before the post-recovery scheduler kick.
    pub recovery_delay: Duration,
    pub db_path: PathBuf,
    pub channel: ChannelKind,
    pub http_port: u16,
    /// Root for per-task output directories. When set, each task runs in
    /// `<artifact_dir>/<task_id>` instead of the agent's working dir.
    pub artifact_dir: Option<PathBuf>,
    /// When set, logs are also written to a daily-rotated file here.
    pub log_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            recovery_delay: Duration::from_secs(5),
            db_path: PathBuf::from("./data/inbox.db"),
            channel: ChannelKind::Cli,
            http_port: 8080,
            artifact_dir: None,
            log_dir: None,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let mut max_concurrent = parse_or(&lookup, "INBOX_MAX_CONCURRENT", defaults.max_concurrent);
        if max_concurrent == 0 {
            tracing::warn!("INBOX_MAX_CONCURRENT must be at least 1, using 1");
            max_concurrent = 1;
        }

        Self {
            max_concurrent,
            recovery_delay: Duration::from_secs(parse_or(
                &lookup,
                "INBOX_RECOVERY_DELAY_SECS",
                defaults.recovery_delay.as_secs(),
            )),
            db_path: lookup("INBOX_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            channel: parse_or(&lookup, "INBOX_CHANNEL", defaults.channel),
            http_port: parse_or(&lookup, "INBOX_HTTP_PORT", defaults.http_port),
            artifact_dir: non_empty(&lookup, "INBOX_ARTIFACT_DIR").map(PathBuf::from),
            log_dir: non_empty(&lookup, "INBOX_LOG_DIR").map(PathBuf::from),
        }
    }
}

/// Agent backend settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Executable of the agent CLI.
    pub command: String,
    /// Extra arguments placed before the prompt.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub default_timeout: Duration,
    /// Per-intent overrides of `default_timeout`.
    pub intent_timeouts: HashMap<String, Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            working_dir: None,
            default_timeout: Duration::from_secs(1800), // 30 minutes
            intent_timeouts: HashMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let args = lookup("INBOX_AGENT_ARGS")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let intent_timeouts = lookup("INBOX_AGENT_TIMEOUTS")
            .map(|raw| parse_intent_timeouts(&raw))
            .unwrap_or_default();

        Self {
            command: non_empty(&lookup, "INBOX_AGENT_COMMAND").unwrap_or(defaults.command),
            args,
            working_dir: non_empty(&lookup, "INBOX_AGENT_WORKDIR").map(PathBuf::from),
            default_timeout: Duration::from_secs(parse_or(
                &lookup,
                "INBOX_AGENT_TIMEOUT_SECS",
                defaults.default_timeout.as_secs(),
            )),
            intent_timeouts,
        }
    }

    /// Execution timeout for a task of the given intent.
    pub fn timeout_for(&self, intent: &str) -> Duration {
        self.intent_timeouts
            .get(intent)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

/// Parse `intent=secs,intent=secs`. Malformed entries are skipped.
fn parse_intent_timeouts(raw: &str) -> HashMap<String, Duration> {
    let mut out = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parsed = entry
            .split_once('=')
            .and_then(|(intent, secs)| Some((intent.trim(), secs.trim().parse::<u64>().ok()?)));
        match parsed {
            Some((intent, secs)) if !intent.is_empty() => {
                out.insert(intent.to_string(), Duration::from_secs(secs));
            }
            _ => tracing::warn!(entry, "Ignoring malformed INBOX_AGENT_TIMEOUTS entry"),
        }
    }
    out
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = non_empty(lookup, key) else {
        return default;
    };
    match raw.parse() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Invalid config value, using default");
            default
        }
    }
}
