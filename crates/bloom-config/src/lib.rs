#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bloom-config** – typed configuration loading and per-agent session
//! persistence.
//!
//! Two responsibilities:
//!
//! - [`BloomConfig`]: the recognized `bloom.config.yaml` keys, loaded
//!   with defaults for anything missing and a logged warning (not a
//!   failure) for anything unrecognized.
//! - [`SessionStore`]: `<bloomDir>/.sessions/<agentName>.json`, the
//!   last-known session id per agent, so a restarted orchestrator can
//!   seed `AgentRuntime` resume attempts instead of starting fresh
//!   sessions for tasks that already had one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default `maxParallelAgents`.
pub const DEFAULT_MAX_PARALLEL_AGENTS: usize = 8;
/// Default `maxAttempts`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default `pollIntervalMs`.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
/// Default `hardKillGraceMs`.
pub const DEFAULT_HARD_KILL_GRACE_MS: u64 = 5_000;

/// Errors raised while loading or persisting configuration/session state.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// `bloom.config.yaml` could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A session record could not be (de)serialized.
    #[error("failed to (de)serialize session record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-agent overrides, keyed as `agent.<name>.*` in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AgentConfig {
    /// Default model for this agent.
    #[serde(default)]
    pub model: Option<String>,
    /// Activity timeout override, in milliseconds.
    #[serde(rename = "timeoutMs", default)]
    pub timeout_ms: Option<u64>,
    /// Heartbeat tick interval override, in milliseconds.
    #[serde(rename = "heartbeatIntervalMs", default)]
    pub heartbeat_interval_ms: Option<u64>,
    /// Environment overlaid on top of the agent spec's own `env.inject`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AgentConfig {
    /// `timeout_ms` as a [`Duration`], if set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// `heartbeat_interval_ms` as a [`Duration`], if set.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }
}

/// The recognized `bloom.config.yaml` keys. Unrecognized
/// top-level keys are logged and otherwise ignored — they never fail
/// the load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloomConfig {
    /// Global concurrency ceiling across all worker slots.
    #[serde(rename = "maxParallelAgents", default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    /// Fallback agent name for tasks with no `agentName`.
    #[serde(rename = "defaultAgent", default)]
    pub default_agent: Option<String>,
    /// Per-task retry ceiling before a task is marked `blocked`.
    #[serde(rename = "maxAttempts", default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Scheduler wake deadline, in milliseconds.
    #[serde(rename = "pollIntervalMs", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cancellation escalation window, in milliseconds.
    #[serde(rename = "hardKillGraceMs", default = "default_hard_kill_grace_ms")]
    pub hard_kill_grace_ms: u64,
    /// Per-agent overrides, keyed by agent name.
    #[serde(rename = "agent", default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: DEFAULT_MAX_PARALLEL_AGENTS,
            default_agent: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            hard_kill_grace_ms: DEFAULT_HARD_KILL_GRACE_MS,
            agents: BTreeMap::new(),
        }
    }
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "maxParallelAgents",
    "defaultAgent",
    "maxAttempts",
    "pollIntervalMs",
    "hardKillGraceMs",
    "agent",
];

impl BloomConfig {
    /// Load and parse `path` as a `bloom.config.yaml` document. Missing
    /// recognized keys fall back to their defaults; unrecognized
    /// top-level keys are logged and ignored.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::parse(&raw)
    }

    /// Parse an already-read YAML document, per the same rules as
    /// [`Self::load`].
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        warn_on_unrecognized_keys(raw);
        let config: Self = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    /// `poll_interval_ms` as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `hard_kill_grace_ms` as a [`Duration`].
    pub fn hard_kill_grace(&self) -> Duration {
        Duration::from_millis(self.hard_kill_grace_ms)
    }

    /// Overrides for `agent_name`, if any were configured.
    pub fn agent(&self, agent_name: &str) -> Option<&AgentConfig> {
        self.agents.get(agent_name)
    }
}

fn warn_on_unrecognized_keys(raw: &str) {
    let Ok(serde_yaml::Value::Mapping(map)) = serde_yaml::from_str::<serde_yaml::Value>(raw) else {
        return;
    };
    for key in map.keys() {
        if let Some(k) = key.as_str() {
            if !KNOWN_TOP_LEVEL_KEYS.contains(&k) {
                warn!(key = %k, "unrecognized configuration key; ignoring");
            }
        }
    }
}

fn default_max_parallel_agents() -> usize {
    DEFAULT_MAX_PARALLEL_AGENTS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_hard_kill_grace_ms() -> u64 {
    DEFAULT_HARD_KILL_GRACE_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// `<bloomDir>/.sessions/<agentName>.json`: the last-known session id
/// per agent, for resume across restarts.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// A session store rooted at `<bloom_dir>/.sessions`.
    pub fn new(bloom_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: bloom_dir.into().join(".sessions"),
        }
    }

    /// The last-known session id for `agent_name`, if a record exists
    /// and parses. Any I/O or parse failure is treated as "no record" —
    /// this is optional, best-effort state, not a source of truth.
    pub async fn load(&self, agent_name: &str) -> Option<String> {
        let path = self.dir.join(format!("{agent_name}.json"));
        let raw = tokio::fs::read_to_string(&path).await.ok()?;
        let record: SessionRecord = serde_json::from_str(&raw).ok()?;
        Some(record.session_id)
    }

    /// Persist `session_id` for `agent_name`, atomically (write a
    /// sibling temp file, then rename).
    pub async fn save(&self, agent_name: &str, session_id: &str) -> Result<(), ConfigError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let record = SessionRecord {
            session_id: session_id.to_string(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        let suffix: u64 = rand::random();
        let tmp = self.dir.join(format!(".{agent_name}.tmp{suffix:x}"));
        let path = self.dir.join(format!("{agent_name}.json"));
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_missing_keys() {
        let config = BloomConfig::parse("maxParallelAgents: 4\n").unwrap();
        assert_eq!(config.max_parallel_agents, 4);
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.hard_kill_grace_ms, DEFAULT_HARD_KILL_GRACE_MS);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn parse_ignores_unrecognized_keys_without_failing() {
        let config = BloomConfig::parse("totallyMadeUpKey: true\nmaxAttempts: 5\n").unwrap();
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn parse_reads_nested_agent_overrides() {
        let yaml = r#"
agent:
  claude-code:
    model: opus
    timeoutMs: 1000
    env:
      FOO: bar
"#;
        let config = BloomConfig::parse(yaml).unwrap();
        let agent = config.agent("claude-code").unwrap();
        assert_eq!(agent.model.as_deref(), Some("opus"));
        assert_eq!(agent.timeout(), Some(Duration::from_millis(1000)));
        assert_eq!(agent.env.get("FOO").map(String::as_str), Some("bar"));
    }

    #[tokio::test]
    async fn session_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert_eq!(store.load("claude-code").await, None);

        store.save("claude-code", "s1").await.unwrap();
        assert_eq!(store.load("claude-code").await.as_deref(), Some("s1"));

        store.save("claude-code", "s2").await.unwrap();
        assert_eq!(store.load("claude-code").await.as_deref(), Some("s2"));
    }
}
