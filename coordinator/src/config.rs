//! Runtime configuration: environment-variable surface of spec.md §6 plus
//! per-scene matchmaker/termination-message configuration, loaded once at
//! startup from an optional TOML file and overridable by environment
//! variables (mirrors the teacher's `reload_config` / `GameConfig.json`
//! pattern, generalized to the richer per-scene config this spec needs).

use protocol::{SceneId, TerminationReason};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

fn env_override_u64(key: &str, current: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(current)
}

/// Which built-in matchmaker a scene uses (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchmakerKind {
    Fifo,
    LatencyFifo,
    GroupReunion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneConfig {
    pub group_size: usize,
    #[serde(default = "default_matchmaker")]
    pub matchmaker: MatchmakerKind,
    pub max_server_rtt_sum_ms: Option<u32>,
    pub max_p2p_rtt_ms: Option<u32>,
    #[serde(default)]
    pub fallback_to_fifo: bool,
    #[serde(default)]
    pub termination_messages: HashMap<TerminationReason, String>,
}

fn default_matchmaker() -> MatchmakerKind {
    MatchmakerKind::Fifo
}

impl SceneConfig {
    /// The researcher-authored message for `reason`, falling back to a
    /// generic message the server never tries to improve on (§7: "it does
    /// not synthesize messages itself" beyond this fallback).
    pub fn message_for(&self, reason: TerminationReason) -> String {
        self.termination_messages
            .get(&reason)
            .cloned()
            .unwrap_or_else(|| reason.as_str().to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_loading_timeout_ms")]
    pub loading_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_participant_retention_ms")]
    pub participant_retention_ms: u64,
    #[serde(default = "default_audit_retention_ms")]
    pub audit_retention_ms: u64,
    #[serde(default = "default_audit_dir")]
    pub audit_dir: String,
    #[serde(default = "default_experiment_id")]
    pub experiment_id: String,
    #[serde(default)]
    pub scenes: HashMap<SceneId, SceneConfig>,
}

fn default_port() -> u16 {
    8080
}
fn default_ping_interval_ms() -> u64 {
    8_000
}
fn default_ping_timeout_ms() -> u64 {
    30_000
}
fn default_loading_timeout_ms() -> u64 {
    60_000
}
fn default_probe_timeout_ms() -> u64 {
    10_000
}
fn default_participant_retention_ms() -> u64 {
    5 * 60 * 1000
}
fn default_audit_retention_ms() -> u64 {
    60_000
}
fn default_audit_dir() -> String {
    "data".to_string()
}
fn default_experiment_id() -> String {
    "default".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            loading_timeout_ms: default_loading_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            participant_retention_ms: default_participant_retention_ms(),
            audit_retention_ms: default_audit_retention_ms(),
            audit_dir: default_audit_dir(),
            experiment_id: default_experiment_id(),
            scenes: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads a TOML config file, then applies environment-variable
    /// overrides for the scalar fields (§6 minimum env var surface).
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| format!("failed to read config file {path}: {e}"))?;
                toml::from_str(&raw).map_err(|e| format!("failed to parse config file: {e}"))?
            }
            None => Config::default(),
        };

        if let Ok(port) = env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        config.ping_interval_ms = env_override_u64("PING_INTERVAL_MS", config.ping_interval_ms);
        config.ping_timeout_ms = env_override_u64("PING_TIMEOUT_MS", config.ping_timeout_ms);
        config.loading_timeout_ms =
            env_override_u64("LOADING_TIMEOUT_MS", config.loading_timeout_ms);
        config.probe_timeout_ms = env_override_u64("PROBE_TIMEOUT_MS", config.probe_timeout_ms);
        config.participant_retention_ms =
            env_override_u64("PARTICIPANT_RETENTION_MS", config.participant_retention_ms);
        config.audit_retention_ms =
            env_override_u64("AUDIT_RETENTION_MS", config.audit_retention_ms);
        if let Ok(dir) = env::var("AUDIT_DIR") {
            config.audit_dir = dir;
        }

        Ok(config)
    }
}
