//! Configuration resolution for Toolgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/toolgate/settings.json)
//! 3. Project config (.toolgate/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged key by key, so a project file that only sets
//! `permissions.default_mode` keeps every other value from the layers below.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::PermissionMode;

/// Complete Toolgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub permissions: PermissionConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            permissions: PermissionConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Agent subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable, resolved through `PATH` when not absolute.
    pub binary: PathBuf,
    pub model: Option<String>,
    /// Grace period between SIGINT and a forced kill on close.
    pub terminate_timeout_secs: u64,
    /// How long an outgoing control request (interrupt) waits for its response.
    pub control_timeout_secs: u64,
    pub max_frame_bytes: usize,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            model: None,
            terminate_timeout_secs: 5,
            control_timeout_secs: 30,
            max_frame_bytes: 1024 * 1024, // 1 MiB
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    pub const fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }
}

pub const DEFAULT_PERMISSION_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_DECISION_DURATION_SECS: u64 = 24 * 60 * 60;

/// Permission system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Mode for scopes with no explicit override.
    pub default_mode: PermissionMode,
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
    /// Manual decision timeout (seconds). Default: 5 minutes.
    pub timeout_secs: u64,
    /// Cache manual decisions per (agent, scope, tool).
    pub remember_decisions: bool,
    /// Lifetime of a cached decision (seconds). Default: 24 hours.
    pub decision_duration_secs: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            default_mode: PermissionMode::Auto,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            timeout_secs: DEFAULT_PERMISSION_TIMEOUT_SECS,
            remember_decisions: false,
            decision_duration_secs: DEFAULT_DECISION_DURATION_SECS,
        }
    }
}

impl PermissionConfig {
    /// Manual decision timeout; `0` means the default.
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(or_default(self.timeout_secs, DEFAULT_PERMISSION_TIMEOUT_SECS))
    }

    /// Cached decision lifetime; `0` means the default.
    pub const fn decision_duration(&self) -> Duration {
        Duration::from_secs(or_default(
            self.decision_duration_secs,
            DEFAULT_DECISION_DURATION_SECS,
        ))
    }
}

const fn or_default(secs: u64, default: u64) -> u64 {
    if secs == 0 { default } else { secs }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    load_config_with(
        global_config_path().as_deref(),
        project_dir,
        |key| std::env::var(key).ok(),
    )
}

/// Load configuration from explicit locations and an environment lookup.
pub fn load_config_with<F>(
    global_path: Option<&Path>,
    project_dir: Option<&Path>,
    env: F,
) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(path) = global_path.filter(|p| p.exists()) {
        tracing::debug!(path = %path.display(), "Loading global config");
        merge_json(&mut merged, load_config_file(path)?);
    }

    if let Some(path) = project_dir
        .map(project_config_path)
        .filter(|p| p.exists())
    {
        tracing::debug!(path = %path.display(), "Loading project config");
        merge_json(&mut merged, load_config_file(&path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, env);
    Ok(config)
}

/// Project config location inside `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".toolgate").join("settings.json")
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".toolgate").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/toolgate/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("toolgate").join("settings.json"))
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
    if value.is_object() {
        Ok(value)
    } else {
        Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )))
    }
}

/// Recursively overlay `overlay` onto `base`. Objects merge per key; any other
/// value (arrays included) replaces the base value.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides<F>(config: &mut Config, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = env("TOOLGATE_AGENT_BIN").filter(|v| !v.is_empty()) {
        config.agent.binary = PathBuf::from(val);
    }
    if let Some(val) = env("TOOLGATE_DEFAULT_MODE") {
        config.permissions.default_mode = PermissionMode::parse(&val);
    }
    if let Some(val) = env("TOOLGATE_PERMISSION_TIMEOUT") {
        match val.parse() {
            Ok(secs) => config.permissions.timeout_secs = secs,
            Err(_) => tracing::warn!(value = %val, "Ignoring non-numeric TOOLGATE_PERMISSION_TIMEOUT"),
        }
    }
    if let Some(val) = env("TOOLGATE_LOG_LEVEL") {
        config.log_level = val;
    }
}
