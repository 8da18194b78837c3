//! Configuration parsing and validation.
//!
//! Effective settings are merged from defaults, an optional YAML/JSON config file, and
//! CLI flags / `MCP_PROXY_*` env vars (highest precedence).

use crate::error::{ProxyError, Result};
use crate::registry::{ContainerServers, ServerLaunchSpec};
use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// CLI Arguments
// ============================================================================

/// CLI arguments for the proxy.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-stdio-proxy")]
#[command(
    version,
    about = "Expose stdio MCP servers over MCP Streamable HTTP, one subprocess per session"
)]
pub struct CliArgs {
    /// Path to YAML (or `.json`) config file.
    #[arg(short = 'c', long = "config", env = "MCP_PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the fully resolved configuration (after env expansion + overrides) and exit.
    #[arg(long = "print-effective-config")]
    pub print_effective_config: bool,

    /// HTTP bind address (ip:port)
    #[arg(short = 'b', long, env = "MCP_PROXY_BIND")]
    pub bind: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "MCP_PROXY_LOG")]
    pub log_level: Option<String>,

    /// Time budget for the replies of one proxied call (seconds)
    #[arg(long, env = "MCP_PROXY_CALL_TIMEOUT")]
    pub call_timeout: Option<u64>,

    /// Sessions without traffic for this long are stopped (seconds)
    #[arg(long, env = "MCP_PROXY_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// How often the idle reaper runs (seconds)
    #[arg(long, env = "MCP_PROXY_SWEEP_INTERVAL")]
    pub sweep_interval: Option<u64>,

    /// Interval between SSE keep-alive comments (seconds)
    #[arg(long, env = "MCP_PROXY_SSE_KEEP_ALIVE")]
    pub sse_keep_alive: Option<u64>,

    /// Grace period between closing a subprocess's stdin and killing it (milliseconds)
    #[arg(long, env = "MCP_PROXY_STOP_GRACE_MS")]
    pub stop_grace_ms: Option<u64>,
}

// ============================================================================
// Config File
// ============================================================================

const DEFAULT_BIND: &str = "127.0.0.1:8900";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_SSE_KEEP_ALIVE_SECS: u64 = 15;
const DEFAULT_STOP_GRACE_MS: u64 = 2000;

/// Effective proxy settings (after merging defaults + config + env + CLI).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    pub bind: String,
    pub log_level: String,
    pub call_timeout: u64,
    pub idle_timeout: u64,
    pub sweep_interval: u64,
    pub sse_keep_alive: u64,
    pub stop_grace_ms: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            call_timeout: crate::timeouts::call_timeout_default_secs(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL_SECS,
            sse_keep_alive: DEFAULT_SSE_KEEP_ALIVE_SECS,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
        }
    }
}

impl ProxySettings {
    #[must_use]
    pub fn call_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }

    #[must_use]
    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    #[must_use]
    pub fn sweep_interval_duration(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    #[must_use]
    pub fn sse_keep_alive_duration(&self) -> Duration {
        Duration::from_secs(self.sse_keep_alive)
    }

    #[must_use]
    pub fn stop_grace_duration(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Proxy settings as provided by the config file (partial; all fields optional).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProxySection {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub call_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub idle_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub sweep_interval: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub sse_keep_alive: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub stop_grace_ms: Option<u64>,
}

/// Servers registered for one container.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerLaunchSpec>,
}

/// Config file format.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub containers: HashMap<String, ContainerConfig>,
}

// ============================================================================
// Effective Configuration
// ============================================================================

/// Merged configuration from all sources.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub cli: CliArgs,
    pub proxy: ProxySettings,
    pub containers: HashMap<String, ContainerConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub proxy: ProxySettings,
    pub containers: HashMap<String, ContainerConfig>,
}

impl ProxyConfig {
    #[must_use]
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            proxy: self.proxy.clone(),
            containers: self.containers.clone(),
        }
    }

    /// Load and merge configuration from CLI args, env, and the config file.
    pub fn load(cli: CliArgs) -> Result<Self> {
        let mut proxy = ProxySettings::default();
        let mut containers = HashMap::new();

        // 1) Config file (if provided).
        if let Some(config_path) = &cli.config {
            let file = load_config_file(config_path)?;
            apply_proxy_section(&mut proxy, file.proxy)?;
            containers = expand_containers(file.containers)?;
        }

        // 2) CLI/ENV overrides (CLI > ENV is handled by clap).
        apply_cli_overrides(&mut proxy, &cli)?;

        // 3) Validate.
        for (name, value) in [
            ("callTimeout", proxy.call_timeout),
            ("idleTimeout", proxy.idle_timeout),
            ("sweepInterval", proxy.sweep_interval),
            ("sseKeepAlive", proxy.sse_keep_alive),
        ] {
            if value == 0 {
                return Err(ProxyError::Config(format!("{name} must be > 0")));
            }
        }
        for (container_id, container) in &containers {
            for (server_name, spec) in &container.servers {
                if spec.command.trim().is_empty() {
                    return Err(ProxyError::Config(format!(
                        "containers.{container_id}.servers.{server_name}: command must not be empty"
                    )));
                }
            }
        }

        // 4) Clamp call timeout to the operator cap.
        let cap = crate::timeouts::call_timeout_max_secs();
        if proxy.call_timeout > cap {
            tracing::warn!(
                call_timeout = proxy.call_timeout,
                cap,
                "callTimeout exceeds MCP_PROXY_CALL_TIMEOUT_MAX_SECS cap; clamping"
            );
            proxy.call_timeout = cap;
        }

        Ok(Self {
            cli,
            proxy,
            containers,
        })
    }

    /// Re-read only the container table from the config file.
    ///
    /// Proxy settings are fixed for the life of the process; this backs registry reloads.
    pub fn reload_containers(&self) -> Result<HashMap<String, ContainerConfig>> {
        match &self.cli.config {
            Some(path) => expand_containers(load_config_file(path)?.containers),
            None => Ok(HashMap::new()),
        }
    }
}

/// Flatten the config's container table into registry form.
#[must_use]
pub fn registry_table(
    containers: HashMap<String, ContainerConfig>,
) -> HashMap<String, ContainerServers> {
    containers
        .into_iter()
        .map(|(id, container)| (id, container.servers))
        .collect()
}

// ============================================================================
// Helper Functions
// ============================================================================

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ProxyError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    // YAML by default; JSON when extension is .json
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

fn apply_proxy_section(proxy: &mut ProxySettings, section: ProxySection) -> Result<()> {
    if let Some(bind) = section.bind {
        proxy.bind = expand_env_string(&bind)?;
    }
    if let Some(level) = section.log_level {
        proxy.log_level = expand_env_string(&level)?;
    }
    if let Some(v) = section.call_timeout {
        proxy.call_timeout = v;
    }
    if let Some(v) = section.idle_timeout {
        proxy.idle_timeout = v;
    }
    if let Some(v) = section.sweep_interval {
        proxy.sweep_interval = v;
    }
    if let Some(v) = section.sse_keep_alive {
        proxy.sse_keep_alive = v;
    }
    if let Some(v) = section.stop_grace_ms {
        proxy.stop_grace_ms = v;
    }
    Ok(())
}

fn apply_cli_overrides(proxy: &mut ProxySettings, cli: &CliArgs) -> Result<()> {
    if let Some(bind) = &cli.bind {
        proxy.bind = expand_env_string(bind)?;
    }

    // Precedence for log level:
    // CLI flag (--log-level) / MCP_PROXY_LOG env (via clap) > RUST_LOG env > config file > defaults
    if let Some(level) = &cli.log_level {
        proxy.log_level.clone_from(level);
    } else if let Ok(level) = std::env::var("RUST_LOG") {
        proxy.log_level = level;
    }

    if let Some(v) = cli.call_timeout {
        proxy.call_timeout = v;
    }
    if let Some(v) = cli.idle_timeout {
        proxy.idle_timeout = v;
    }
    if let Some(v) = cli.sweep_interval {
        proxy.sweep_interval = v;
    }
    if let Some(v) = cli.sse_keep_alive {
        proxy.sse_keep_alive = v;
    }
    if let Some(v) = cli.stop_grace_ms {
        proxy.stop_grace_ms = v;
    }
    Ok(())
}

fn expand_containers(
    containers: HashMap<String, ContainerConfig>,
) -> Result<HashMap<String, ContainerConfig>> {
    containers
        .into_iter()
        .map(|(id, container)| {
            let servers = container
                .servers
                .into_iter()
                .map(|(name, spec)| Ok((name, expand_launch_spec(spec)?)))
                .collect::<Result<HashMap<_, _>>>()?;
            Ok((id, ContainerConfig { servers }))
        })
        .collect()
}

/// Expand ${VAR} patterns in a launch spec.
fn expand_launch_spec(mut spec: ServerLaunchSpec) -> Result<ServerLaunchSpec> {
    spec.command = expand_env_string(&spec.command)?;
    spec.args = spec
        .args
        .into_iter()
        .map(|arg| expand_env_string(&arg))
        .collect::<Result<Vec<_>>>()?;
    spec.env = spec
        .env
        .into_iter()
        .map(|(k, v)| Ok((k, expand_env_string(&v)?)))
        .collect::<Result<HashMap<_, _>>>()?;
    Ok(spec)
}

/// Expand `${VAR}` occurrences using environment variables.
///
/// A referenced variable that is not set is an error; an unterminated `${` is kept as is.
pub fn expand_env_string(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let name = &rest[start + 2..start + 2 + len];
        let value = std::env::var(name).map_err(|_| {
            ProxyError::Config(format!(
                "Environment variable '{name}' not found (referenced in config)"
            ))
        })?;
        out.push_str(&rest[..start]);
        out.push_str(&value);
        rest = &rest[start + 2 + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Deserialize `Option<u64>` given as a number or as a string that may reference `${ENV}`.
fn deserialize_option_u64_env<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as DeError;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => {
            let expanded = expand_env_string(&s).map_err(D::Error::custom)?;
            let expanded = expanded.trim();
            expanded.parse::<u64>().map(Some).map_err(|e| {
                D::Error::custom(format!("expected unsigned integer, got '{expanded}': {e}"))
            })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
