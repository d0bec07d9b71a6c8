//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.clawrelay/config.json`) and environment.
//! Secrets may live in either place; non-empty environment values win.

use crate::gateway::ClientOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP relay server settings.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Pairing store, secret, and issuer defaults.
    #[serde(default)]
    pub pairing: PairingConfig,

    /// Timeouts for gateway connections.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Relay bind, port, and issuer auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// HTTP port (default 18790).
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_relay_bind")]
    pub bind: String,

    /// Token that authorizes privileged `/pairings/issue` calls. Overridden by
    /// OPENCLAW_PAIRING_ISSUER_TOKEN env.
    #[serde(default)]
    pub issuer_token: Option<String>,

    /// Accept gateways on loopback and private networks. Local development only.
    #[serde(default)]
    pub allow_private_gateways: bool,
}

fn default_relay_port() -> u16 {
    18790
}

fn default_relay_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            bind: default_relay_bind(),
            issuer_token: None,
            allow_private_gateways: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingConfig {
    /// Store file. Relative paths are resolved against the config file's parent.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Secret that seals stored gateway tokens. Overridden by OPENCLAW_PAIRING_SECRET env.
    #[serde(default)]
    pub secret: Option<String>,
    /// Retired secrets whose sealed values must still open.
    #[serde(default)]
    pub previous_secrets: Vec<String>,
    /// Lifetime of claimed sessions (default 7 days, clamped to 5 minutes..60 days).
    #[serde(default)]
    pub session_ttl_seconds: Option<i64>,
    #[serde(default)]
    pub default_gateway_url: Option<String>,
    #[serde(default)]
    pub default_gateway_token: Option<String>,
    #[serde(default)]
    pub default_agent_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_chat_timeout_ms")]
    pub chat_timeout_ms: u64,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Complete a turn with buffered text when the stream goes idle instead of failing.
    #[serde(default)]
    pub idle_completion: bool,
}

fn default_chat_timeout_ms() -> u64 {
    70_000
}

fn default_verify_timeout_ms() -> u64 {
    9_000
}

fn default_idle_timeout_ms() -> u64 {
    20_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            chat_timeout_ms: default_chat_timeout_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            idle_completion: false,
        }
    }
}

impl GatewayConfig {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions::from_millis(
            self.chat_timeout_ms,
            self.verify_timeout_ms,
            self.idle_timeout_ms,
            self.idle_completion,
        )
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn config_value(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the pairing secret: env OPENCLAW_PAIRING_SECRET overrides config.
pub fn resolve_pairing_secret(config: &Config) -> Option<String> {
    env_value("OPENCLAW_PAIRING_SECRET").or_else(|| config_value(&config.pairing.secret))
}

/// Resolve the issuer token: env OPENCLAW_PAIRING_ISSUER_TOKEN overrides config.
pub fn resolve_issuer_token(config: &Config) -> Option<String> {
    env_value("OPENCLAW_PAIRING_ISSUER_TOKEN").or_else(|| config_value(&config.relay.issuer_token))
}

/// Gateway credential used by privileged issue calls that omit one.
#[derive(Clone, Default)]
pub struct IssuerDefaults {
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
    pub agent_name: Option<String>,
}

impl std::fmt::Debug for IssuerDefaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerDefaults")
            .field("gateway_url", &self.gateway_url)
            .field("gateway_token", &self.gateway_token.as_ref().map(|_| "<set>"))
            .field("agent_name", &self.agent_name)
            .finish()
    }
}

/// Resolve issuer defaults; each OPENCLAW_PAIRING_DEFAULT_* env var overrides its config field.
pub fn resolve_issuer_defaults(config: &Config) -> IssuerDefaults {
    let p = &config.pairing;
    IssuerDefaults {
        gateway_url: env_value("OPENCLAW_PAIRING_DEFAULT_GATEWAY_URL")
            .or_else(|| config_value(&p.default_gateway_url)),
        gateway_token: env_value("OPENCLAW_PAIRING_DEFAULT_GATEWAY_TOKEN")
            .or_else(|| config_value(&p.default_gateway_token)),
        agent_name: env_value("OPENCLAW_PAIRING_DEFAULT_AGENT_NAME")
            .or_else(|| config_value(&p.default_agent_name)),
    }
}

/// Resolve the pairing store file: env OPENCLAW_PAIRING_STORE_FILE, then config (relative to
/// the config file's parent), then `pairings.json` next to the config file.
pub fn resolve_store_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if let Some(p) = env_value("OPENCLAW_PAIRING_STORE_FILE") {
        return PathBuf::from(p);
    }
    match &config.pairing.store_path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("pairings.json"),
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CLAWRELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".clawrelay").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or CLAWRELAY_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
