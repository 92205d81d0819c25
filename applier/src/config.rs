//! dbguard policy configuration loading and validation

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::rules::Action;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dbguard/policy.toml";

/// Linux IFNAMSIZ minus the trailing NUL
const MAX_INTERFACE_LEN: usize = 15;

/// xt_recent keeps at most `ip_pkt_list_tot` (default 20) hits per source, and
/// the drop rule needs `max_attempts + 1` of them
pub const MAX_RECENT_HITCOUNT: u32 = 20;

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub ssh_rate_limit: RateLimitConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub trusted_hosts: Vec<TrustedHost>,
}

/// External address granted standing SSH and database access
#[derive(Debug, Clone, Deserialize)]
pub struct TrustedHost {
    pub name: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_database_port")]
    pub database_port: u16,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            database_port: default_database_port(),
            ssh_port: default_ssh_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// New connections allowed per source inside the window; the next one is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u32,
    #[serde(default = "default_list_name")]
    pub list_name: String,
    /// Target for sources over the limit: `drop` or `reject`
    #[serde(default = "default_limit_action")]
    pub action: Action,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
            list_name: default_list_name(),
            action: default_limit_action(),
        }
    }
}

/// How a plan reaches the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// One command per step; failures are logged and skipped, never rolled back.
    #[default]
    Sequential,
    /// Whole table replaced through a single iptables-restore commit.
    Atomic,
}

#[derive(Debug, Deserialize)]
pub struct ApplyConfig {
    #[serde(default)]
    pub mode: ApplyMode,
    #[serde(default = "default_iptables")]
    pub iptables: String,
    #[serde(default = "default_iptables_restore")]
    pub iptables_restore: String,
    #[serde(default = "default_iptables_save")]
    pub iptables_save: String,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            mode: ApplyMode::default(),
            iptables: default_iptables(),
            iptables_restore: default_iptables_restore(),
            iptables_save: default_iptables_save(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_persistence_path")]
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_persistence_path(),
        }
    }
}

// Default value functions
fn default_interface() -> String { "eth0".into() }
fn default_database_port() -> u16 { 3306 }
fn default_ssh_port() -> u16 { 22 }
fn default_true() -> bool { true }
fn default_max_attempts() -> u32 { 3 }
fn default_window_secs() -> u32 { 10 }
fn default_list_name() -> String { "SSH".into() }
fn default_limit_action() -> Action { Action::Drop }
fn default_iptables() -> String { "iptables".into() }
fn default_iptables_restore() -> String { "iptables-restore".into() }
fn default_iptables_save() -> String { "iptables-save".into() }
fn default_persistence_path() -> PathBuf { PathBuf::from("/etc/iptables/rules.v4") }

/// Characters allowed in tokens that end up as bare words in rendered
/// commands and restore payloads
fn is_plain_token(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

impl PolicyConfig {
    /// Reject configurations that would strand a remote operator or render
    /// unusable commands. Nothing touches the kernel before this passes.
    pub fn validate(&self) -> Result<()> {
        if self.trusted_hosts.is_empty() {
            bail!(
                "no trusted hosts configured; the INPUT DROP policy would cut off all remote access"
            );
        }

        let mut seen = HashSet::new();
        for host in &self.trusted_hosts {
            if !is_plain_token(&host.name) {
                bail!(
                    "trusted host name {:?} must be non-empty and use only letters, digits, '-', '_' or '.'",
                    host.name
                );
            }
            if !seen.insert(host.name.as_str()) {
                bail!("duplicate trusted host name {:?}", host.name);
            }
            if host.address.is_unspecified() || host.address.is_broadcast() {
                bail!(
                    "trusted host {} has unusable address {}",
                    host.name,
                    host.address
                );
            }
        }

        let iface = &self.network.interface;
        if iface.len() > MAX_INTERFACE_LEN || !is_plain_token(iface) {
            bail!("invalid interface name {iface:?}");
        }
        if self.network.database_port == 0 || self.network.ssh_port == 0 {
            bail!("database_port and ssh_port must be non-zero");
        }

        let limit = &self.ssh_rate_limit;
        if limit.enabled {
            if limit.max_attempts == 0 || limit.window_secs == 0 {
                bail!("ssh_rate_limit.max_attempts and window_secs must be at least 1");
            }
            if limit.max_attempts >= MAX_RECENT_HITCOUNT {
                bail!(
                    "ssh_rate_limit.max_attempts must be below {MAX_RECENT_HITCOUNT}: \
                     xt_recent tracks at most {MAX_RECENT_HITCOUNT} hits per source (ip_pkt_list_tot)"
                );
            }
            if limit.action == Action::Accept {
                bail!("ssh_rate_limit.action must be drop or reject");
            }
            if !is_plain_token(&limit.list_name) {
                bail!("invalid ssh_rate_limit.list_name {:?}", limit.list_name);
            }
        }

        Ok(())
    }
}

/// Load configuration from `path`, falling back to defaults when the file
/// does not exist
pub fn load_config(path: &Path) -> Result<PolicyConfig> {
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: PolicyConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    } else {
        tracing::warn!("Config file not found at {}, using defaults", path.display());
        Ok(PolicyConfig::default())
    }
}
