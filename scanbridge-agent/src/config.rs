//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Daemon configuration. File: ~/.config/scanbridge/config.toml or
/// /etc/scanbridge/config.toml. Env overrides: SCANBRIDGE_UDP_PORT,
/// SCANBRIDGE_TCP_PORT, SCANBRIDGE_FILES_DIR, SCANBRIDGE_AGENT_NAME,
/// SCANBRIDGE_PROXY_IP.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Control port (discovery + transfer negotiation), UDP.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Data port (raw file bytes), TCP.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Seconds to wait for the downstream acknowledgement when forwarding.
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout: f64,
    /// Read buffer size for TCP sessions, bytes.
    #[serde(default = "default_tcp_chunk_size")]
    pub tcp_chunk_size: usize,
    /// Seconds a TCP session may stall before it is failed.
    #[serde(default = "default_tcp_connection_timeout")]
    pub tcp_connection_timeout: f64,
    /// Seconds an announced transfer stays claimable before it expires.
    #[serde(default = "default_pending_idle_window")]
    pub pending_idle_window: f64,
    /// Seconds in-flight sessions get to finish at shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScannerConfig {
    /// This agent's logical name (at most 20 ASCII bytes).
    #[serde(default = "default_src_name")]
    pub default_src_name: String,
    /// Where received files are stored.
    #[serde(default = "default_files_directory")]
    pub files_directory: PathBuf,
    /// Upper bound on stored files; oldest are deleted past it.
    #[serde(default = "default_max_files_retention")]
    pub max_files_retention: usize,
    /// Forward attempts per file in proxy mode.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Forward each received file to a downstream agent.
    #[serde(default)]
    pub enabled: bool,
    /// Downstream agent address (required when enabled).
    #[serde(default)]
    pub agent_ip_address: Option<Ipv4Addr>,
}

fn default_udp_port() -> u16 {
    scanbridge_core::DEFAULT_UDP_PORT
}
fn default_tcp_port() -> u16 {
    scanbridge_core::DEFAULT_TCP_PORT
}
fn default_discovery_timeout() -> f64 {
    5.0
}
fn default_tcp_chunk_size() -> usize {
    8192
}
fn default_tcp_connection_timeout() -> f64 {
    10.0
}
fn default_pending_idle_window() -> f64 {
    30.0
}
fn default_shutdown_grace() -> f64 {
    5.0
}
fn default_src_name() -> String {
    "Agent".to_string()
}
fn default_files_directory() -> PathBuf {
    PathBuf::from("files")
}
fn default_max_files_retention() -> usize {
    10
}
fn default_max_retry_attempts() -> u32 {
    3
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            tcp_port: default_tcp_port(),
            discovery_timeout: default_discovery_timeout(),
            tcp_chunk_size: default_tcp_chunk_size(),
            tcp_connection_timeout: default_tcp_connection_timeout(),
            pending_idle_window: default_pending_idle_window(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            default_src_name: default_src_name(),
            files_directory: default_files_directory(),
            max_files_retention: default_max_files_retention(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

impl NetworkConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.discovery_timeout)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tcp_connection_timeout)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_secs_f64(self.pending_idle_window)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("SCANBRIDGE_UDP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.network.udp_port = p;
        }
    }
    if let Ok(s) = std::env::var("SCANBRIDGE_TCP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.network.tcp_port = p;
        }
    }
    if let Ok(s) = std::env::var("SCANBRIDGE_FILES_DIR") {
        if !s.is_empty() {
            c.scanner.files_directory = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("SCANBRIDGE_AGENT_NAME") {
        if !s.is_empty() {
            c.scanner.default_src_name = s;
        }
    }
    if let Ok(s) = std::env::var("SCANBRIDGE_PROXY_IP") {
        if let Ok(ip) = s.parse::<Ipv4Addr>() {
            c.proxy.agent_ip_address = Some(ip);
            c.proxy.enabled = true;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/scanbridge/config.toml"));
    }
    out.push(PathBuf::from("/etc/scanbridge/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
