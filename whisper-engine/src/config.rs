//! Configuration types for the session manager

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

use ipnet::Ipv4Net;
use whisper_tun::{TunConfig, MIN_MTU};

use crate::control::DEFAULT_SOCKET_PATH;
use crate::error::{Error, Result};

/// Main configuration structure
///
/// Every section is optional; a missing section takes its defaults.
///
/// # Example Configuration
///
/// ```toml
/// [common]
/// log_level = "info"
///
/// [session]
/// remote_url = "wss://relay.example.com/wisp/"
/// resolver_url = "https://cloudflare-dns.com/dns-query"
///
/// [interface]
/// address = "10.0.0.2/24"
/// route = "0.0.0.0/0"
/// dns = "10.0.0.144"
/// mtu = 1500
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Common settings
    #[serde(default)]
    pub common: CommonConfig,

    /// Default endpoints for connect requests
    #[serde(default)]
    pub session: SessionConfig,

    /// Tunnel interface request
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Proxy bridge process
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Packet-routing engine
    #[serde(default)]
    pub engine: EngineConfig,

    /// Teardown worker pool
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.interface.validate()?;
        self.bridge.validate()?;

        if self.engine.command.trim().is_empty() {
            return Err(Error::Config("engine command must not be empty".into()));
        }

        if self.shutdown.workers == 0 {
            return Err(Error::Config("shutdown.workers must be at least 1".into()));
        }

        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# Whisper tunnel configuration

[common]
# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

# Control socket used by `whisper connect|disconnect|status`
# control_socket = "/var/run/whisper.sock"

[session]
# Remote tunnel endpoint. Empty means the built-in default endpoint.
# A bare host gets "wss://" prepended and a trailing "/" appended.
remote_url = ""

# DNS-over-HTTPS resolver. Empty means the built-in default resolver.
resolver_url = ""

[interface]
# Interface name (Linux)
name = "whisper"

# Local address and subnet of the tunnel interface
address = "10.0.0.2/24"

# Networks routed into the tunnel ("0.0.0.0/0" routes everything)
route = "0.0.0.0/0"

# DNS server announced on the interface; the bridge answers it over DoH
dns = "10.0.0.144"

mtu = 1500

# Keep this process's own traffic out of the tunnel where the OS supports it
exclude_self = true

[bridge]
# SOCKS bridge executable
command = "wisp2socks"

# Arguments; {remote}, {port} and {resolver} are substituted
args = ["--url", "{remote}", "--port", "{port}", "--doh", "{resolver}"]

# How long to wait for the bridge to accept connections
ready_timeout_ms = 5000

[engine]
# tun2socks-compatible routing engine executable
command = "tun2socks"
mark = 0
# Outbound interface for the engine (empty = default route)
interface = ""
log_level = "debug"
# rest_api = "127.0.0.1:9090"
# tcp_send_buffer_size = "1m"
# tcp_receive_buffer_size = "1m"
tcp_moderate_receive_buffer = false

[shutdown]
# Background workers for engine start and teardown
workers = 2
# Graceful wait for teardown, then forced cancellation and a final wait
grace_ms = 3000
force_ms = 1000
"#
        .to_string()
    }
}

/// Common configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Control socket path
    #[serde(default)]
    pub control_socket: Option<String>,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            control_socket: None,
        }
    }
}

impl CommonConfig {
    /// Control socket path, falling back to the default
    pub fn socket_path(&self) -> &str {
        self.control_socket.as_deref().unwrap_or(DEFAULT_SOCKET_PATH)
    }
}

/// Default endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Remote tunnel endpoint (normalized on connect)
    #[serde(default)]
    pub remote_url: String,

    /// DNS-over-HTTPS resolver (normalized on connect)
    #[serde(default)]
    pub resolver_url: String,
}

/// Tunnel interface request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name
    #[serde(default = "default_interface_name")]
    pub name: String,

    /// Local address in CIDR notation
    #[serde(default = "default_address")]
    pub address: Ipv4Net,

    /// Route directive in CIDR notation
    #[serde(default = "default_route")]
    pub route: Ipv4Net,

    /// DNS server announced on the interface
    #[serde(default = "default_dns")]
    pub dns: IpAddr,

    /// MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Exclude this process from the tunnel
    #[serde(default = "default_true")]
    pub exclude_self: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            address: default_address(),
            route: default_route(),
            dns: default_dns(),
            mtu: default_mtu(),
            exclude_self: true,
        }
    }
}

impl InterfaceConfig {
    /// Validate the interface section
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum {})",
                self.mtu, MIN_MTU
            )));
        }
        Ok(())
    }

    /// Build the interface request
    ///
    /// `excluded_app` is the identity of the requesting process, kept out of
    /// the tunnel so the bridge's own traffic does not loop back into it.
    pub fn to_tun_config(&self, excluded_app: Option<&str>) -> Result<TunConfig> {
        let mut builder = TunConfig::builder()
            .address(self.address.addr(), self.address.prefix_len())
            .route(self.route)
            .dns_server(self.dns)
            .mtu(self.mtu)
            .blocking(false);

        if !self.name.is_empty() {
            builder = builder.name(&self.name);
        }

        if let Some(app) = excluded_app.filter(|_| self.exclude_self) {
            builder = builder.exclude_app(app);
        }

        Ok(builder.build()?)
    }
}

/// Proxy bridge process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Executable
    #[serde(default = "default_bridge_command")]
    pub command: String,

    /// Argument template
    #[serde(default = "default_bridge_args")]
    pub args: Vec<String>,

    /// Readiness timeout in milliseconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: default_bridge_args(),
            ready_timeout_ms: default_ready_timeout(),
        }
    }
}

impl BridgeConfig {
    /// Validate the bridge section
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::Config("bridge command must not be empty".into()));
        }
        if !self.args.iter().any(|arg| arg.contains("{port}")) {
            return Err(Error::Config(
                "bridge args must pass the listening port via {port}".into(),
            ));
        }
        Ok(())
    }

    /// Substitute session values into the argument template
    pub fn render_args(&self, remote_url: &str, port: u16, resolver_url: &str) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{remote}", remote_url)
                    .replace("{port}", &port)
                    .replace("{resolver}", resolver_url)
            })
            .collect()
    }
}

/// Routing engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable
    #[serde(default = "default_engine_command")]
    pub command: String,

    /// Routing mark for the engine's outbound sockets
    #[serde(default)]
    pub mark: u32,

    /// Outbound interface name (empty = default)
    #[serde(default)]
    pub interface: String,

    /// Engine log level
    #[serde(default = "default_engine_log_level")]
    pub log_level: String,

    /// REST control address (unused when unset)
    #[serde(default)]
    pub rest_api: Option<String>,

    /// TCP send buffer size hint
    #[serde(default)]
    pub tcp_send_buffer_size: Option<String>,

    /// TCP receive buffer size hint
    #[serde(default)]
    pub tcp_receive_buffer_size: Option<String>,

    /// Let the engine tune TCP receive buffers
    #[serde(default)]
    pub tcp_moderate_receive_buffer: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            mark: 0,
            interface: String::new(),
            log_level: default_engine_log_level(),
            rest_api: None,
            tcp_send_buffer_size: None,
            tcp_receive_buffer_size: None,
            tcp_moderate_receive_buffer: false,
        }
    }
}

/// Worker pool and teardown timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Number of background workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Graceful wait in milliseconds
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Wait after forced cancellation in milliseconds
    #[serde(default = "default_force_ms")]
    pub force_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            grace_ms: default_grace_ms(),
            force_ms: default_force_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interface_name() -> String {
    "whisper".to_string()
}

fn default_address() -> Ipv4Net {
    Ipv4Net::new(std::net::Ipv4Addr::new(10, 0, 0, 2), 24).unwrap_or_default()
}

fn default_route() -> Ipv4Net {
    Ipv4Net::default()
}

fn default_dns() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 144))
}

fn default_mtu() -> u16 {
    whisper_tun::DEFAULT_MTU
}

fn default_true() -> bool {
    true
}

fn default_bridge_command() -> String {
    "wisp2socks".to_string()
}

fn default_bridge_args() -> Vec<String> {
    ["--url", "{remote}", "--port", "{port}", "--doh", "{resolver}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ready_timeout() -> u64 {
    5000
}

fn default_engine_command() -> String {
    "tun2socks".to_string()
}

fn default_engine_log_level() -> String {
    "debug".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_grace_ms() -> u64 {
    3000
}

fn default_force_ms() -> u64 {
    1000
}
