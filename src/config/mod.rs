//! Configuration management
//!
//! One YAML file per node, loaded once at startup. Everything malformed is
//! rejected here, before any socket is opened.

use crate::kcp::{KcpConfig, KcpMode};
use crate::packet::{FlagClassifier, MacAddr, PacketError, TcpFlags, MAX_SEGMENT_PAYLOAD};
use crate::crypto::SEAL_OVERHEAD;
use crate::protocol::{DEFAULT_IDLE_TIMEOUT, PROTOCOL_NAME};
use crate::network::NetworkInfo;
use crate::proxy::Address;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Tunnel port used in generated examples
const EXAMPLE_PORT: u16 = 9999;

/// Ephemeral range for a client's `port: 0`
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Largest KCP MTU whose sealed packets still fit one forged segment
pub const MAX_KCP_MTU: usize = MAX_SEGMENT_PAYLOAD - SEAL_OVERHEAD;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing '{0}'")]
    Missing(&'static str),

    #[error("Invalid '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid TCP flags: {0}")]
    Flags(#[from] PacketError),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Client => "client",
            Role::Server => "server",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Log verbosity as written in the config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    None,
}

impl LogLevel {
    /// The equivalent `tracing` filter directive
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
            LogLevel::None => "off",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            "none" | "off" => Ok(LogLevel::None),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// A listen address; `:port` binds every interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindAddr(pub SocketAddr);

impl BindAddr {
    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl FromStr for BindAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(port) = s.strip_prefix(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("bad port in '{}'", s))?;
            return Ok(BindAddr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))));
        }
        s.parse::<SocketAddr>()
            .map(BindAddr)
            .map_err(|_| format!("expected ip:port or :port, got '{}'", s))
    }
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for BindAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BindAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub role: Role,
    #[serde(default)]
    pub log: LogConfig,
    /// Server only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<ListenConfig>,
    /// Client only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub socks5: Vec<Socks5Config>,
    /// Client only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forward: Vec<ForwardConfig>,
    pub network: NetworkConfig,
    /// Client only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
    pub transport: TransportConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    pub addr: BindAddr,
}

/// Local SOCKS5 listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Socks5Config {
    pub listen: BindAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Socks5Config {
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

/// Plain TCP port forward through the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    pub listen: BindAddr,
    /// `host:port` dialed by the server
    pub target: String,
}

impl ForwardConfig {
    pub fn target(&self) -> Result<Address, ConfigError> {
        self.target
            .parse()
            .map_err(|e: crate::proxy::ProxyError| invalid("forward.target", e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub interface: String,
    pub ipv4: Ipv4Config,
    #[serde(default)]
    pub tcp: TcpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ipv4Config {
    /// Source address of forged segments; port 0 picks an ephemeral port
    pub addr: SocketAddrV4,
    pub router_mac: MacAddr,
}

/// Flag combinations for forged (`local_flag`) and captured (`remote_flag`) segments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpConfig {
    #[serde(default = "default_flags")]
    pub local_flag: Vec<TcpFlags>,
    #[serde(default = "default_flags")]
    pub remote_flag: Vec<TcpFlags>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            local_flag: default_flags(),
            remote_flag: default_flags(),
        }
    }
}

fn default_flags() -> Vec<TcpFlags> {
    vec![TcpFlags::PSH_ACK]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: SocketAddrV4,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_conn")]
    pub conn: u16,
    /// Seconds without traffic before a session is reaped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    pub kcp: KcpSection,
}

fn default_protocol() -> String {
    PROTOCOL_NAME.to_string()
}

fn default_conn() -> u16 {
    1
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT
}

/// `transport.kcp`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KcpSection {
    #[serde(default)]
    pub mode: KcpMode,
    /// Pre-shared secret
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodelay: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resend: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nocongestion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sndwnd: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcvwnd: Option<u16>,
}

impl KcpSection {
    /// Engine tuning; the latency overrides only apply in manual mode
    pub fn engine_config(&self) -> KcpConfig {
        let mut config = KcpConfig::from_mode(self.mode);
        if self.mode == KcpMode::Manual {
            if let Some(nodelay) = self.nodelay {
                config.nodelay = nodelay;
            }
            if let Some(interval) = self.interval {
                config.interval = interval;
            }
            if let Some(resend) = self.resend {
                config.resend = resend;
            }
            if let Some(nocongestion) = self.nocongestion {
                config.nocongestion = nocongestion;
            }
        }
        if let Some(mtu) = self.mtu {
            config.mtu = mtu;
        }
        if let Some(sndwnd) = self.sndwnd {
            config.sndwnd = sndwnd;
        }
        if let Some(rcvwnd) = self.rcvwnd {
            config.rcvwnd = rcvwnd;
        }
        config
    }
}

impl Config {
    /// Load and validate configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.role {
            Role::Server => {
                let listen = self.listen.as_ref().ok_or(ConfigError::Missing("listen.addr"))?;
                if listen.addr.port() == 0 {
                    return Err(invalid("listen.addr", "port must not be 0"));
                }
            }
            Role::Client => {
                let server = self.server.as_ref().ok_or(ConfigError::Missing("server.addr"))?;
                if server.addr.ip().is_unspecified() || server.addr.port() == 0 {
                    return Err(invalid("server.addr", format!("{} is not dialable", server.addr)));
                }
                if self.socks5.is_empty() && self.forward.is_empty() {
                    return Err(ConfigError::Missing("socks5"));
                }
                for forward in &self.forward {
                    forward.target()?;
                }
                for socks in &self.socks5 {
                    if socks.username.is_some() != socks.password.is_some() {
                        return Err(invalid(
                            "socks5",
                            "username and password must be set together",
                        ));
                    }
                }
            }
        }

        let network = &self.network;
        if network.interface.trim().is_empty() {
            return Err(ConfigError::Missing("network.interface"));
        }
        if network.ipv4.addr.ip().is_unspecified() {
            return Err(invalid("network.ipv4.addr", "an explicit IPv4 address is required"));
        }
        if network.ipv4.router_mac.is_zero() {
            return Err(invalid("network.ipv4.router_mac", "all-zero MAC"));
        }
        self.classifier()?;

        let transport = &self.transport;
        if transport.protocol != PROTOCOL_NAME {
            return Err(invalid(
                "transport.protocol",
                format!("only '{}' is supported", PROTOCOL_NAME),
            ));
        }
        if !(1..=256).contains(&transport.conn) {
            return Err(invalid("transport.conn", "must be between 1 and 256"));
        }
        if transport.idle_timeout == 0 {
            return Err(invalid("transport.idle_timeout", "must be positive"));
        }
        if transport.kcp.key.is_empty() {
            return Err(ConfigError::Missing("transport.kcp.key"));
        }

        let kcp = transport.kcp.engine_config();
        if !(64..=MAX_KCP_MTU).contains(&kcp.mtu) {
            return Err(invalid(
                "transport.kcp.mtu",
                format!("must be between 64 and {}", MAX_KCP_MTU),
            ));
        }
        if kcp.sndwnd == 0 || kcp.rcvwnd == 0 {
            return Err(invalid("transport.kcp", "window sizes must be positive"));
        }
        if !(10..=5000).contains(&kcp.interval) {
            return Err(invalid("transport.kcp.interval", "must be between 10 and 5000 ms"));
        }

        Ok(())
    }

    /// Flag classifier for this node
    pub fn classifier(&self) -> Result<FlagClassifier, ConfigError> {
        let tcp = &self.network.tcp;
        Ok(FlagClassifier::new(
            tcp.local_flag.clone(),
            tcp.remote_flag.clone(),
        )?)
    }

    /// Address forged segments are sent from and captured for
    ///
    /// A server uses the listen port on the interface address. A client with
    /// port 0 gets a random ephemeral port, drawn on every call.
    pub fn local_endpoint(&self) -> SocketAddrV4 {
        let ip = *self.network.ipv4.addr.ip();
        match (self.role, &self.listen) {
            (Role::Server, Some(listen)) => SocketAddrV4::new(ip, listen.addr.port()),
            _ => match self.network.ipv4.addr.port() {
                0 => SocketAddrV4::new(ip, rand::thread_rng().gen_range(EPHEMERAL_PORTS)),
                port => SocketAddrV4::new(ip, port),
            },
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.idle_timeout)
    }

    /// A starting config for `role` on the detected network
    ///
    /// A client still needs the real `server.addr` filled in.
    pub fn example(role: Role, net: &NetworkInfo, key: String) -> Self {
        let (listen, socks5, server, port) = match role {
            Role::Server => (
                Some(ListenConfig {
                    addr: BindAddr(SocketAddr::from(([0, 0, 0, 0], EXAMPLE_PORT))),
                }),
                Vec::new(),
                None,
                EXAMPLE_PORT,
            ),
            Role::Client => (
                None,
                vec![Socks5Config {
                    listen: BindAddr(SocketAddr::from(([127, 0, 0, 1], 1080))),
                    username: None,
                    password: None,
                }],
                Some(ServerConfig {
                    addr: SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 1), EXAMPLE_PORT),
                }),
                0,
            ),
        };

        Config {
            role,
            log: LogConfig::default(),
            listen,
            socks5,
            forward: Vec::new(),
            network: NetworkConfig {
                interface: net.interface.clone(),
                ipv4: Ipv4Config {
                    addr: SocketAddrV4::new(net.ipv4, port),
                    router_mac: net.gateway_mac,
                },
                tcp: TcpConfig::default(),
            },
            server,
            transport: TransportConfig {
                protocol: default_protocol(),
                conn: default_conn(),
                idle_timeout: default_idle_timeout(),
                kcp: KcpSection {
                    mode: KcpMode::default(),
                    key,
                    nodelay: None,
                    interval: None,
                    resend: None,
                    nocongestion: None,
                    mtu: None,
                    sndwnd: None,
                    rcvwnd: None,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = r#"
role: client
log:
  level: debug
socks5:
  - listen: "127.0.0.1:1080"
forward:
  - listen: ":8080"
    target: "example.com:80"
network:
  interface: eth0
  ipv4:
    addr: "192.168.1.10:0"
    router_mac: "aa:bb:cc:dd:ee:ff"
  tcp:
    local_flag: ["PA"]
    remote_flag: ["PA", "A"]
server:
  addr: "203.0.113.5:9999"
transport:
  protocol: kcp
  conn: 2
  kcp:
    mode: fast
    key: "0123456789abcdef0123456789abcdef"
"#;

    const SERVER: &str = r#"
role: server
log:
  level: fatal
listen:
  addr: ":9999"
network:
  interface: eth0
  ipv4:
    addr: "203.0.113.5:9999"
    router_mac: "aa-bb-cc-dd-ee-01"
transport:
  kcp:
    mode: manual
    key: "secret"
    nodelay: 1
    interval: 15
    resend: 3
    nocongestion: false
"#;

    #[test]
    fn test_client_config() {
        let config = Config::from_yaml(CLIENT).unwrap();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.log.level.directive(), "debug");
        assert_eq!(config.transport.conn, 2);
        assert_eq!(config.forward[0].listen.to_string(), "0.0.0.0:8080");
        assert_eq!(config.forward[0].target().unwrap().to_string(), "example.com:80");
        assert_eq!(config.network.tcp.remote_flag.len(), 2);

        let local = config.local_endpoint();
        assert_eq!(*local.ip(), Ipv4Addr::new(192, 168, 1, 10));
        assert!(EPHEMERAL_PORTS.contains(&local.port()));
    }

    #[test]
    fn test_server_config() {
        let config = Config::from_yaml(SERVER).unwrap();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.log.level.directive(), "error");
        assert_eq!(
            config.local_endpoint(),
            "203.0.113.5:9999".parse::<SocketAddrV4>().unwrap()
        );
        // Defaults
        assert_eq!(config.transport.protocol, "kcp");
        assert_eq!(config.transport.conn, 1);
        assert_eq!(config.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.network.tcp.local_flag, vec![TcpFlags::PSH_ACK]);

        let kcp = config.transport.kcp.engine_config();
        assert_eq!((kcp.nodelay, kcp.interval, kcp.resend), (1, 15, 3));
        assert!(!kcp.nocongestion);
        assert_eq!(kcp.mtu, 1350);
    }

    #[test]
    fn test_overrides_ignored_outside_manual() {
        let yaml = SERVER.replace("mode: manual", "mode: fast2");
        let config = Config::from_yaml(&yaml).unwrap();
        let kcp = config.transport.kcp.engine_config();
        assert_eq!((kcp.nodelay, kcp.interval, kcp.resend), (1, 20, 2));
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = [
            CLIENT.replace("aa:bb:cc:dd:ee:ff", "aa:bb:cc"),
            CLIENT.replace(r#"["PA", "A"]"#, r#"["PX"]"#),
            CLIENT.replace(r#"["PA", "A"]"#, r#"["PAA"]"#),
            CLIENT.replace("192.168.1.10:0", "192.168.1.10"),
            CLIENT.replace("conn: 2", "conn: 0"),
            CLIENT.replace("protocol: kcp", "protocol: quic"),
            CLIENT.replace("mode: fast", "mode: turbo"),
            CLIENT.replace("key: \"0123456789abcdef0123456789abcdef\"", "key: \"\""),
            CLIENT.replace("role: client", "role: relay"),
            CLIENT.replace("target: \"example.com:80\"", "target: \"example.com\""),
            SERVER.replace(":9999\"\nnetwork", ":0\"\nnetwork"),
        ];
        for (index, yaml) in cases.iter().enumerate() {
            assert!(Config::from_yaml(yaml).is_err(), "case {} accepted", index);
        }
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let yaml = CLIENT.replace("  conn: 2", "  conn: 2\n  obfs: true");
        assert!(matches!(Config::from_yaml(&yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_role_sections_required() {
        let yaml = CLIENT.replace("server:\n  addr: \"203.0.113.5:9999\"\n", "");
        assert!(matches!(
            Config::from_yaml(&yaml),
            Err(ConfigError::Missing("server.addr"))
        ));

        let yaml = SERVER.replace("listen:\n  addr: \":9999\"\n", "");
        assert!(matches!(
            Config::from_yaml(&yaml),
            Err(ConfigError::Missing("listen.addr"))
        ));
    }

    #[test]
    fn test_yaml_output_reloads() {
        let config = Config::from_yaml(CLIENT).unwrap();
        let reloaded = Config::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(reloaded.server.unwrap().addr, config.server.unwrap().addr);
        assert_eq!(reloaded.network.tcp.remote_flag, config.network.tcp.remote_flag);
    }

    #[test]
    fn test_examples_validate() {
        let net = NetworkInfo {
            interface: "eth0".to_string(),
            ipv4: Ipv4Addr::new(10, 0, 0, 5),
            mac: "02:00:00:00:00:01".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            gateway_mac: "52:54:00:12:35:02".parse().unwrap(),
        };
        for role in [Role::Client, Role::Server] {
            let example = Config::example(role, &net, crate::crypto::generate_secret());
            let config = Config::from_yaml(&example.to_yaml().unwrap()).unwrap();
            assert_eq!(config.role, role);
            assert_eq!(config.network.ipv4.router_mac, net.gateway_mac);
        }
    }

    #[test]
    fn test_log_levels() {
        assert_eq!("none".parse::<LogLevel>().unwrap().directive(), "off");
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
