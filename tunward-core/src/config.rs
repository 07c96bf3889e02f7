use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Top-level configuration, loaded once at tunnel start.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub routes: RouteRulesConfig,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Config {
    pub fn from_yaml(content: &str) -> crate::error::Result<Self> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| crate::error::Error::parse(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.server.address.is_empty() {
            return Err(crate::error::Error::config("Missing SOCKS5 server address"));
        }
        if self.server.port == 0 {
            return Err(crate::error::Error::config("Invalid SOCKS5 server port"));
        }
        if self.server.username.is_some() != self.server.password.is_some() {
            return Err(crate::error::Error::config(
                "Username and password must be configured together",
            ));
        }
        if let Some(ref user) = self.server.username {
            if user.len() > 255 {
                return Err(crate::error::Error::config("Username exceeds 255 bytes"));
            }
        }
        if let Some(ref pass) = self.server.password {
            if pass.len() > 255 {
                return Err(crate::error::Error::config("Password exceeds 255 bytes"));
            }
        }
        if self.tunnel.mtu < 576 || self.tunnel.mtu > 65535 {
            return Err(crate::error::Error::config(format!(
                "MTU {} out of range (576-65535)",
                self.tunnel.mtu
            )));
        }
        Ok(())
    }
}

/// SOCKS5 server endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ServerConfig {
    /// Whether username/password auth should be offered
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_server_port(),
            username: None,
            password: None,
        }
    }
}

/// Tunnel/TUN device parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
    #[serde(default = "default_tun_address")]
    pub tun_address: Ipv4Addr,
    #[serde(default = "default_tun_netmask")]
    pub tun_netmask: Ipv4Addr,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,
    #[serde(default)]
    pub block_udp: bool,
}

impl TunnelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tun_name: default_tun_name(),
            tun_address: default_tun_address(),
            tun_netmask: default_tun_netmask(),
            mtu: default_mtu(),
            connect_timeout_secs: default_connect_timeout(),
            udp_timeout_secs: default_udp_timeout(),
            block_udp: false,
        }
    }
}

/// Routing rule snapshot consumed by the route table at tunnel start.
/// CIDR entries use `a.b.c.d/len` notation; a bare address means /32.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouteRulesConfig {
    #[serde(default)]
    pub proxy_hosts: Vec<String>,
    #[serde(default)]
    pub block_hosts: Vec<String>,
    #[serde(default)]
    pub proxy_cidrs: Vec<String>,
    #[serde(default)]
    pub block_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

fn default_server_port() -> u16 {
    1080
}

fn default_tun_name() -> String {
    "tunward0".to_string()
}

fn default_tun_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

fn default_tun_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_mtu() -> u16 {
    1500
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_udp_timeout() -> u64 {
    10
}
