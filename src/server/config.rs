//! Server configuration.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::ProxySecret;
use crate::error::{Error, Result};
use crate::server::policy::{PolicyConfig, DEFAULT_MAX_CONNECTIONS_PER_IP};
use crate::server::rate_limit::RateLimit;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8443;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Proxy secret shared with clients
    pub secret: ProxySecret,
    /// Time allowed for the client preamble
    pub handshake_timeout: Duration,
    /// Time allowed for connecting to the remote endpoint
    pub connect_timeout: Duration,
    /// Upper bound on a whole session, accept to close
    pub connection_timeout: Duration,
    /// Concurrent connections allowed per IP
    pub max_connections_per_ip: u32,
    /// Connection rate limit per IP
    pub rate_limit: RateLimit,
    /// When non-empty only these IPs are admitted
    pub allowlist: Vec<IpAddr>,
    /// Always rejected
    pub denylist: Vec<IpAddr>,
    /// Idle age after which client records are purged
    pub client_max_age: Duration,
    /// Interval of the maintenance task
    pub cleanup_interval: Duration,
    /// Optional `proxy_for` overlay file for the endpoint table
    pub endpoint_overlay: Option<PathBuf>,
}

impl ServerConfig {
    /// Configuration with default settings and the given secret.
    pub fn new(secret: ProxySecret) -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            listen_port: DEFAULT_PORT,
            secret,
            handshake_timeout: crate::HANDSHAKE_TIMEOUT,
            connect_timeout: crate::CONNECT_TIMEOUT,
            connection_timeout: crate::CONNECTION_TIMEOUT,
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            rate_limit: RateLimit::default(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
            client_max_age: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(300),
            endpoint_overlay: None,
        }
    }

    /// Configuration with default settings and a fresh random secret.
    pub fn new_random() -> Self {
        Self::new(ProxySecret::random())
    }

    /// Load a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let file: ServerConfigFile = toml::from_str(&content)
            .map_err(|e| Error::config(format!("invalid config {}: {}", path.display(), e)))?;
        file.to_config()
    }

    /// Apply `MTPROXY_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MTPROXY_HOST") {
            self.listen_addr = host;
        }
        if let Some(port) = lookup("MTPROXY_PORT") {
            self.listen_port = port
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("invalid MTPROXY_PORT {:?}: {}", port, e)))?;
        }
        if let Some(secret) = lookup("MTPROXY_SECRET") {
            self.secret = parse_secret(&secret)?;
        }
        if let Some(timeout) = lookup("MTPROXY_TIMEOUT") {
            let secs: u64 = timeout.trim().parse().map_err(|e| {
                Error::config(format!("invalid MTPROXY_TIMEOUT {:?}: {}", timeout, e))
            })?;
            self.connection_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Admission policy settings.
    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            allowlist: self.allowlist.clone(),
            denylist: self.denylist.clone(),
            max_connections_per_ip: self.max_connections_per_ip,
            rate_limit: self.rate_limit,
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.contains(':') {
            format!("[{}]:{}", self.listen_addr, self.listen_port)
        } else {
            format!("{}:{}", self.listen_addr, self.listen_port)
        }
    }

    /// Link clients use to add this proxy.
    pub fn proxy_link(&self, host: &str) -> String {
        format!(
            "https://t.me/proxy?server={}&port={}&secret={}",
            host,
            self.listen_port,
            self.secret.to_hex()
        )
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        if self.listen_port == 0 {
            return Err(Error::config("listen_port must be between 1 and 65535"));
        }
        for (name, value) in [
            ("handshake_timeout", self.handshake_timeout),
            ("connect_timeout", self.connect_timeout),
            ("connection_timeout", self.connection_timeout),
            ("cleanup_interval", self.cleanup_interval),
            ("rate_limit_window", self.rate_limit.window),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be non-zero", name)));
            }
        }
        if self.max_connections_per_ip == 0 {
            return Err(Error::config("max_connections_per_ip must be at least 1"));
        }
        if self.rate_limit.max_connections == 0 {
            return Err(Error::config("rate_limit must be at least 1"));
        }
        Ok(())
    }
}

fn parse_secret(hex: &str) -> Result<ProxySecret> {
    ProxySecret::from_hex(hex).map_err(|e| Error::config(format!("invalid secret: {}", e)))
}

fn parse_ips(field: &str, values: &[String]) -> Result<Vec<IpAddr>> {
    values
        .iter()
        .map(|s| {
            s.trim()
                .parse()
                .map_err(|e| Error::config(format!("invalid address {:?} in {}: {}", s, field, e)))
        })
        .collect()
}

/// Configuration file format for serialization.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfigFile {
    /// Listener and timeouts
    pub server: ServerSection,
    /// Admission policy
    pub security: SecuritySection,
}

/// `[server]` section.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Proxy secret (32 hex characters)
    pub secret: Option<String>,
    /// Session timeout (seconds)
    pub timeout: u64,
    /// Handshake timeout (seconds)
    pub handshake_timeout: u64,
    /// Remote connect timeout (seconds)
    pub connect_timeout: u64,
    /// Maintenance interval (seconds)
    pub cleanup_interval: u64,
    /// Client record idle age (seconds)
    pub client_max_age: u64,
    /// Endpoint overlay file
    pub endpoint_overlay: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            secret: None,
            timeout: crate::CONNECTION_TIMEOUT.as_secs(),
            handshake_timeout: crate::HANDSHAKE_TIMEOUT.as_secs(),
            connect_timeout: crate::CONNECT_TIMEOUT.as_secs(),
            cleanup_interval: 300,
            client_max_age: 24 * 3600,
            endpoint_overlay: None,
        }
    }
}

/// `[security]` section.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Allow list; empty admits everyone not denied
    pub allowed_ips: Vec<String>,
    /// Deny list
    pub banned_ips: Vec<String>,
    /// Connections per window per IP
    pub rate_limit: u32,
    /// Rate window (seconds)
    pub rate_limit_window: u64,
    /// Concurrent connections per IP
    pub max_connections_per_ip: u32,
}

impl Default for SecuritySection {
    fn default() -> Self {
        let limit = RateLimit::default();
        Self {
            allowed_ips: Vec::new(),
            banned_ips: Vec::new(),
            rate_limit: limit.max_connections,
            rate_limit_window: limit.window.as_secs(),
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
        }
    }
}

impl ServerConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        let secret = match &self.server.secret {
            Some(hex) => parse_secret(hex)?,
            None => return Err(Error::config("server.secret is required")),
        };

        let config = ServerConfig {
            listen_addr: self.server.host.clone(),
            listen_port: self.server.port,
            secret,
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout),
            connect_timeout: Duration::from_secs(self.server.connect_timeout),
            connection_timeout: Duration::from_secs(self.server.timeout),
            max_connections_per_ip: self.security.max_connections_per_ip,
            rate_limit: RateLimit::new(
                self.security.rate_limit,
                Duration::from_secs(self.security.rate_limit_window),
            ),
            allowlist: parse_ips("security.allowed_ips", &self.security.allowed_ips)?,
            denylist: parse_ips("security.banned_ips", &self.security.banned_ips)?,
            client_max_age: Duration::from_secs(self.server.client_max_age),
            cleanup_interval: Duration::from_secs(self.server.cleanup_interval),
            endpoint_overlay: self.server.endpoint_overlay.as_ref().map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            server: ServerSection {
                host: config.listen_addr.clone(),
                port: config.listen_port,
                secret: Some(config.secret.to_hex()),
                timeout: config.connection_timeout.as_secs(),
                handshake_timeout: config.handshake_timeout.as_secs(),
                connect_timeout: config.connect_timeout.as_secs(),
                cleanup_interval: config.cleanup_interval.as_secs(),
                client_max_age: config.client_max_age.as_secs(),
                endpoint_overlay: config
                    .endpoint_overlay
                    .as_ref()
                    .map(|p| p.display().to_string()),
            },
            security: SecuritySection {
                allowed_ips: config.allowlist.iter().map(|ip| ip.to_string()).collect(),
                banned_ips: config.denylist.iter().map(|ip| ip.to_string()).collect(),
                rate_limit: config.rate_limit.max_connections,
                rate_limit_window: config.rate_limit.window.as_secs(),
                max_connections_per_ip: config.max_connections_per_ip,
            },
        }
    }
}
