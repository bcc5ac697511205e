use crate::error::{Result, TrailError};
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Dial timeout in seconds for origins and CONNECT targets
    pub connect_timeout: u64,
    /// Forward exchange timeout in seconds, 0 disables it
    pub request_timeout: u64,
    /// Tunnel lifetime bound in seconds, 0 means tunnels live until a side closes
    pub tunnel_timeout: u64,
}

impl ProxyServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.request_timeout)
    }

    pub fn tunnel_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.tunnel_timeout)
    }
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            connect_timeout: 10,
            request_timeout: 30,
            tunnel_timeout: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: String,
    /// Maximum connections in pool
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl LogConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PROXY_PORT", "8080").parse().map_err(|_| {
                    TrailError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                connect_timeout: parse_secs("PROXY_CONNECT_TIMEOUT", "10")?,
                request_timeout: parse_secs("PROXY_REQUEST_TIMEOUT", "30")?,
                tunnel_timeout: parse_secs("PROXY_TUNNEL_TIMEOUT", "0")?,
            },
            database: DatabaseConfig {
                path: get_env_or("DB_PATH", "./requests.db"),
                max_connections: get_env_or("DB_MAX_CONNECTIONS", "5")
                    .parse()
                    .map_err(|_| {
                        TrailError::InvalidConfig("DB_MAX_CONNECTIONS must be a valid number".into())
                    })?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the SQLite connection URL
    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.database.path)
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

fn parse_secs(key: &str, default: &str) -> Result<u64> {
    get_env_or(key, default)
        .parse()
        .map_err(|_| TrailError::InvalidConfig(format!("{} must be a number of seconds", key)))
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
