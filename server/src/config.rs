//! Startup parameters for the server
//!
//! Values come from three layers: built-in defaults, an optional TOML file,
//! and command-line flags or `FLAGGI_*` environment variables applied on top
//! by the binary.

use serde::Deserialize;
use shared::BroadcastFormat;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid host address {0:?}")]
    InvalidHost(String),

    #[error("invalid config value: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub tick_interval_ms: u64,
    /// 0 disables rate limiting
    pub rate_limit_ms: u64,
    /// 0 disables staleness eviction
    pub session_timeout_ms: u64,
    pub queue_capacity: usize,
    pub control_queue_capacity: usize,
    pub max_connections: usize,
    pub handshake_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Fixed destination port for broadcasts instead of the last inbound port
    pub response_port: Option<u16>,
    pub broadcast_format: BroadcastFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            tcp_port: 54321,
            udp_port: 54322,
            tick_interval_ms: 16,
            rate_limit_ms: 50,
            session_timeout_ms: 10_000,
            queue_capacity: 1024,
            control_queue_capacity: 256,
            max_connections: 64,
            handshake_timeout_ms: 5_000,
            shutdown_grace_ms: 2_000,
            response_port: None,
            broadcast_format: BroadcastFormat::Positions,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Configuration bound to ephemeral loopback ports, for tests
    pub fn loopback() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST.to_string(),
            tcp_port: 0,
            udp_port: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.host_addr()?;
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive"));
        }
        if self.control_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "control_queue_capacity must be positive",
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive"));
        }
        Ok(())
    }

    pub fn host_addr(&self) -> Result<IpAddr, ConfigError> {
        self.host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.host_addr()?, self.tcp_port))
    }

    pub fn udp_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.host_addr()?, self.udp_port))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rate_limit(&self) -> Option<Duration> {
        (self.rate_limit_ms > 0).then(|| Duration::from_millis(self.rate_limit_ms))
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_ms > 0).then(|| Duration::from_millis(self.session_timeout_ms))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tcp_port, 54321);
        assert_eq!(config.udp_port, 54322);
        assert_eq!(config.tick_interval(), Duration::from_millis(16));
        assert_eq!(config.rate_limit(), Some(Duration::from_millis(50)));
        assert_eq!(config.session_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            udp_port = 6000
            rate_limit_ms = 0
            broadcast_format = "full"
            "#,
        )
        .unwrap();

        assert_eq!(config.udp_port, 6000);
        assert_eq!(config.tcp_port, 54321);
        assert_eq!(config.rate_limit(), None);
        assert_eq!(config.broadcast_format, BroadcastFormat::Full);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            ServerConfig::from_toml_str("tick_rate = 30"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_session_timeout_disables_eviction() {
        let config = ServerConfig {
            session_timeout_ms: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.session_timeout(), None);
    }

    #[test]
    fn test_validation_failures() {
        let bad_host = ServerConfig {
            host: "not-an-ip".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            bad_host.validate(),
            Err(ConfigError::InvalidHost(_))
        ));

        let zero_tick = ServerConfig {
            tick_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(zero_tick.validate(), Err(ConfigError::Invalid(_))));

        let zero_queue = ServerConfig {
            queue_capacity: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(zero_queue.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = ServerConfig::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_loopback_uses_ephemeral_ports() {
        let config = ServerConfig::loopback();
        assert_eq!(config.tcp_addr().unwrap(), "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.udp_addr().unwrap().port(), 0);
    }
}
