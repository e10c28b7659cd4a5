//! Connection settings

use game_rpc_core::{GameRpcError, Result};
use std::time::Duration;

/// Where and how to connect to a server
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectConfig {
    /// Name shown by the server for this client
    pub name: String,
    /// Server host name or IP address
    pub address: String,
    pub rpc_port: u16,
    /// `None` connects without a stream channel
    pub stream_port: Option<u16>,
    /// Extra connect attempts after the first failure
    pub connect_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: "127.0.0.1".to_string(),
            rpc_port: 50000,
            stream_port: Some(50001),
            connect_retries: 10,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl ConnectConfig {
    /// Create config for a server on the given host and ports
    pub fn with_address(address: impl Into<String>, rpc_port: u16, stream_port: Option<u16>) -> Self {
        Self {
            address: address.into(),
            rpc_port,
            stream_port,
            ..Default::default()
        }
    }

    /// Defaults overlaid with `GAME_RPC_NAME`, `GAME_RPC_ADDRESS`,
    /// `GAME_RPC_PORT` and `GAME_RPC_STREAM_PORT` (`0` disables streams)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = lookup("GAME_RPC_NAME") {
            config.name = name;
        }
        if let Some(address) = lookup("GAME_RPC_ADDRESS") {
            config.address = address;
        }
        if let Some(port) = lookup("GAME_RPC_PORT") {
            config.rpc_port = parse_port("GAME_RPC_PORT", &port)?;
        }
        if let Some(port) = lookup("GAME_RPC_STREAM_PORT") {
            config.stream_port = match parse_port("GAME_RPC_STREAM_PORT", &port)? {
                0 => None,
                port => Some(port),
            };
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_port == Some(self.rpc_port) {
            return Err(GameRpcError::InvalidArguments(format!(
                "RPC and stream ports must differ (both {})",
                self.rpc_port
            )));
        }
        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value.trim().parse().map_err(|_| {
        GameRpcError::InvalidArguments(format!("{} must be a port number, got '{}'", key, value))
    })
}
