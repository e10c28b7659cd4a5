//! Error types for the game RPC protocol

use crate::schema;
use std::fmt;
use thiserror::Error;

/// Result type for game RPC operations
pub type Result<T> = std::result::Result<T, GameRpcError>;

/// Game RPC error types
///
/// Errors are `Clone` so that a stream can cache a failure and hand it
/// back on every subsequent read.
#[derive(Debug, Clone, Error)]
pub enum GameRpcError {
    /// DNS resolution, connect, or an unexpectedly closed socket
    #[error("Network error ({address}:{port}): {message}")]
    Network {
        address: String,
        port: u16,
        message: String,
    },

    /// The server executed the call and reported a failure
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// An argument could not be converted to its declared parameter type
    #[error(
        "{service}.{procedure}() argument {index} must be a {expected}, got a {actual}"
    )]
    TypeCoercion {
        service: String,
        procedure: String,
        index: usize,
        expected: String,
        actual: String,
    },

    /// Malformed type strings, frames or values that break the wire contract
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A value could not be encoded against its type
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Bad positional or keyword arguments, detected before any I/O
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The server refused a connection handshake
    #[error("Connection rejected ({status}): {message}")]
    ConnectionRejected { status: String, message: String },

    /// Stream misuse, missing values and removed streams
    #[error("Stream error: {0}")]
    Stream(String),

    /// Unknown service, procedure, property or method
    #[error("Not found: {0}")]
    NotFound(String),
}

impl GameRpcError {
    /// Build a network error for the given endpoint
    pub fn network(address: &str, port: u16, message: impl fmt::Display) -> Self {
        GameRpcError::Network {
            address: address.to_string(),
            port,
            message: message.to_string(),
        }
    }
}

impl From<prost::DecodeError> for GameRpcError {
    fn from(err: prost::DecodeError) -> Self {
        GameRpcError::Protocol(format!("Failed to decode message: {}", err))
    }
}

impl From<prost::EncodeError> for GameRpcError {
    fn from(err: prost::EncodeError) -> Self {
        GameRpcError::Encoding(err.to_string())
    }
}

/// Error reported by the server for a call
///
/// `Display` reproduces the server's description verbatim, followed by
/// the server stack trace when one was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub service: String,
    pub name: String,
    pub description: String,
    pub stack_trace: String,
}

impl RemoteError {
    /// Error with only a description
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            service: String::new(),
            name: String::new(),
            description: description.into(),
            stack_trace: String::new(),
        }
    }

    /// Qualified exception type name, when the server sent one
    pub fn type_name(&self) -> Option<String> {
        if self.service.is_empty() || self.name.is_empty() {
            None
        } else {
            Some(format!("{}.{}", self.service, self.name))
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)?;
        if !self.stack_trace.is_empty() {
            write!(f, "\nServer stack trace:\n{}", self.stack_trace)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

impl From<schema::Error> for RemoteError {
    fn from(err: schema::Error) -> Self {
        Self {
            service: err.service,
            name: err.name,
            description: err.description,
            stack_trace: err.stack_trace,
        }
    }
}
