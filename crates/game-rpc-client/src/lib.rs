//! # game-rpc-client
//!
//! Async client for the game RPC protocol.
//!
//! A [`Client`] holds two TCP channels to the server: the RPC channel,
//! carrying one request/response exchange at a time, and the optional
//! stream channel, on which the server pushes batches of stream results.
//!
//! ```no_run
//! use game_rpc_client::{Call, Client, ConnectConfig};
//!
//! # async fn example() -> game_rpc_core::Result<()> {
//! let client = Client::connect(&ConnectConfig::from_env()?).await?;
//! let status = client.status().await?;
//! println!("server {}", status.version);
//!
//! let stream = client.add_stream(&Call::new("TestService", "get_Counter")).await?;
//! stream.start(true).await?;
//! println!("counter = {}", stream.get()?);
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod client;
pub mod config;
pub mod connection;
pub mod event;
pub mod handshake;
pub mod rpc;
pub mod services;
pub mod stream;

#[cfg(test)]
mod stub;

pub use call::Call;
pub use client::Client;
pub use config::ConnectConfig;
pub use connection::Connection;
pub use event::Event;
pub use handshake::ClientIdentifier;
pub use rpc::{RpcChannel, Signature};
pub use services::{ProcedureEntry, ServiceEntry, ServiceTable};
pub use stream::{CallbackId, Stream, StreamControl, StreamManager};
