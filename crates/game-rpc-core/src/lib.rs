//! # game-rpc-core
//!
//! Core types for the game RPC protocol.
//!
//! This crate provides everything that does not touch a socket:
//! - Error taxonomy
//! - Protocol messages
//! - Wire codec for values and length-delimited frames
//! - Type descriptors, interning and argument coercion
//! - Procedure attribute parsing

pub mod attributes;
pub mod error;
pub mod schema;
pub mod types;
pub mod value;
pub mod wire;

pub use attributes::ProcedureKind;
pub use error::{GameRpcError, RemoteError, Result};
pub use types::{CoercionError, TypeDescriptor, TypeRef, TypeStore, ValueKind};
pub use value::{RemoteHandle, Value};
