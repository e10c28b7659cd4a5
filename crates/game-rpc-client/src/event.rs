//! Events: server-side conditions observed through a `bool` stream
//!
//! A procedure returning `KRPC.Event` hands back the id of a stream the
//! server has already created. The stream's value turns `true` when the
//! condition is met.

use crate::stream::{CallbackId, Stream};
use game_rpc_core::{GameRpcError, Result, Value};
use std::time::Duration;
use tracing::debug;

/// Handle to a server-side event
#[derive(Clone, Debug)]
pub struct Event {
    stream: Stream,
}

impl Event {
    pub(crate) fn new(stream: Stream) -> Self {
        Self { stream }
    }

    /// The underlying `bool` stream
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Start receiving updates without waiting for one
    pub async fn start(&self) -> Result<()> {
        self.stream.start(false).await
    }

    /// Wait until the event fires after this call, up to `timeout`.
    ///
    /// Starts the event if needed. A value that was already `true` before
    /// the call does not count. Returns `Ok(false)` on timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut value = self.stream.subscribe();
        value.borrow_and_update();
        if self.stream.is_removed() {
            return Err(GameRpcError::Stream("Event has been removed".to_string()));
        }
        if !self.stream.started() {
            self.stream.start(false).await?;
        }

        let id = self.stream.id();
        let fired = async move {
            loop {
                value.changed().await.map_err(|_| {
                    GameRpcError::Stream("Stream manager has shut down".to_string())
                })?;
                match &*value.borrow_and_update() {
                    Some(Ok(Value::Bool(true))) => return Ok(()),
                    Some(Err(e)) => return Err(e.clone()),
                    _ => {}
                }
            }
        };
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fired).await {
                Ok(result) => result.map(|_| true),
                Err(_) => {
                    debug!("Event {} did not fire within {:?}", id, timeout);
                    Ok(false)
                }
            },
            None => fired.await.map(|_| true),
        }
    }

    /// Run `callback` each time the event fires
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.stream.add_callback(move |value: &Result<Value>| {
            if matches!(value, Ok(Value::Bool(true))) {
                callback();
            }
        })
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.stream.remove_callback(id)
    }

    /// Remove the event's stream. Waiters fail; removing again does nothing.
    pub async fn remove(&self) -> Result<()> {
        self.stream.remove().await
    }
}
