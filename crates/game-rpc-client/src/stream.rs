//! Streams: server-pushed results of a repeated procedure call
//!
//! A stream is registered over the RPC channel and its results arrive as
//! batches on the separate stream channel. One background task reads
//! those batches and stores each result in the subscription it belongs
//! to, waking waiters and running callbacks. Reading a stream's value
//! never touches the network.

use crate::connection::Connection;
use crate::rpc::decode_response;
use async_trait::async_trait;
use game_rpc_core::schema::{Request, StreamUpdate};
use game_rpc_core::{GameRpcError, Result, TypeRef, Value, wire};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often the updater checks its stop signal while idle
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Callback receiving each new value (or error) of a stream
pub type StreamCallback = Arc<dyn Fn(&Result<Value>) + Send + Sync>;
/// Callback run after each processed batch of updates
pub type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle for removing a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Server-side stream management, implemented by the RPC channel
#[async_trait]
pub trait StreamControl: Send + Sync {
    /// Register `call` as a stream and return its id
    async fn add_stream(&self, call: &Request, start: bool) -> Result<u64>;
    async fn start_stream(&self, id: u64) -> Result<()>;
    async fn remove_stream(&self, id: u64) -> Result<()>;
    /// Limit updates to `rate` Hz; `0` sends every update
    async fn set_stream_rate(&self, id: u64, rate: f32) -> Result<()>;
}

struct Subscription {
    id: u64,
    return_type: TypeRef,
    started: AtomicBool,
    removed: AtomicBool,
    rate: Mutex<f32>,
    /// `None` until the first update arrives
    value: watch::Sender<Option<Result<Value>>>,
    callbacks: Mutex<Vec<(CallbackId, StreamCallback)>>,
}

impl Subscription {
    fn new(id: u64, return_type: TypeRef) -> Self {
        Self {
            id,
            return_type,
            started: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            rate: Mutex::new(0.0),
            value: watch::Sender::new(None),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn callbacks(&self) -> Vec<StreamCallback> {
        lock(&self.callbacks)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }
}

/// Registry of subscriptions by stream id
pub(crate) struct Registry {
    control: Arc<dyn StreamControl>,
    runtime: Handle,
    streams: Mutex<HashMap<u64, Arc<Subscription>>>,
    /// Count of processed batches
    batches: watch::Sender<u64>,
    update_callbacks: Mutex<Vec<(CallbackId, UpdateCallback)>>,
    next_callback: AtomicU64,
}

impl Registry {
    /// Must be called from within a tokio runtime
    pub(crate) fn new(control: Arc<dyn StreamControl>) -> Arc<Self> {
        Arc::new(Self {
            control,
            runtime: Handle::current(),
            streams: Mutex::new(HashMap::new()),
            batches: watch::Sender::new(0),
            update_callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(1),
        })
    }

    async fn add_stream(self: &Arc<Self>, call: &Request, return_type: TypeRef) -> Result<Stream> {
        let id = self.control.add_stream(call, false).await?;
        let subscription = {
            let mut streams = lock(&self.streams);
            streams
                .entry(id)
                .or_insert_with(|| {
                    debug!(
                        "Registered stream {} for {}.{}",
                        id, call.service, call.procedure
                    );
                    Arc::new(Subscription::new(id, return_type))
                })
                .clone()
        };
        Ok(Stream {
            registry: self.clone(),
            subscription,
        })
    }

    fn get(self: &Arc<Self>, id: u64) -> Option<Stream> {
        let subscription = lock(&self.streams).get(&id)?.clone();
        Some(Stream {
            registry: self.clone(),
            subscription,
        })
    }

    /// Stream with a server-assigned `id`, registering it locally if this
    /// client has not seen it. Used for streams the server created itself.
    fn get_stream(self: &Arc<Self>, id: u64, return_type: TypeRef) -> Stream {
        let subscription = lock(&self.streams)
            .entry(id)
            .or_insert_with(|| {
                debug!("Registered server-created stream {}", id);
                Arc::new(Subscription::new(id, return_type))
            })
            .clone();
        Stream {
            registry: self.clone(),
            subscription,
        }
    }

    fn len(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Drop the local record, then tell the server. Removing twice is a no-op.
    async fn remove(&self, id: u64) -> Result<()> {
        let removed = lock(&self.streams).remove(&id);
        let Some(subscription) = removed else {
            return Ok(());
        };
        subscription.removed.store(true, Ordering::SeqCst);
        subscription.value.send_replace(Some(Err(removed_error())));
        debug!("Removed stream {}", id);
        self.control.remove_stream(id).await
    }

    /// Store each result of a batch in its subscription, then notify
    fn apply_update(&self, update: StreamUpdate) {
        let mut delivered = Vec::with_capacity(update.results.len());
        {
            let streams = lock(&self.streams);
            for result in update.results {
                let Some(subscription) = streams.get(&result.id) else {
                    debug!("Discarding update for unknown stream {}", result.id);
                    continue;
                };
                let value = match result.result {
                    Some(response) => decode_response(response, Some(&*subscription.return_type))
                        .map(|value| value.unwrap_or(Value::Null)),
                    None => Err(GameRpcError::Protocol(format!(
                        "Update for stream {} carries no result",
                        result.id
                    ))),
                };
                subscription.value.send_replace(Some(value.clone()));
                delivered.push((subscription.clone(), value));
            }
        }

        for (subscription, value) in &delivered {
            for callback in subscription.callbacks() {
                callback(value);
            }
        }

        self.batches.send_modify(|count| *count += 1);
        let callbacks: Vec<UpdateCallback> = lock(&self.update_callbacks)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    /// Wake anyone still waiting for a first value after the updater dies
    fn fail_pending(&self, err: &GameRpcError) {
        for subscription in lock(&self.streams).values() {
            subscription.value.send_if_modified(|value| {
                if value.is_none() {
                    *value = Some(Err(err.clone()));
                    true
                } else {
                    false
                }
            });
        }
    }

    fn next_callback_id(&self) -> CallbackId {
        CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle to a stream. Clones share the same subscription.
#[derive(Clone)]
pub struct Stream {
    registry: Arc<Registry>,
    subscription: Arc<Subscription>,
}

impl Stream {
    /// Server-assigned stream id
    pub fn id(&self) -> u64 {
        self.subscription.id
    }

    pub fn return_type(&self) -> &TypeRef {
        &self.subscription.return_type
    }

    pub fn started(&self) -> bool {
        self.subscription.started.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.subscription.removed.load(Ordering::SeqCst)
    }

    /// Latest value of the stream.
    ///
    /// Starts the stream in the background if needed. Returns the cached
    /// error when the last update was a failure, and an error if no value
    /// has arrived yet.
    pub fn get(&self) -> Result<Value> {
        if self.is_removed() {
            return Err(removed_error());
        }
        if !self.subscription.started.swap(true, Ordering::SeqCst) {
            let control = self.registry.control.clone();
            let subscription = self.subscription.clone();
            self.registry.runtime.spawn(async move {
                if let Err(e) = control.start_stream(subscription.id).await {
                    warn!("Failed to start stream {}: {}", subscription.id, e);
                    subscription.started.store(false, Ordering::SeqCst);
                }
            });
        }
        match &*self.subscription.value.borrow() {
            Some(value) => value.clone(),
            None => Err(GameRpcError::Stream(format!(
                "Stream {} has no value",
                self.subscription.id
            ))),
        }
    }

    /// Start the stream. With `wait`, return only once the first value
    /// has arrived.
    pub async fn start(&self, wait: bool) -> Result<()> {
        if self.is_removed() {
            return Err(removed_error());
        }
        if !self.subscription.started.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.registry.control.start_stream(self.id()).await {
                self.subscription.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
            debug!("Started stream {}", self.id());
        }
        if wait {
            let mut value = self.subscription.value.subscribe();
            value
                .wait_for(|v| v.is_some())
                .await
                .map(|_| ())
                .map_err(|_| GameRpcError::Stream("Stream manager has shut down".to_string()))?;
        }
        Ok(())
    }

    /// Wait for the next update after this call, up to `timeout`.
    ///
    /// Returns normally on timeout; compare values to tell the two apart.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.is_removed() {
            return Err(removed_error());
        }
        let mut value = self.subscription.value.subscribe();
        value.borrow_and_update();
        match timeout {
            Some(timeout) => {
                let _ = tokio::time::timeout(timeout, value.changed()).await;
            }
            None => {
                let _ = value.changed().await;
            }
        }
        Ok(())
    }

    /// Receiver of the cached value, for waiters that need more than one
    /// change
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Result<Value>>> {
        self.subscription.value.subscribe()
    }

    /// Limit the update rate in Hz; `0` delivers every update
    pub async fn set_rate(&self, rate: f32) -> Result<()> {
        self.registry.control.set_stream_rate(self.id(), rate).await?;
        *lock(&self.subscription.rate) = rate;
        Ok(())
    }

    /// Last rate set with [`Stream::set_rate`]
    pub fn rate(&self) -> f32 {
        *lock(&self.subscription.rate)
    }

    /// Run `callback` with every new value, in delivery order
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Result<Value>) + Send + Sync + 'static,
    {
        let id = self.registry.next_callback_id();
        lock(&self.subscription.callbacks).push((id, Arc::new(callback)));
        id
    }

    /// Returns whether the callback was registered
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = lock(&self.subscription.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        callbacks.len() != before
    }

    /// Remove the stream. Later reads fail; removing again does nothing.
    pub async fn remove(&self) -> Result<()> {
        self.registry.remove(self.id()).await
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.subscription.id)
            .field("return_type", &self.subscription.return_type.to_string())
            .field("started", &self.started())
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Owns the stream channel and its background updater
pub struct StreamManager {
    registry: Arc<Registry>,
    connection: Arc<Connection>,
    stop: watch::Sender<bool>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl StreamManager {
    /// Start the updater on a connected stream channel.
    /// Must be called from within a tokio runtime.
    pub fn new(control: Arc<dyn StreamControl>, connection: Arc<Connection>) -> Self {
        let registry = Registry::new(control);
        let (stop, stop_rx) = watch::channel(false);
        let updater = tokio::spawn(update_task(
            registry.clone(),
            connection.clone(),
            stop_rx,
        ));
        Self {
            registry,
            connection,
            stop,
            updater: Mutex::new(Some(updater)),
        }
    }

    /// Register a stream of `call`, whose results have type `return_type`.
    ///
    /// The server returns the same id for identical calls, in which case
    /// the existing subscription is shared.
    pub async fn add_stream(&self, call: &Request, return_type: TypeRef) -> Result<Stream> {
        self.registry.add_stream(call, return_type).await
    }

    /// Stream with the given id, if registered
    pub fn get(&self, id: u64) -> Option<Stream> {
        self.registry.get(id)
    }

    /// Stream with a server-assigned `id`, creating the local
    /// subscription if it does not exist yet
    pub fn get_stream(&self, id: u64, return_type: TypeRef) -> Stream {
        self.registry.get_stream(id, return_type)
    }

    /// Number of registered streams
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `callback` after every processed batch
    pub fn add_update_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.registry.next_callback_id();
        lock(&self.registry.update_callbacks).push((id, Arc::new(callback)));
        id
    }

    pub fn remove_update_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = lock(&self.registry.update_callbacks);
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        callbacks.len() != before
    }

    /// Wait for the next processed batch, up to `timeout`
    pub async fn wait_for_update(&self, timeout: Option<Duration>) {
        let mut batches = self.registry.batches.subscribe();
        batches.borrow_and_update();
        match timeout {
            Some(timeout) => {
                let _ = tokio::time::timeout(timeout, batches.changed()).await;
            }
            None => {
                let _ = batches.changed().await;
            }
        }
    }

    /// Stop the updater and close the stream channel
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        self.connection.close();
        let updater = lock(&self.updater).take();
        if let Some(updater) = updater {
            if let Err(e) = updater.await {
                warn!("Stream updater panicked: {}", e);
            }
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        self.connection.close();
    }
}

async fn update_task(
    registry: Arc<Registry>,
    connection: Arc<Connection>,
    mut stop: watch::Receiver<bool>,
) {
    info!("Stream updater started");
    loop {
        match read_update(&connection, &mut stop).await {
            Ok(Some(update)) => registry.apply_update(update),
            Ok(None) => break,
            Err(e) => {
                if !*stop.borrow() {
                    error!("Stream updater failed: {}", e);
                    registry.fail_pending(&e);
                }
                break;
            }
        }
    }
    connection.close();
    info!("Stream updater stopped");
}

/// Read one update batch, checking `stop` between size bytes.
/// Returns `None` once stopped.
async fn read_update(
    connection: &Connection,
    stop: &mut watch::Receiver<bool>,
) -> Result<Option<StreamUpdate>> {
    let mut size_buf = Vec::new();
    let size = loop {
        if *stop.borrow_and_update() {
            return Ok(None);
        }
        size_buf.extend(connection.partial_receive(1, POLL_INTERVAL).await?);
        if let Some((size, _)) = wire::decode_size(&size_buf)? {
            break size;
        }
    };
    let body = connection.receive(size).await?;
    Ok(Some(wire::decode_message(&body)?))
}

fn removed_error() -> GameRpcError {
    GameRpcError::Stream("Stream has been removed".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
