//! TCP connection with exact, partial and length-delimited reads
//!
//! A `Connection` may be closed from any task while another task is
//! blocked reading or writing on it; the blocked operation then fails
//! instead of hanging. Once closed, every operation fails and a new
//! `Connection` is needed to reconnect.

use game_rpc_core::{GameRpcError, Result, wire};
use prost::Message;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// A reconnectable TCP socket to one server port
pub struct Connection {
    address: String,
    port: u16,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Flips to `true` exactly once, on close
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Create an unconnected socket wrapper
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: watch::Sender::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve the address and connect, retrying `retries` more times
    /// with `retry_delay` between attempts
    pub async fn connect(&self, retries: u32, retry_delay: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let addrs: Vec<_> = tokio::net::lookup_host((self.address.as_str(), self.port))
            .await
            .map_err(|e| self.error(format!("Failed to resolve address: {}", e)))?
            .collect();
        if addrs.is_empty() {
            return Err(self.error("Address resolved to no endpoints"));
        }

        let mut attempt = 0;
        let stream = loop {
            match connect_any(&addrs).await {
                Ok(stream) => break stream,
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "Connect to {}:{} failed ({}), retrying ({}/{})",
                        self.address, self.port, e, attempt, retries
                    );
                    tokio::time::sleep(retry_delay).await;
                }
                Err(e) => return Err(self.error(format!("Connect failed: {}", e))),
            }
        };

        stream
            .set_nodelay(true)
            .map_err(|e| self.error(format!("Failed to set TCP_NODELAY: {}", e)))?;
        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);

        info!("Connected to {}:{}", self.address, self.port);
        Ok(())
    }

    /// Write all of `data`
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(self.closed_error());
        }
        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = wait_closed(&mut closed) => return Err(self.closed_error()),
        };
        let writer = guard.as_mut().ok_or_else(|| self.not_connected())?;

        let result = tokio::select! {
            result = write_all(writer, data) => {
                result.map_err(|e| self.io_error("Send failed", e))
            }
            _ = wait_closed(&mut closed) => Err(self.closed_error()),
        };
        if result.is_err() {
            guard.take();
        }
        result
    }

    /// Read exactly `length` bytes
    pub async fn receive(&self, length: usize) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(self.closed_error());
        }
        let mut guard = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = wait_closed(&mut closed) => return Err(self.closed_error()),
        };
        let reader = guard.as_mut().ok_or_else(|| self.not_connected())?;

        let mut buf = vec![0u8; length];
        let result = tokio::select! {
            result = reader.read_exact(&mut buf) => {
                result.map(|_| ()).map_err(|e| self.io_error("Receive failed", e))
            }
            _ = wait_closed(&mut closed) => Err(self.closed_error()),
        };
        match result {
            Ok(()) => Ok(buf),
            Err(e) => {
                guard.take();
                Err(e)
            }
        }
    }

    /// Read up to `length` bytes, waiting at most `timeout`.
    ///
    /// Returns an empty buffer when nothing arrived in time.
    pub async fn partial_receive(&self, length: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(self.closed_error());
        }
        let mut guard = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = wait_closed(&mut closed) => return Err(self.closed_error()),
        };
        let reader = guard.as_mut().ok_or_else(|| self.not_connected())?;

        let mut buf = vec![0u8; length];
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, reader.read(&mut buf)) => match result {
                Err(_) => Ok(0),
                Ok(Ok(0)) if length > 0 => Err(self.error("Connection closed by peer")),
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(self.io_error("Receive failed", e)),
            },
            _ = wait_closed(&mut closed) => Err(self.closed_error()),
        };
        match result {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => {
                guard.take();
                Err(e)
            }
        }
    }

    /// Read one `varint(size) || body` frame and return the body.
    ///
    /// The size prefix is collected one byte at a time.
    pub async fn receive_frame(&self) -> Result<Vec<u8>> {
        let mut size_buf = Vec::new();
        loop {
            size_buf.extend(self.receive(1).await?);
            if let Some((size, _)) = wire::decode_size(&size_buf)? {
                return self.receive(size).await;
            }
        }
    }

    /// Send a length-delimited protocol message
    pub async fn send_message<M: Message>(&self, message: &M) -> Result<()> {
        let data = wire::encode_message_delimited(message);
        debug!("Sending {} byte frame to port {}", data.len(), self.port);
        self.send(&data).await
    }

    /// Receive a length-delimited protocol message
    pub async fn receive_message<M: Message + Default>(&self) -> Result<M> {
        let data = self.receive_frame().await?;
        debug!("Received {} byte frame from port {}", data.len(), self.port);
        wire::decode_message(&data)
    }

    /// Close the socket. Safe to call repeatedly and from any task.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // Halves held by an in-flight operation are dropped by that
        // operation once it observes the close signal
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        debug!("Closed connection to {}:{}", self.address, self.port);
    }

    fn error(&self, message: impl std::fmt::Display) -> GameRpcError {
        GameRpcError::network(&self.address, self.port, message)
    }

    fn io_error(&self, context: &str, err: std::io::Error) -> GameRpcError {
        match err.kind() {
            ErrorKind::UnexpectedEof => self.error("Connection closed by peer"),
            _ => self.error(format!("{}: {}", context, err)),
        }
    }

    fn closed_error(&self) -> GameRpcError {
        self.error("Connection closed")
    }

    fn not_connected(&self) -> GameRpcError {
        self.error("Not connected")
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn connect_any(addrs: &[SocketAddr]) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no endpoints")))
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

/// `write_all` that reports a zero-length write as a closed socket
async fn write_all(writer: &mut OwnedWriteHalf, data: &[u8]) -> std::io::Result<()> {
    let mut sent = 0;
    while sent < data.len() {
        let n = writer.write(&data[sent..]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "socket accepted no bytes",
            ));
        }
        sent += n;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn connected_pair() -> (Connection, TcpStream) {
        let (listener, port) = listener().await;
        let conn = Connection::new("127.0.0.1", port);
        let (connected, accepted) = tokio::join!(conn.connect(0, Duration::ZERO), listener.accept());
        assert_ok!(connected);
        (conn, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        let (listener, port) = listener().await;
        drop(listener);

        let conn = Connection::new("127.0.0.1", port);
        let err = conn.connect(1, Duration::from_millis(10)).await.unwrap_err();
        match err {
            GameRpcError::Network { address, port: p, .. } => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!(p, port);
            }
            other => panic!("expected a network error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_network_error() {
        let conn = Connection::new("host.invalid", 50000);
        let result = conn.connect(0, Duration::ZERO).await;
        assert!(matches!(result, Err(GameRpcError::Network { .. })));
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (conn, mut peer) = connected_pair().await;

        assert_ok!(conn.send(b"hello").await);
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").await.unwrap();
        assert_eq!(conn.receive(5).await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn test_partial_receive_times_out_empty() {
        let (conn, mut peer) = connected_pair().await;

        let data = conn
            .partial_receive(4, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(data.is_empty());

        peer.write_all(&[1, 2]).await.unwrap();
        let data = conn
            .partial_receive(4, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!data.is_empty() && data.len() <= 2);
    }

    #[tokio::test]
    async fn test_receive_frame_grows_size_prefix() {
        let (conn, mut peer) = connected_pair().await;

        let body = vec![7u8; 300];
        tokio::spawn(async move {
            // Two byte size prefix delivered in separate writes
            peer.write_all(&[0xac]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            peer.write_all(&[0x02]).await.unwrap();
            peer.write_all(&body).await.unwrap();
            peer
        });

        let frame = conn.receive_frame().await.unwrap();
        assert_eq!(frame.len(), 300);
    }

    #[tokio::test]
    async fn test_peer_close_is_network_error() {
        let (conn, peer) = connected_pair().await;
        drop(peer);
        let result = conn.receive(1).await;
        assert!(matches!(result, Err(GameRpcError::Network { .. })));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_receive() {
        let (conn, _peer) = connected_pair().await;
        let conn = Arc::new(conn);

        let reader = tokio::spawn({
            let conn = conn.clone();
            async move { conn.receive(1).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();

        let result = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("receive did not observe close")
            .unwrap();
        assert_err!(result);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (conn, _peer) = connected_pair().await;
        conn.close();
        conn.close();
        assert!(conn.is_closed());

        assert_err!(conn.send(b"x").await);
        assert_err!(conn.receive(1).await);
        assert_err!(conn.connect(0, Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let conn = Connection::new("127.0.0.1", 1);
        assert_err!(conn.send(b"x").await);
        assert_err!(conn.partial_receive(1, Duration::ZERO).await);
    }
}
