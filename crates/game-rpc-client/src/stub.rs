//! Loopback server speaking both channels of the protocol, for tests

use crate::services::tests::test_services;
use game_rpc_core::schema::{
    self, ConnectionRequest, ConnectionResponse, Request, Response, StreamUpdate,
    connection_response,
};
use game_rpc_core::wire;
use prost::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub(crate) const IDENTIFIER: [u8; 16] = [
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e,
    0x1f,
];

pub(crate) type Handler = Arc<dyn Fn(&Request, &StubPush) -> Response + Send + Sync>;

/// Sends stream updates to the connected stream channel
#[derive(Clone)]
pub(crate) struct StubPush {
    tx: mpsc::UnboundedSender<StreamUpdate>,
}

impl StubPush {
    pub(crate) fn push(&self, update: StreamUpdate) {
        let _ = self.tx.send(update);
    }
}

pub(crate) struct StubServer {
    pub(crate) rpc_port: u16,
    pub(crate) stream_port: u16,
    pub(crate) push: StubPush,
    requests: Arc<Mutex<Vec<Request>>>,
    /// Stream handshakes seen, by presented identifier
    pub(crate) stream_clients: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl StubServer {
    /// Serve `KRPC.GetServices` from the test table and `KRPC.AddStream`
    /// with one id per distinct call; everything else goes to `handler`
    pub(crate) async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request, &StubPush) -> Response + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let rpc = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rpc_port = rpc.local_addr().unwrap().port();
        let stream_port = stream.local_addr().unwrap().port();

        let (tx, rx) = mpsc::unbounded_channel();
        let push = StubPush { tx };
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stream_clients = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(serve_rpc(rpc, handler, push.clone(), requests.clone()));
        tokio::spawn(serve_stream(stream, rx, stream_clients.clone()));

        Self {
            rpc_port,
            stream_port,
            push,
            requests,
            stream_clients,
        }
    }

    /// `service.procedure` of every request received so far
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| format!("{}.{}", r.service, r.procedure))
            .collect()
    }
}

pub(crate) fn value_response(value: Vec<u8>) -> Response {
    Response {
        error: None,
        return_value: Some(value),
    }
}

pub(crate) fn error_response(name: &str, description: &str, stack_trace: &str) -> Response {
    Response {
        error: Some(schema::Error {
            service: "TestService".into(),
            name: name.into(),
            description: description.into(),
            stack_trace: stack_trace.into(),
        }),
        return_value: None,
    }
}

/// Stream id carried by a `KRPC.StartStream`/`RemoveStream` request
pub(crate) fn stream_id(request: &Request) -> u64 {
    let mut data = &request.arguments[0].value[..];
    prost::encoding::decode_varint(&mut data).unwrap()
}

async fn serve_rpc(
    listener: TcpListener,
    handler: Handler,
    push: StubPush,
    requests: Arc<Mutex<Vec<Request>>>,
) {
    let (mut socket, _) = listener.accept().await.unwrap();
    handshake(&mut socket, wire::RPC_HELLO).await;
    write_frame(
        &mut socket,
        &ConnectionResponse {
            status: connection_response::Status::Ok as i32,
            message: String::new(),
            client_identifier: IDENTIFIER.to_vec(),
        },
    )
    .await;

    let mut stream_ids: HashMap<Vec<u8>, u64> = HashMap::new();
    while let Some(frame) = read_frame(&mut socket).await {
        let request = Request::decode(frame.as_slice()).unwrap();
        requests.lock().unwrap().push(request.clone());
        let response = match (request.service.as_str(), request.procedure.as_str()) {
            ("KRPC", "GetServices") => value_response(test_services().encode_to_vec()),
            ("KRPC", "AddStream") => {
                let next = stream_ids.len() as u64 + 1;
                let id = *stream_ids
                    .entry(request.arguments[0].value.clone())
                    .or_insert(next);
                value_response(schema::Stream { id }.encode_to_vec())
            }
            _ => handler(&request, &push),
        };
        write_frame(&mut socket, &response).await;
    }
}

async fn serve_stream(
    listener: TcpListener,
    mut updates: mpsc::UnboundedReceiver<StreamUpdate>,
    clients: Arc<Mutex<Vec<Vec<u8>>>>,
) {
    let (mut socket, _) = listener.accept().await.unwrap();
    let request = handshake(&mut socket, wire::STREAM_HELLO).await;
    clients.lock().unwrap().push(request.client_identifier.clone());
    let status = if request.client_identifier == IDENTIFIER {
        connection_response::Status::Ok
    } else {
        connection_response::Status::WrongType
    };
    write_frame(
        &mut socket,
        &ConnectionResponse {
            status: status as i32,
            message: String::new(),
            client_identifier: Vec::new(),
        },
    )
    .await;

    while let Some(update) = updates.recv().await {
        if socket
            .write_all(&wire::encode_message_delimited(&update))
            .await
            .is_err()
        {
            break;
        }
    }
}

async fn handshake(socket: &mut TcpStream, hello: &[u8]) -> ConnectionRequest {
    let mut received = vec![0u8; hello.len()];
    socket.read_exact(&mut received).await.unwrap();
    assert_eq!(received, hello);
    let frame = read_frame(socket).await.unwrap();
    ConnectionRequest::decode(frame.as_slice()).unwrap()
}

pub(crate) async fn read_frame(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut size = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match socket.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => size.push(byte[0]),
        }
        if let Some((length, _)) = wire::decode_size(&size).unwrap() {
            let mut body = vec![0u8; length];
            socket.read_exact(&mut body).await.ok()?;
            return Some(body);
        }
    }
}

pub(crate) async fn write_frame<M: Message>(socket: &mut TcpStream, message: &M) {
    let _ = socket
        .write_all(&wire::encode_message_delimited(message))
        .await;
}
