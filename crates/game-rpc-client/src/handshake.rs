//! Connection handshakes for the RPC and stream channels

use crate::connection::Connection;
use game_rpc_core::schema::{
    ConnectionRequest, ConnectionResponse, connection_request, connection_response,
};
use game_rpc_core::{GameRpcError, Result, wire};
use std::fmt;
use tracing::{debug, info};

/// Identifier the server assigns to a client on the RPC channel.
/// The stream channel presents it to bind to the same client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientIdentifier([u8; wire::CLIENT_IDENTIFIER_LENGTH]);

impl ClientIdentifier {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id = bytes.try_into().map_err(|_| {
            GameRpcError::Protocol(format!(
                "Client identifier must be {} bytes, got {}",
                wire::CLIENT_IDENTIFIER_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&b[0..4]),
            hex::encode(&b[4..6]),
            hex::encode(&b[6..8]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

/// Open the RPC channel on a connected socket
pub async fn connect_rpc(connection: &Connection, client_name: &str) -> Result<ClientIdentifier> {
    let request = ConnectionRequest {
        r#type: connection_request::Type::Rpc as i32,
        client_name: wire::truncate_client_name(client_name).to_string(),
        client_identifier: Vec::new(),
    };
    let response = exchange(connection, wire::RPC_HELLO, &request).await?;
    let identifier = ClientIdentifier::from_bytes(&response.client_identifier)?;
    info!("RPC channel open, client identifier {}", identifier);
    Ok(identifier)
}

/// Open the stream channel for a client already connected over RPC
pub async fn connect_stream(connection: &Connection, identifier: &ClientIdentifier) -> Result<()> {
    let request = ConnectionRequest {
        r#type: connection_request::Type::Stream as i32,
        client_name: String::new(),
        client_identifier: identifier.as_bytes().to_vec(),
    };
    exchange(connection, wire::STREAM_HELLO, &request).await?;
    info!("Stream channel open for client {}", identifier);
    Ok(())
}

async fn exchange(
    connection: &Connection,
    hello: &[u8],
    request: &ConnectionRequest,
) -> Result<ConnectionResponse> {
    debug!(
        "Handshake with {}:{} ({})",
        connection.address(),
        connection.port(),
        String::from_utf8_lossy(hello).trim_end_matches('\0')
    );
    connection.send(hello).await?;
    connection.send_message(request).await?;
    let response: ConnectionResponse = connection.receive_message().await?;

    let status = connection_response::Status::try_from(response.status).map_err(|_| {
        GameRpcError::Protocol(format!("Unknown connection status {}", response.status))
    })?;
    if status != connection_response::Status::Ok {
        return Err(GameRpcError::ConnectionRejected {
            status: format!("{:?}", status),
            message: response.message,
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_must_be_sixteen_bytes() {
        assert!(ClientIdentifier::from_bytes(&[0; 16]).is_ok());
        assert!(matches!(
            ClientIdentifier::from_bytes(&[0; 15]),
            Err(GameRpcError::Protocol(_))
        ));
        assert!(ClientIdentifier::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_identifier_guid_form() {
        let bytes: Vec<u8> = (0..16).collect();
        let id = ClientIdentifier::from_bytes(&bytes).unwrap();
        assert_eq!(id.to_string(), "00010203-0405-0607-0809-0a0b0c0d0e0f");
    }

    #[tokio::test]
    async fn test_stream_handshake_with_unknown_identifier_is_rejected() {
        let server = crate::stub::StubServer::start(|_, _| Default::default()).await;
        let connection = Connection::new("127.0.0.1", server.stream_port);
        connection.connect(0, std::time::Duration::ZERO).await.unwrap();

        let stranger = ClientIdentifier::from_bytes(&[0xee; 16]).unwrap();
        match connect_stream(&connection, &stranger).await {
            Err(GameRpcError::ConnectionRejected { status, .. }) => assert_eq!(status, "WrongType"),
            other => panic!("expected a rejected handshake, got {:?}", other),
        }
    }
}
