//! Protocol messages exchanged with the server
//!
//! Every message travels as a length-delimited protocol buffer:
//! `varint(byte-length) || message-bytes`.

/// Sent after the hello magic to open the RPC or stream channel
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionRequest {
    #[prost(enumeration = "connection_request::Type", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub client_name: String,
    #[prost(bytes = "vec", tag = "3")]
    pub client_identifier: Vec<u8>,
}

pub mod connection_request {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Rpc = 0,
        Stream = 1,
    }
}

/// Server reply to a [`ConnectionRequest`]
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionResponse {
    #[prost(enumeration = "connection_response::Status", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(bytes = "vec", tag = "3")]
    pub client_identifier: Vec<u8>,
}

pub mod connection_response {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Ok = 0,
        MalformedMessage = 1,
        Timeout = 2,
        WrongType = 3,
    }
}

/// A single procedure call
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub procedure: String,
    #[prost(message, repeated, tag = "3")]
    pub arguments: Vec<Argument>,
}

/// An encoded argument and the parameter position it fills
#[derive(Clone, PartialEq, prost::Message)]
pub struct Argument {
    #[prost(uint32, tag = "1")]
    pub position: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Result of a call: an error, a return value, or neither for void
#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(message, optional, tag = "1")]
    pub error: Option<Error>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub return_value: Option<Vec<u8>>,
}

/// Error raised by the server while executing a call
#[derive(Clone, PartialEq, prost::Message)]
pub struct Error {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(string, tag = "4")]
    pub stack_trace: String,
}

/// Identifier returned by `KRPC.AddStream`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Stream {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

/// A server-side condition, delivered as a `bool` stream that turns
/// `true` when the condition holds
#[derive(Clone, PartialEq, prost::Message)]
pub struct Event {
    #[prost(message, optional, tag = "1")]
    pub stream: Option<Stream>,
}

/// One batch of stream results pushed on the stream channel
#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamUpdate {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<StreamResult>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamResult {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, optional, tag = "2")]
    pub result: Option<Response>,
}

/// Server status returned by `KRPC.GetStatus`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Status {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(uint64, tag = "2")]
    pub bytes_read: u64,
    #[prost(uint64, tag = "3")]
    pub bytes_written: u64,
    #[prost(float, tag = "4")]
    pub bytes_read_rate: f32,
    #[prost(float, tag = "5")]
    pub bytes_written_rate: f32,
    #[prost(uint64, tag = "6")]
    pub rpcs_executed: u64,
    #[prost(float, tag = "7")]
    pub rpc_rate: f32,
    #[prost(uint32, tag = "8")]
    pub stream_rpcs: u32,
    #[prost(uint64, tag = "9")]
    pub stream_rpcs_executed: u64,
    #[prost(float, tag = "10")]
    pub stream_rpc_rate: f32,
}

/// Introspection result of `KRPC.GetServices`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Services {
    #[prost(message, repeated, tag = "1")]
    pub services: Vec<Service>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Service {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub procedures: Vec<Procedure>,
    #[prost(message, repeated, tag = "3")]
    pub classes: Vec<Class>,
    #[prost(message, repeated, tag = "4")]
    pub enumerations: Vec<Enumeration>,
    #[prost(string, tag = "5")]
    pub documentation: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Procedure {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub parameters: Vec<Parameter>,
    #[prost(string, optional, tag = "3")]
    pub return_type: Option<String>,
    #[prost(string, repeated, tag = "4")]
    pub attributes: Vec<String>,
    #[prost(string, tag = "5")]
    pub documentation: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Parameter {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub default_argument: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Class {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub documentation: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Enumeration {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub values: Vec<EnumerationValue>,
    #[prost(string, tag = "3")]
    pub documentation: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EnumerationValue {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub value: i32,
    #[prost(string, tag = "3")]
    pub documentation: String,
}

/// Container messages used by the collection encodings
#[derive(Clone, PartialEq, prost::Message)]
pub struct List {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub items: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Set {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub items: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Tuple {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub items: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Dictionary {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<DictionaryEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DictionaryEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Message type names the type system resolves to [`crate::TypeDescriptor::Message`]
pub const MESSAGE_TYPES: &[&str] = &[
    "KRPC.ConnectionRequest",
    "KRPC.ConnectionResponse",
    "KRPC.Request",
    "KRPC.Argument",
    "KRPC.Response",
    "KRPC.Error",
    "KRPC.Stream",
    "KRPC.Event",
    "KRPC.StreamUpdate",
    "KRPC.StreamResult",
    "KRPC.Status",
    "KRPC.Services",
    "KRPC.Service",
    "KRPC.Procedure",
    "KRPC.Parameter",
    "KRPC.Class",
    "KRPC.Enumeration",
    "KRPC.EnumerationValue",
    "KRPC.List",
    "KRPC.Set",
    "KRPC.Tuple",
    "KRPC.Dictionary",
    "KRPC.DictionaryEntry",
];

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_event_carries_its_stream() {
        let event = Event {
            stream: Some(Stream { id: 300 }),
        };
        let decoded = Event::decode(event.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.stream.map(|s| s.id), Some(300));
        assert!(MESSAGE_TYPES.contains(&"KRPC.Event"));
    }

    #[test]
    fn test_void_response_has_no_fields() {
        let response = Response::default();
        assert!(response.encode_to_vec().is_empty());

        let decoded = Response::decode(&[][..]).unwrap();
        assert!(decoded.error.is_none());
        assert!(decoded.return_value.is_none());
    }

    #[test]
    fn test_empty_return_value_is_present() {
        // An empty string encodes to a single zero byte, but an empty
        // `bytes` return value must still be distinguishable from void.
        let response = Response {
            error: None,
            return_value: Some(Vec::new()),
        };
        let decoded = Response::decode(response.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.return_value, Some(Vec::new()));
    }

    #[test]
    fn test_connection_request_type() {
        let request = ConnectionRequest {
            r#type: connection_request::Type::Stream as i32,
            client_name: String::new(),
            client_identifier: vec![7; 16],
        };
        let decoded = ConnectionRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(
            connection_request::Type::try_from(decoded.r#type),
            Ok(connection_request::Type::Stream)
        );
        assert_eq!(decoded.client_identifier.len(), 16);
    }
}
