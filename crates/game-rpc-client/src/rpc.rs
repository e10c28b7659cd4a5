//! RPC channel: request building, serialized round trips, response decoding

use crate::connection::Connection;
use crate::stream::StreamControl;
use async_trait::async_trait;
use game_rpc_core::schema::{self, Argument, Request, Response};
use game_rpc_core::{
    GameRpcError, RemoteError, Result, TypeDescriptor, TypeRef, TypeStore, Value, wire,
};
use prost::Message;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Service hosting the bootstrap and stream management procedures
pub const KRPC_SERVICE: &str = "KRPC";

/// Parameter and return types of a procedure
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Signature {
    pub param_names: Vec<String>,
    pub param_types: Vec<TypeRef>,
    pub return_type: Option<TypeRef>,
}

impl Signature {
    /// Resolve a signature from `(name, type)` pairs and a return type string
    pub fn resolve(
        types: &TypeStore,
        params: &[(&str, &str)],
        return_type: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            param_names: params.iter().map(|(name, _)| name.to_string()).collect(),
            param_types: params
                .iter()
                .map(|(_, ty)| types.as_type(ty))
                .collect::<Result<_>>()?,
            return_type: return_type.map(|ty| types.as_type(ty)).transpose()?,
        })
    }
}

/// Build a request, placing and coercing arguments.
///
/// Positional arguments fill parameters in order; keyword arguments fill
/// the remaining parameters by name. Parameters with neither are left
/// out so the server applies their defaults.
pub fn build_request(
    types: &TypeStore,
    service: &str,
    procedure: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
    signature: &Signature,
) -> Result<Request> {
    let arity = signature.param_types.len();
    if args.len() > arity {
        return Err(GameRpcError::InvalidArguments(format!(
            "{}.{}() takes {} arguments ({} given)",
            service,
            procedure,
            arity,
            args.len()
        )));
    }

    let mut filled = HashSet::new();
    for (name, _) in kwargs {
        let position = signature
            .param_names
            .iter()
            .position(|p| p == name)
            .ok_or_else(|| {
                GameRpcError::InvalidArguments(format!(
                    "{}.{}() got an unexpected keyword argument '{}'",
                    service, procedure, name
                ))
            })?;
        if position < args.len() || !filled.insert(position) {
            return Err(GameRpcError::InvalidArguments(format!(
                "{}.{}() got multiple values for argument '{}'",
                service, procedure, name
            )));
        }
    }

    let mut arguments = Vec::new();
    for (index, ty) in signature.param_types.iter().enumerate() {
        let value = args.get(index).or_else(|| {
            let name = signature.param_names.get(index)?;
            kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
        });
        let Some(value) = value else {
            continue;
        };

        let encoded = if value.matches(ty) || tuple_arity_differs(value, ty) {
            wire::encode(value, ty)?
        } else {
            let coerced = types
                .coerce_to(value, ty)
                .map_err(|e| GameRpcError::TypeCoercion {
                    service: service.to_string(),
                    procedure: procedure.to_string(),
                    index,
                    expected: e.expected,
                    actual: e.actual,
                })?;
            wire::encode(&coerced, ty)?
        };
        arguments.push(Argument {
            position: index as u32,
            value: encoded,
        });
    }

    Ok(Request {
        service: service.to_string(),
        procedure: procedure.to_string(),
        arguments,
    })
}

/// A tuple of the wrong length is left to the encoder, which rejects it
fn tuple_arity_differs(value: &Value, ty: &TypeDescriptor) -> bool {
    matches!(
        (value, ty),
        (Value::Tuple(items), TypeDescriptor::Tuple(elems)) if items.len() != elems.len()
    )
}

/// Turn a response into a value, `None` for void, or the remote error
pub fn decode_response(
    response: Response,
    return_type: Option<&TypeDescriptor>,
) -> Result<Option<Value>> {
    if let Some(error) = response.error {
        return Err(RemoteError::from(error).into());
    }
    match return_type {
        Some(ty) => {
            let data = response.return_value.unwrap_or_default();
            Ok(Some(wire::decode(&data, ty)?))
        }
        None => Ok(None),
    }
}

/// The RPC channel of a client.
///
/// One request is in flight at a time; concurrent callers queue on the
/// channel lock, which is held from sending a request until its response
/// has been read. The exchange runs on its own task, so a caller that
/// stops waiting does not leave an unread response on the socket.
pub struct RpcChannel {
    connection: Arc<Connection>,
    lock: Arc<Mutex<()>>,
    types: Arc<TypeStore>,
}

impl RpcChannel {
    pub fn new(connection: Arc<Connection>, types: Arc<TypeStore>) -> Self {
        Self {
            connection,
            lock: Arc::new(Mutex::new(())),
            types,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn types(&self) -> &Arc<TypeStore> {
        &self.types
    }

    /// Send a request and read its response
    pub async fn execute(&self, request: &Request) -> Result<Response> {
        let guard = self.lock.clone().lock_owned().await;
        debug!("Invoking {}.{}", request.service, request.procedure);
        let connection = self.connection.clone();
        let request = request.clone();
        let exchange = tokio::spawn(async move {
            let _guard = guard;
            connection.send_message(&request).await?;
            connection.receive_message::<Response>().await
        });
        exchange.await.map_err(|e| {
            GameRpcError::network(
                self.connection.address(),
                self.connection.port(),
                format!("RPC exchange failed: {}", e),
            )
        })?
    }

    /// Call a procedure and decode its result
    pub async fn invoke(
        &self,
        service: &str,
        procedure: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
        signature: &Signature,
    ) -> Result<Option<Value>> {
        let request = build_request(&self.types, service, procedure, args, kwargs, signature)?;
        let response = self.execute(&request).await?;
        decode_response(response, signature.return_type.as_deref())
    }

    /// `KRPC.GetServices`
    pub async fn get_services(&self) -> Result<schema::Services> {
        self.call_krpc("GetServices", &[], vec![], Some("KRPC.Services"))
            .await?
            .decode_message()
    }

    /// `KRPC.GetStatus`
    pub async fn get_status(&self) -> Result<schema::Status> {
        self.call_krpc("GetStatus", &[], vec![], Some("KRPC.Status"))
            .await?
            .decode_message()
    }

    async fn call_krpc(
        &self,
        procedure: &str,
        params: &[(&str, &str)],
        args: Vec<Value>,
        return_type: Option<&str>,
    ) -> Result<Value> {
        let signature = Signature::resolve(&self.types, params, return_type)?;
        let value = self
            .invoke(KRPC_SERVICE, procedure, &args, &[], &signature)
            .await?;
        Ok(value.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl StreamControl for RpcChannel {
    async fn add_stream(&self, call: &Request, start: bool) -> Result<u64> {
        let call = Value::Message {
            type_name: "KRPC.Request".to_string(),
            bytes: call.encode_to_vec(),
        };
        let stream: schema::Stream = self
            .call_krpc(
                "AddStream",
                &[("call", "KRPC.Request"), ("start", "bool")],
                vec![call, Value::Bool(start)],
                Some("KRPC.Stream"),
            )
            .await?
            .decode_message()?;
        Ok(stream.id)
    }

    async fn start_stream(&self, id: u64) -> Result<()> {
        self.call_krpc("StartStream", &[("id", "uint64")], vec![Value::UInt64(id)], None)
            .await?;
        Ok(())
    }

    async fn remove_stream(&self, id: u64) -> Result<()> {
        self.call_krpc("RemoveStream", &[("id", "uint64")], vec![Value::UInt64(id)], None)
            .await?;
        Ok(())
    }

    async fn set_stream_rate(&self, id: u64, rate: f32) -> Result<()> {
        self.call_krpc(
            "SetStreamRate",
            &[("id", "uint64"), ("rate", "float")],
            vec![Value::UInt64(id), Value::Float(rate)],
            None,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use game_rpc_core::RemoteHandle;

    fn signature(types: &TypeStore, params: &[(&str, &str)]) -> Signature {
        Signature::resolve(types, params, None).unwrap()
    }

    fn kw(name: &str, value: impl Into<Value>) -> (String, Value) {
        (name.to_string(), value.into())
    }

    #[test]
    fn test_too_many_positionals() {
        let types = TypeStore::new();
        let sig = signature(&types, &[("x", "int32")]);
        let result = build_request(&types, "S", "P", &[1.into(), 2.into()], &[], &sig);
        assert!(matches!(result, Err(GameRpcError::InvalidArguments(_))));
    }

    #[test]
    fn test_keyword_errors() {
        let types = TypeStore::new();
        let sig = signature(&types, &[("x", "int32"), ("y", "int32")]);

        let unknown = build_request(&types, "S", "P", &[], &[kw("z", 1)], &sig);
        assert!(matches!(unknown, Err(GameRpcError::InvalidArguments(m)) if m.contains("'z'")));

        let collision = build_request(&types, "S", "P", &[1.into()], &[kw("x", 2)], &sig);
        assert!(matches!(collision, Err(GameRpcError::InvalidArguments(m)) if m.contains("multiple")));

        let repeated = build_request(&types, "S", "P", &[], &[kw("y", 1), kw("y", 2)], &sig);
        assert!(matches!(repeated, Err(GameRpcError::InvalidArguments(_))));
    }

    #[test]
    fn test_omitted_parameters_are_left_out() {
        let types = TypeStore::new();
        let sig = signature(&types, &[("a", "int32"), ("b", "string"), ("c", "bool")]);
        let request = build_request(&types, "S", "P", &[5.into()], &[kw("c", true)], &sig).unwrap();

        let positions: Vec<u32> = request.arguments.iter().map(|a| a.position).collect();
        assert_eq!(positions, vec![0, 2]);
        assert_eq!(request.arguments[0].value, vec![0x05]);
        assert_eq!(request.arguments[1].value, vec![0x01]);
    }

    #[test]
    fn test_arguments_are_coerced() {
        let types = TypeStore::new();
        let sig = signature(&types, &[("x", "double"), ("v", "Class(SpaceCenter.Vessel)")]);
        let request = build_request(&types, "S", "P", &[3.into(), Value::Null], &[], &sig).unwrap();
        assert_eq!(request.arguments[0].value, 3.0f64.to_le_bytes());
        assert_eq!(request.arguments[1].value, vec![0x00]);

        let handle = RemoteHandle::new("SpaceCenter", "Vessel", 7);
        let request = build_request(&types, "S", "P", &[1.5.into(), handle.into()], &[], &sig).unwrap();
        assert_eq!(request.arguments[1].value, vec![0x07]);
    }

    #[test]
    fn test_coercion_failure_names_the_argument() {
        let types = TypeStore::new();
        let sig = signature(&types, &[("value", "float")]);
        let err = build_request(&types, "TestService", "FloatToString", &["1".into()], &[], &sig)
            .unwrap_err();
        match err {
            GameRpcError::TypeCoercion {
                service,
                procedure,
                index,
                expected,
                actual,
            } => {
                assert_eq!(service, "TestService");
                assert_eq!(procedure, "FloatToString");
                assert_eq!(index, 0);
                assert_eq!(expected, "float");
                assert_eq!(actual, "string");
            }
            other => panic!("expected a coercion error, got {:?}", other),
        }

        let bool_arg = build_request(&types, "S", "P", &[true.into()], &[], &sig);
        assert!(matches!(bool_arg, Err(GameRpcError::TypeCoercion { .. })));
    }

    #[test]
    fn test_tuple_arity_mismatch_is_protocol_error() {
        let types = TypeStore::new();
        let sig = signature(&types, &[("pair", "Tuple(int32,bool)")]);

        let short = Value::Tuple(vec![Value::Int32(1)]);
        let long = Value::Tuple(vec![Value::Int32(1), Value::Bool(true), Value::Int32(2)]);
        for tuple in [short, long] {
            let result = build_request(&types, "S", "P", &[tuple], &[], &sig);
            assert!(
                matches!(result, Err(GameRpcError::Protocol(_))),
                "got {:?}",
                result
            );
        }

        // Right arity still coerces element-wise, and lists reshape
        let wide = Value::Tuple(vec![Value::Int64(3), Value::Bool(false)]);
        let request = build_request(&types, "S", "P", &[wide], &[], &sig).unwrap();
        assert_eq!(request.arguments.len(), 1);
        let list = Value::List(vec![Value::Int32(3), Value::Bool(false)]);
        let from_list = build_request(&types, "S", "P", &[list], &[], &sig).unwrap();
        assert_eq!(from_list.arguments[0].value, request.arguments[0].value);
    }

    #[test]
    fn test_decode_response() {
        let types = TypeStore::new();
        let int32 = types.as_type("int32").unwrap();

        let void = decode_response(Response::default(), None).unwrap();
        assert_eq!(void, None);

        let value = Response {
            error: None,
            return_value: Some(vec![0xac, 0x02]),
        };
        assert_eq!(decode_response(value, Some(&*int32)).unwrap(), Some(Value::Int32(300)));

        let failed = Response {
            error: Some(schema::Error {
                description: "Procedure failed".into(),
                ..Default::default()
            }),
            return_value: Some(vec![0xff]),
        };
        match decode_response(failed, Some(&*int32)) {
            Err(GameRpcError::Remote(e)) => assert_eq!(e.to_string(), "Procedure failed"),
            other => panic!("expected a remote error, got {:?}", other),
        }
    }

    /// Answers each request with its procedure name; `Slow` answers late
    async fn echo_name_server() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let string = TypeStore::new().as_type("string").unwrap();
            while let Some(frame) = crate::stub::read_frame(&mut socket).await {
                let request = Request::decode(frame.as_slice()).unwrap();
                if request.procedure == "Slow" {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
                let name = wire::encode(&Value::from(request.procedure.as_str()), &string).unwrap();
                crate::stub::write_frame(&mut socket, &crate::stub::value_response(name)).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_leak_its_response() {
        let port = echo_name_server().await;
        let connection = Arc::new(Connection::new("127.0.0.1", port));
        connection.connect(0, std::time::Duration::ZERO).await.unwrap();
        let types = Arc::new(TypeStore::new());
        let channel = RpcChannel::new(connection, types.clone());
        let sig = Signature::resolve(&types, &[], Some("string")).unwrap();

        let slow = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            channel.invoke("S", "Slow", &[], &[], &sig),
        )
        .await;
        assert!(slow.is_err());

        let fast = channel.invoke("S", "Fast", &[], &[], &sig).await.unwrap();
        assert_eq!(fast, Some(Value::from("Fast")));
        let again = channel.invoke("S", "Again", &[], &[], &sig).await.unwrap();
        assert_eq!(again, Some(Value::from("Again")));
    }
}
