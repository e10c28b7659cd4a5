//! High level client: connection setup, method table and streams

use crate::call::Call;
use crate::config::ConnectConfig;
use crate::connection::Connection;
use crate::event::Event;
use crate::handshake::{self, ClientIdentifier};
use crate::rpc::{RpcChannel, Signature, build_request};
use crate::services::{ProcedureEntry, ServiceTable};
use crate::stream::{Stream, StreamManager};
use game_rpc_core::schema;
use game_rpc_core::{GameRpcError, RemoteHandle, Result, TypeStore, Value};
use std::sync::Arc;
use tracing::info;

/// A connected client
pub struct Client {
    rpc: Arc<RpcChannel>,
    services: ServiceTable,
    streams: Option<StreamManager>,
    identifier: ClientIdentifier,
}

impl Client {
    /// Connect the RPC channel and, if configured, the stream channel,
    /// then load the method table
    pub async fn connect(config: &ConnectConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Connecting to {} (rpc {}, stream {:?})",
            config.address, config.rpc_port, config.stream_port
        );

        let rpc = Arc::new(Connection::new(&config.address, config.rpc_port));
        rpc.connect(config.connect_retries, config.retry_delay)
            .await?;
        let identifier = handshake::connect_rpc(&rpc, &config.name).await?;

        let stream = match config.stream_port {
            Some(port) => {
                let stream = Arc::new(Connection::new(&config.address, port));
                stream
                    .connect(config.connect_retries, config.retry_delay)
                    .await?;
                handshake::connect_stream(&stream, &identifier).await?;
                Some(stream)
            }
            None => None,
        };

        Self::from_connections(rpc, stream, identifier).await
    }

    /// Build a client on channels that have completed their handshakes
    pub async fn from_connections(
        rpc: Arc<Connection>,
        stream: Option<Arc<Connection>>,
        identifier: ClientIdentifier,
    ) -> Result<Self> {
        let types = Arc::new(TypeStore::new());
        let channel = Arc::new(RpcChannel::new(rpc, types.clone()));

        let services = ServiceTable::build(&channel.get_services().await?, &types)?;
        info!(
            "Loaded {} services for client {}",
            services.services().count(),
            identifier
        );

        let streams = stream.map(|connection| StreamManager::new(channel.clone(), connection));
        Ok(Self {
            rpc: channel,
            services,
            streams,
            identifier,
        })
    }

    pub fn client_identifier(&self) -> &ClientIdentifier {
        &self.identifier
    }

    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    pub fn types(&self) -> &Arc<TypeStore> {
        self.rpc.types()
    }

    /// Stream manager, if a stream channel is connected
    pub fn streams(&self) -> Option<&StreamManager> {
        self.streams.as_ref()
    }

    /// Invoke a procedure with an explicit signature
    pub async fn invoke(
        &self,
        service: &str,
        procedure: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
        signature: &Signature,
    ) -> Result<Option<Value>> {
        self.rpc
            .invoke(service, procedure, args, kwargs, signature)
            .await
    }

    /// Invoke a procedure from the method table
    pub async fn call(&self, call: &Call) -> Result<Option<Value>> {
        let entry = self.services.procedure(&call.service, &call.procedure)?;
        self.invoke_entry(entry, &call.args, &call.kwargs).await
    }

    pub async fn get_property(&self, service: &str, property: &str) -> Result<Value> {
        let entry = self.services.property_getter(service, property)?;
        let value = self.invoke_entry(entry, &[], &[]).await?;
        expect_value(entry, value)
    }

    pub async fn set_property(
        &self,
        service: &str,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let entry = self.services.property_setter(service, property)?;
        self.invoke_entry(entry, &[value.into()], &[]).await?;
        Ok(())
    }

    /// Call a method on a remote object
    pub async fn call_method(
        &self,
        object: &RemoteHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let entry = self
            .services
            .class_method(object.service(), object.class(), method)?;
        let args = with_instance(object, args);
        self.invoke_entry(entry, &args, &[]).await
    }

    pub async fn call_static(
        &self,
        service: &str,
        class: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let entry = self.services.static_method(service, class, method)?;
        self.invoke_entry(entry, &args, &[]).await
    }

    pub async fn get_class_property(&self, object: &RemoteHandle, property: &str) -> Result<Value> {
        let entry = self
            .services
            .class_property_getter(object.service(), object.class(), property)?;
        let value = self
            .invoke_entry(entry, &[Value::Object(object.clone())], &[])
            .await?;
        expect_value(entry, value)
    }

    pub async fn set_class_property(
        &self,
        object: &RemoteHandle,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let entry = self
            .services
            .class_property_setter(object.service(), object.class(), property)?;
        let args = with_instance(object, vec![value.into()]);
        self.invoke_entry(entry, &args, &[]).await?;
        Ok(())
    }

    /// `KRPC.GetStatus`
    pub async fn status(&self) -> Result<schema::Status> {
        self.rpc.get_status().await
    }

    /// Register `call` as a stream. The stream starts on first read or
    /// on [`Stream::start`].
    pub async fn add_stream(&self, call: &Call) -> Result<Stream> {
        let streams = self.streams.as_ref().ok_or_else(|| {
            GameRpcError::Stream("Not connected to a stream server".to_string())
        })?;
        let entry = self.services.procedure(&call.service, &call.procedure)?;
        if entry.kind.is_setter() {
            return Err(GameRpcError::Stream(format!(
                "Cannot stream property setter {}.{}",
                entry.service, entry.name
            )));
        }
        let return_type = entry.signature.return_type.clone().ok_or_else(|| {
            GameRpcError::Stream(format!(
                "Cannot stream {}.{}, it returns no value",
                entry.service, entry.name
            ))
        })?;

        let request = build_request(
            self.types(),
            &entry.service,
            &entry.name,
            &call.args,
            &call.kwargs,
            &entry.signature,
        )?;
        streams.add_stream(&request, return_type).await
    }

    /// Invoke a procedure returning `KRPC.Event` and wrap the event's
    /// stream, which the server has already created.
    pub async fn event(&self, call: &Call) -> Result<Event> {
        let streams = self.streams.as_ref().ok_or_else(|| {
            GameRpcError::Stream("Not connected to a stream server".to_string())
        })?;
        let entry = self.services.procedure(&call.service, &call.procedure)?;
        let value = self.invoke_entry(entry, &call.args, &call.kwargs).await?;
        let event: schema::Event = match value {
            Some(value @ Value::Message { .. }) if value.type_name() == "KRPC.Event" => {
                value.decode_message()?
            }
            other => {
                return Err(GameRpcError::Protocol(format!(
                    "{}.{} did not return an event, got {:?}",
                    entry.service, entry.name, other
                )));
            }
        };
        let id = event
            .stream
            .map(|stream| stream.id)
            .ok_or_else(|| GameRpcError::Protocol("Event carries no stream".to_string()))?;
        let bool_type = self.types().as_type("bool")?;
        Ok(Event::new(streams.get_stream(id, bool_type)))
    }

    /// Stop the stream updater and close both channels. Safe to call twice.
    pub async fn close(&self) {
        if let Some(streams) = &self.streams {
            streams.stop().await;
        }
        self.rpc.connection().close();
    }

    async fn invoke_entry(
        &self,
        entry: &ProcedureEntry,
        args: &[Value],
        kwargs: &[(String, Value)],
    ) -> Result<Option<Value>> {
        self.rpc
            .invoke(&entry.service, &entry.name, args, kwargs, &entry.signature)
            .await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.rpc.connection().close();
    }
}

fn with_instance(object: &RemoteHandle, args: Vec<Value>) -> Vec<Value> {
    let mut all = Vec::with_capacity(args.len() + 1);
    all.push(Value::Object(object.clone()));
    all.extend(args);
    all
}

fn expect_value(entry: &ProcedureEntry, value: Option<Value>) -> Result<Value> {
    value.ok_or_else(|| {
        GameRpcError::Protocol(format!(
            "{}.{} returned no value",
            entry.service, entry.name
        ))
    })
}
