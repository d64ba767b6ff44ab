//! gRPC executor: dynamic unary invocation over a shared channel.
//!
//! The channel is dialled on first use under a mutex and reused for all
//! further calls on the interface; dial failures are not retried. Each
//! invocation converts the parameters to a dynamic message, calls the
//! method through a descriptor-driven codec and decodes the reply.

use std::sync::Arc;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor, ReflectMessage};
use serde_json::Value;
use tokio::sync::Mutex;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

use crate::error::{BridgeError, Result};
use crate::schema::proto::ProtoDescriptor;
use crate::schema::Descriptor;

use super::{Executor, InterfaceOpt};

pub(crate) fn new_executor(
    descriptor: Descriptor,
    opt: InterfaceOpt,
    _options: &Value,
) -> Result<Arc<dyn Executor>> {
    let descriptor = descriptor
        .as_proto()
        .ok_or_else(|| BridgeError::schema("invalid descriptor type for grpc"))?;
    Ok(Arc::new(GrpcExecutor {
        descriptor,
        opt,
        channel: Mutex::new(None),
    }))
}

#[derive(Debug)]
pub(crate) struct GrpcExecutor {
    descriptor: Arc<ProtoDescriptor>,
    opt: InterfaceOpt,
    channel: Mutex<Option<Channel>>,
}

impl GrpcExecutor {
    /// Returns the shared channel, dialling it on first use. The mutex
    /// guarantees a single connection per interface even under
    /// concurrent first calls.
    async fn channel(&self) -> Result<Channel> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            return Ok(channel.clone());
        }
        let target = format!("http://{}", self.opt.addr.authority());
        let endpoint = Endpoint::from_shared(target)
            .map_err(|e| BridgeError::connection(format!("invalid address {}: {e}", self.opt.addr)))?;
        let channel = tokio::time::timeout(self.opt.timeout, endpoint.connect())
            .await
            .map_err(|_| BridgeError::connection(format!("connect to {} timeout", self.opt.addr)))?
            .map_err(|e| BridgeError::connection(format!("connect to {} error: {e}", self.opt.addr)))?;
        *guard = Some(channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl Executor for GrpcExecutor {
    async fn invoke_function(&self, name: &str, params: &[Value]) -> Result<Value> {
        let method = self
            .descriptor
            .method(name)
            .ok_or_else(|| BridgeError::binding(format!("can't find method {name} in proto")))?;
        let message = self.descriptor.params_to_message(name, params)?;
        let channel = self.channel().await?;

        let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
        let path = PathAndQuery::try_from(path.as_str())
            .map_err(|e| BridgeError::invocation(format!("invalid method path {path}: {e}")))?;
        let codec = DynamicCodec::new(&method);
        let mut client = Grpc::new(channel);

        let call = async {
            client
                .ready()
                .await
                .map_err(|e| BridgeError::connection(format!("grpc channel not ready: {e}")))?;
            client
                .unary(Request::new(message), path, codec)
                .await
                .map_err(|s| {
                    BridgeError::invocation(format!("error invoking method {name} in proto: {s}"))
                })
        };
        let response = tokio::time::timeout(self.opt.timeout, call)
            .await
            .map_err(|_| BridgeError::invocation(format!("invoke {name} timeout")))??;
        self.descriptor
            .return_from_message(name, &response.into_inner())
    }
}

/// A tonic codec driven entirely by method descriptors.
struct DynamicCodec {
    request: MessageDescriptor,
    response: MessageDescriptor,
}

impl DynamicCodec {
    fn new(method: &MethodDescriptor) -> Self {
        DynamicCodec {
            request: method.input(),
            response: method.output(),
        }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder {
            _descriptor: self.request.clone(),
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            descriptor: self.response.clone(),
        }
    }
}

struct DynamicEncoder {
    _descriptor: MessageDescriptor,
}

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: DynamicMessage, dst: &mut EncodeBuf<'_>) -> std::result::Result<(), Status> {
        prost::Message::encode(&item, dst).map_err(|e| Status::internal(e.to_string()))
    }
}

struct DynamicDecoder {
    descriptor: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> std::result::Result<Option<DynamicMessage>, Status> {
        let message = DynamicMessage::decode(self.descriptor.clone(), src)
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use prost_reflect::Value as ProtoValue;
    use serde_json::json;
    use std::time::Duration;

    fn executor(addr: &str, timeout_ms: u64) -> GrpcExecutor {
        let dir = testutil::schema_dir();
        let descriptor = Arc::new(ProtoDescriptor::parse("hw.proto", &[dir]).unwrap());
        GrpcExecutor {
            descriptor,
            opt: InterfaceOpt {
                addr: url::Url::parse(addr).unwrap(),
                timeout: Duration::from_millis(timeout_ms),
            },
            channel: Mutex::new(None),
        }
    }

    #[test]
    fn test_dynamic_message_wire_round_trip() {
        let dir = testutil::schema_dir();
        let descriptor = ProtoDescriptor::parse("hw.proto", &[dir]).unwrap();
        let message = descriptor
            .params_to_message("SayHello", &[json!("world")])
            .unwrap();
        let bytes = prost::Message::encode_to_vec(&message);
        let decoded =
            DynamicMessage::decode(message.descriptor(), bytes.as_slice()).unwrap();
        assert_eq!(
            decoded.get_field_by_name("name").unwrap().as_ref(),
            &ProtoValue::String("world".into())
        );
    }

    #[tokio::test]
    async fn test_dial_timeout_against_silent_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // keep accepting but never speak HTTP/2
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let exe = executor(&format!("tcp://{addr}"), 200);
        let err = exe
            .invoke_function("SayHello", &[json!("world")])
            .await
            .unwrap_err();
        assert!(
            err.message().contains("timeout"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_binding_error_before_dial() {
        // method lookup and parameter binding fail before any dial
        let exe = executor("tcp://127.0.0.1:1", 50);
        let err = exe.invoke_function("NoSuch", &[]).await.unwrap_err();
        assert_eq!(err.message(), "can't find method NoSuch in proto");
    }
}
