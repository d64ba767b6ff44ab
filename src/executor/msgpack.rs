//! msgpack-rpc executor: one persistent socket per interface.
//!
//! Requests use the msgpack-rpc framing `[0, msgid, method, params]` and
//! block on the matching `[1, msgid, error, result]` reply. The socket
//! is established lazily under the connection mutex, which also makes
//! calls single-flight per interface. A shutdown-class I/O failure marks
//! the connection dead so the next call redials.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{BridgeError, Result};
use crate::schema::convert;
use crate::schema::proto::ProtoDescriptor;
use crate::schema::Descriptor;

use super::{Executor, InterfaceOpt};

const REQUEST_TYPE: u64 = 0;
const RESPONSE_TYPE: u64 = 1;

pub(crate) fn new_executor(
    descriptor: Descriptor,
    opt: InterfaceOpt,
    _options: &Value,
) -> Result<Arc<dyn Executor>> {
    let descriptor = descriptor
        .as_proto()
        .ok_or_else(|| BridgeError::schema("invalid descriptor type for msgpack-rpc"))?;
    Ok(Arc::new(MsgpackExecutor {
        descriptor,
        opt,
        conn: Mutex::new(Connection {
            stream: None,
            next_id: 0,
        }),
    }))
}

#[derive(Debug)]
struct Connection {
    stream: Option<TcpStream>,
    next_id: u32,
}

#[derive(Debug)]
pub(crate) struct MsgpackExecutor {
    descriptor: Arc<ProtoDescriptor>,
    opt: InterfaceOpt,
    conn: Mutex<Connection>,
}

impl MsgpackExecutor {
    #[cfg(test)]
    fn new(descriptor: Arc<ProtoDescriptor>, opt: InterfaceOpt) -> Self {
        MsgpackExecutor {
            descriptor,
            opt,
            conn: Mutex::new(Connection {
                stream: None,
                next_id: 0,
            }),
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        let host = self
            .opt
            .addr
            .host_str()
            .ok_or_else(|| BridgeError::connection(format!("invalid address {}", self.opt.addr)))?;
        let port = self
            .opt
            .addr
            .port()
            .ok_or_else(|| BridgeError::connection(format!("invalid address {}", self.opt.addr)))?;
        let target = (host, port)
            .to_socket_addrs()
            .map_err(|e| BridgeError::connection(format!("resolve {host}:{port} error: {e}")))?
            .next()
            .ok_or_else(|| BridgeError::connection(format!("resolve {host}:{port} error")))?;
        let stream = TcpStream::connect_timeout(&target, self.opt.timeout)
            .map_err(|e| BridgeError::connection(format!("connect to {} error: {e}", self.opt.addr)))?;
        stream
            .set_read_timeout(Some(self.opt.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.opt.timeout)))
            .map_err(|e| BridgeError::connection(format!("configure socket error: {e}")))?;
        Ok(stream)
    }
}

#[async_trait]
impl Executor for MsgpackExecutor {
    async fn invoke_function(&self, name: &str, params: &[Value]) -> Result<Value> {
        let typed = self.descriptor.convert_params(name, params)?;
        let args: Vec<rmpv::Value> = typed.iter().map(proto_value_to_msgpack).collect();

        let mut conn = self.conn.lock().await;
        if conn.stream.is_none() {
            conn.stream = Some(self.connect()?);
        }
        let Some(stream) = conn.stream.take() else {
            return Err(BridgeError::connection("no connection"));
        };
        let msgid = conn.next_id;
        conn.next_id = conn.next_id.wrapping_add(1);

        let request = rmpv::Value::Array(vec![
            rmpv::Value::from(REQUEST_TYPE),
            rmpv::Value::from(msgid),
            rmpv::Value::from(name),
            rmpv::Value::Array(args),
        ]);
        let (stream, outcome) = tokio::task::spawn_blocking(move || {
            let mut stream = stream;
            let outcome = round_trip(&mut stream, &request);
            (stream, outcome)
        })
        .await
        .map_err(|e| BridgeError::connection(format!("msgpack-rpc call aborted: {e}")))?;

        let reply = match outcome {
            Ok(reply) => {
                conn.stream = Some(stream);
                reply
            }
            Err(e) => {
                if !is_shutdown(&e) {
                    conn.stream = Some(stream);
                }
                return Err(BridgeError::connection(format!(
                    "msgpack-rpc call {name} error: {e}"
                )));
            }
        };
        drop(conn);

        let (reply_id, error, result) = parse_response(&reply)?;
        if reply_id != u64::from(msgid) {
            return Err(BridgeError::invocation(format!(
                "msgpack-rpc response id {reply_id} does not match request id {msgid}"
            )));
        }
        if !error.is_nil() {
            return Err(BridgeError::invocation(format!(
                "msgpack-rpc error: {error}"
            )));
        }
        let generic = msgpack_value_to_json(result);
        self.descriptor.return_from_value(name, &generic)
    }
}

fn round_trip(stream: &mut TcpStream, request: &rmpv::Value) -> io::Result<rmpv::Value> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, request)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    io::Write::write_all(stream, &buf)?;
    rmpv::decode::read_value(stream).map_err(decode_error_to_io)
}

#[allow(unreachable_patterns)]
fn decode_error_to_io(e: rmpv::decode::Error) -> io::Error {
    match e {
        rmpv::decode::Error::InvalidMarkerRead(inner) => inner,
        rmpv::decode::Error::InvalidDataRead(inner) => inner,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

/// Errors after which the socket cannot be trusted anymore.
fn is_shutdown(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::InvalidData
    )
}

fn parse_response(reply: &rmpv::Value) -> Result<(u64, &rmpv::Value, &rmpv::Value)> {
    let rmpv::Value::Array(parts) = reply else {
        return Err(BridgeError::invocation(format!(
            "malformed msgpack-rpc response: {reply}"
        )));
    };
    if parts.len() != 4 || parts[0].as_u64() != Some(RESPONSE_TYPE) {
        return Err(BridgeError::invocation(format!(
            "malformed msgpack-rpc response: {reply}"
        )));
    }
    let id = parts[1].as_u64().ok_or_else(|| {
        BridgeError::invocation(format!("malformed msgpack-rpc response: {reply}"))
    })?;
    Ok((id, &parts[2], &parts[3]))
}

fn proto_value_to_msgpack(v: &prost_reflect::Value) -> rmpv::Value {
    use prost_reflect::Value as ProtoValue;
    match v {
        ProtoValue::Bool(b) => rmpv::Value::from(*b),
        ProtoValue::I32(i) => rmpv::Value::from(*i),
        ProtoValue::I64(i) => rmpv::Value::from(*i),
        ProtoValue::U32(u) => rmpv::Value::from(*u),
        ProtoValue::U64(u) => rmpv::Value::from(*u),
        ProtoValue::F32(f) => rmpv::Value::from(*f),
        ProtoValue::F64(f) => rmpv::Value::from(*f),
        ProtoValue::String(s) => rmpv::Value::from(s.as_str()),
        ProtoValue::Bytes(b) => rmpv::Value::Binary(b.to_vec()),
        ProtoValue::EnumNumber(n) => rmpv::Value::from(*n),
        ProtoValue::Message(m) => {
            let json = convert::decode_message(m);
            json_to_msgpack(&json)
        }
        ProtoValue::List(items) => {
            rmpv::Value::Array(items.iter().map(proto_value_to_msgpack).collect())
        }
        ProtoValue::Map(entries) => rmpv::Value::Map(
            entries
                .iter()
                .map(|(k, val)| {
                    (
                        rmpv::Value::from(convert::map_key_to_string(k).as_str()),
                        proto_value_to_msgpack(val),
                    )
                })
                .collect(),
        ),
    }
}

fn json_to_msgpack(v: &Value) -> rmpv::Value {
    match v {
        Value::Null => rmpv::Value::Nil,
        Value::Bool(b) => rmpv::Value::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rmpv::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                rmpv::Value::from(u)
            } else {
                rmpv::Value::from(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => rmpv::Value::from(s.as_str()),
        Value::Array(items) => rmpv::Value::Array(items.iter().map(json_to_msgpack).collect()),
        Value::Object(map) => rmpv::Value::Map(
            map.iter()
                .map(|(k, val)| (rmpv::Value::from(k.as_str()), json_to_msgpack(val)))
                .collect(),
        ),
    }
}

fn msgpack_value_to_json(v: &rmpv::Value) -> Value {
    match v {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::from(*b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Value::from(n)
            } else if let Some(u) = i.as_u64() {
                Value::from(u)
            } else {
                Value::from(i.as_f64().unwrap_or_default())
            }
        }
        rmpv::Value::F32(f) => Value::from(f64::from(*f)),
        rmpv::Value::F64(f) => Value::from(*f),
        rmpv::Value::String(s) => Value::from(s.as_str().unwrap_or_default()),
        rmpv::Value::Binary(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
        rmpv::Value::Array(items) => {
            Value::Array(items.iter().map(msgpack_value_to_json).collect())
        }
        rmpv::Value::Map(entries) => {
            let mut out = Map::new();
            for (k, val) in entries {
                let key = match k {
                    rmpv::Value::String(s) => s.as_str().unwrap_or_default().to_string(),
                    other => other.to_string(),
                };
                out.insert(key, msgpack_value_to_json(val));
            }
            Value::Object(out)
        }
        rmpv::Value::Ext(..) => Value::Null,
    }
}
