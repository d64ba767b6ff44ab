//! Protocol executors: the per-interface objects performing the actual
//! network call.
//!
//! One executor is constructed per interface through a protocol-keyed
//! constructor table; all executors expose the same async invocation
//! seam and own exactly one lazily-established connection for the
//! lifetime of the interface.

pub mod grpc;
pub mod msgpack;
pub mod rest;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::error::{BridgeError, Result};
use crate::registry::config::{InterfaceInfo, Protocol};
use crate::schema::{Descriptor, SchemaRegistry};

/// Per-interface call timeout applied to dials and invocations.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// The invocation seam every protocol implements.
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    /// Invokes `name` with the given parameters and returns the decoded
    /// result. Errors surface to the calling function; they never abort
    /// the process.
    async fn invoke_function(&self, name: &str, params: &[Value]) -> Result<Value>;
}

/// Options shared by every executor: target address and call timeout.
#[derive(Debug, Clone)]
pub(crate) struct InterfaceOpt {
    pub addr: Url,
    pub timeout: Duration,
}

type ConstructorFn = fn(Descriptor, InterfaceOpt, &Value) -> Result<Arc<dyn Executor>>;

fn constructor_for(protocol: Protocol) -> ConstructorFn {
    match protocol {
        Protocol::Grpc => grpc::new_executor,
        Protocol::Rest => rest::new_executor,
        Protocol::MsgpackRpc => msgpack::new_executor,
    }
}

/// Builds the executor for one interface. Validation of the interface
/// fields happened at descriptor-file parse time; this only resolves the
/// schema and dispatches on the protocol.
pub fn new_executor(info: &InterfaceInfo, schemas: &SchemaRegistry) -> Result<Arc<dyn Executor>> {
    let descriptor = schemas.parse(info.schema.schema_type, &info.schema.schema_file)?;
    let addr = Url::parse(&info.addr)
        .map_err(|_| BridgeError::connection(format!("invalid url {}", info.addr)))?;
    let opt = InterfaceOpt {
        addr,
        timeout: DEFAULT_TIMEOUT,
    };
    constructor_for(info.protocol)(descriptor, opt, &info.options)
}
