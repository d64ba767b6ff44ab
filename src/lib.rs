//! Schema-driven external function bridge.
//!
//! Lets a rule engine invoke externally hosted functions through one
//! uniform call contract, regardless of the wire protocol the backing
//! service speaks. A service is described by a JSON descriptor binding
//! interfaces (address + protocol + protobuf schema) to exposed function
//! names; the [`ServiceManager`] resolves a function name to a
//! per-interface executor (gRPC, REST or msgpack-rpc) and returns an
//! [`ExternalFunction`] the engine calls like any other function.

pub mod error;
pub mod executor;
pub mod external;
pub mod registry;
pub mod schema;
pub mod value;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{BridgeError, Result};
pub use executor::Executor;
pub use external::{ExternalFunction, FunctionProvider};
pub use registry::{
    FunctionContainer, InterfaceInfo, Protocol, ServiceCreationRequest, ServiceInfo,
    ServiceManager,
};
pub use schema::{Descriptor, SchemaInfo, SchemaRegistry, SchemaType};
