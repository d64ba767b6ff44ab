//! Service descriptor JSON types and their runtime counterparts.
//!
//! A service is described by one `<name>.json` file: an `about` block
//! plus one entry per interface binding an address, a protocol and a
//! schema file to a set of exposed functions.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::SchemaInfo;

/// Wire protocols an interface may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "rest")]
    Rest,
    #[serde(rename = "grpc")]
    Grpc,
    #[serde(rename = "msgpack-rpc")]
    MsgpackRpc,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Rest => write!(f, "rest"),
            Protocol::Grpc => write!(f, "grpc"),
            Protocol::MsgpackRpc => write!(f, "msgpack-rpc"),
        }
    }
}

/// The on-disk service descriptor file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConf {
    #[serde(default)]
    pub about: Value,
    pub interfaces: HashMap<String, InterfaceConf>,
}

/// One interface entry of a service descriptor file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConf {
    #[serde(default)]
    pub description: String,
    pub address: String,
    pub protocol: Protocol,
    pub schema_type: crate::schema::SchemaType,
    pub schema_file: String,
    /// Optional per-function aliases: `serviceName` is the proto method,
    /// `name` the engine-visible function name.
    #[serde(default)]
    pub functions: Vec<FunctionMapping>,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMapping {
    pub name: String,
    pub service_name: String,
    #[serde(default)]
    pub description: String,
}

/// A registered service as persisted: immutable after load, updates
/// require delete plus recreate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    #[serde(default)]
    pub about: Value,
    pub interfaces: HashMap<String, InterfaceInfo>,
}

/// One loaded interface: address, protocol and schema binding plus the
/// ordered list of exposed function names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    #[serde(default)]
    pub description: String,
    pub addr: String,
    pub protocol: Protocol,
    pub schema: SchemaInfo,
    pub functions: Vec<String>,
    #[serde(default)]
    pub options: Value,
}

/// The resolved mapping from an engine-visible function name to its
/// underlying RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionContainer {
    pub service_name: String,
    pub interface_name: String,
    pub method_name: String,
}

/// Request to register a new service from a downloadable bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCreationRequest {
    pub name: String,
    /// URL of a zip archive containing `<name>.json` plus its schemas.
    pub file: String,
}
