//! The protobuf descriptor variant.
//!
//! Compiles a `.proto` source file at load time and exposes the method,
//! message and option metadata the conversion and mapping layers run on.

use std::collections::HashMap;
use std::path::PathBuf;

use prost_reflect::{DescriptorPool, FileDescriptor, MethodDescriptor};

use crate::error::{BridgeError, Result};

use super::http::{self, HttpOptions};

pub(crate) const WRAPPER_TYPES: [&str; 9] = [
    "google.protobuf.BoolValue",
    "google.protobuf.BytesValue",
    "google.protobuf.DoubleValue",
    "google.protobuf.FloatValue",
    "google.protobuf.Int32Value",
    "google.protobuf.Int64Value",
    "google.protobuf.StringValue",
    "google.protobuf.UInt32Value",
    "google.protobuf.UInt64Value",
];

pub(crate) const WRAPPER_STRING: &str = "google.protobuf.StringValue";
pub(crate) const EMPTY_TYPE: &str = "google.protobuf.Empty";

/// A compiled protobuf file with its derived per-method HTTP mappings.
#[derive(Debug)]
pub struct ProtoDescriptor {
    file: FileDescriptor,
    http_options: HashMap<String, HttpOptions>,
}

impl ProtoDescriptor {
    /// Compiles `file` (resolved against `import_paths`) and derives the
    /// HTTP mapping for every annotated method.
    pub fn parse(file: &str, import_paths: &[PathBuf]) -> Result<Self> {
        let fds = protox::compile([file], import_paths)
            .map_err(|e| BridgeError::schema(format!("failed to parse proto file {file}: {e}")))?;
        let pool = DescriptorPool::from_file_descriptor_set(fds)
            .map_err(|e| BridgeError::schema(format!("failed to parse proto file {file}: {e}")))?;
        let fd = pool
            .get_file_by_name(file)
            .ok_or_else(|| BridgeError::schema(format!("proto file {file} missing from pool")))?;
        let http_options = http::parse_http_options(&fd)?;
        Ok(ProtoDescriptor {
            file: fd,
            http_options,
        })
    }

    /// Every RPC method name declared in the file, across all services.
    pub fn functions(&self) -> Vec<String> {
        self.file
            .services()
            .flat_map(|s| s.methods().map(|m| m.name().to_string()).collect::<Vec<_>>())
            .collect()
    }

    /// Finds a method by bare name, searching every service in order.
    pub fn method(&self, name: &str) -> Option<MethodDescriptor> {
        self.file
            .services()
            .flat_map(|s| s.methods().collect::<Vec<_>>())
            .find(|m| m.name() == name)
    }

    pub(crate) fn method_or_err(&self, name: &str) -> Result<MethodDescriptor> {
        self.method(name)
            .ok_or_else(|| BridgeError::binding(format!("can't find method {name} in proto")))
    }

    pub(crate) fn http_options(&self) -> &HashMap<String, HttpOptions> {
        &self.http_options
    }
}
