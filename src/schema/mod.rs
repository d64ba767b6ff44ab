//! Schema descriptor parsing and the process-wide descriptor cache.
//!
//! A schema file is parsed once per `(schema type, file)` pair and the
//! resulting descriptor is shared by every interface referencing it.
//! Failed parses are never cached, so later attempts see fixes on disk.

pub mod convert;
pub mod http;
pub mod proto;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use proto::ProtoDescriptor;

/// Supported schema languages. Adding a variant means adding a
/// descriptor implementation; configuration files with any other value
/// are rejected at deserialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaType {
    #[serde(rename = "protobuf")]
    Protobuf,
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaType::Protobuf => write!(f, "protobuf"),
        }
    }
}

/// Identifies one parsed schema: the language plus the file it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    pub schema_type: SchemaType,
    pub schema_file: String,
}

/// A parsed, queryable schema. One variant per schema type; executors
/// ask for the capability they need and fail when it is absent.
#[derive(Clone)]
pub enum Descriptor {
    Proto(Arc<ProtoDescriptor>),
}

impl Descriptor {
    /// Every RPC method across every service declared in the file,
    /// flattened into one list. Same-named methods in different services
    /// are not disambiguated.
    pub fn functions(&self) -> Vec<String> {
        match self {
            Descriptor::Proto(d) => d.functions(),
        }
    }

    /// The protobuf capability: message construction, http mapping and
    /// dynamic gRPC invocation.
    pub fn as_proto(&self) -> Option<Arc<ProtoDescriptor>> {
        match self {
            Descriptor::Proto(d) => Some(d.clone()),
        }
    }
}

/// Cache of parsed descriptors keyed by `(schema type, file)`.
///
/// Reads race freely; a creation race converges by publishing the first
/// inserted descriptor and discarding the redundantly built one.
pub struct SchemaRegistry {
    import_paths: Vec<PathBuf>,
    cache: Mutex<HashMap<(SchemaType, String), Arc<ProtoDescriptor>>>,
}

impl SchemaRegistry {
    /// Creates a registry resolving schema files against `import_paths`.
    pub fn new(import_paths: Vec<PathBuf>) -> Self {
        SchemaRegistry {
            import_paths,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Parses `file` as `schema_type`, reusing the cached descriptor when
    /// one exists for the same key.
    pub fn parse(&self, schema_type: SchemaType, file: &str) -> Result<Descriptor> {
        match schema_type {
            SchemaType::Protobuf => {
                let key = (schema_type, file.to_string());
                if let Some(d) = self.cache.lock().unwrap().get(&key) {
                    return Ok(Descriptor::Proto(d.clone()));
                }
                // Parse outside the lock; a losing racer's result is dropped.
                let parsed = Arc::new(ProtoDescriptor::parse(file, &self.import_paths)?);
                let mut cache = self.cache.lock().unwrap();
                let entry = cache.entry(key).or_insert(parsed);
                Ok(Descriptor::Proto(entry.clone()))
            }
        }
    }
}
