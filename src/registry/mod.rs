//! The service/function registry.
//!
//! Loads service descriptor files, persists service and function
//! mappings, resolves engine-visible function names to executors at
//! call time and manages the service lifecycle (create from a bundle,
//! delete, update).

pub mod config;
pub mod storage;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::error::{BridgeError, Result};
use crate::executor::{self, Executor};
use crate::external::ExternalFunction;
use crate::schema::{SchemaInfo, SchemaRegistry};

pub use config::{
    FunctionContainer, FunctionMapping, InterfaceConf, InterfaceInfo, Protocol, ServiceConf,
    ServiceCreationRequest, ServiceInfo,
};
use storage::KvStore;

/// Resolves function names to executors and owns every cache involved:
/// parsed schemas, service and function records, and the executor pool.
///
/// Shared freely across worker tasks; every cache is internally
/// synchronized.
pub struct ServiceManager {
    etc_dir: PathBuf,
    schemas: SchemaRegistry,
    service_kv: KvStore,
    function_kv: KvStore,
    service_cache: Mutex<HashMap<String, Arc<ServiceInfo>>>,
    function_cache: Mutex<HashMap<String, Arc<FunctionContainer>>>,
    executor_pool: Mutex<HashMap<String, Arc<dyn Executor>>>,
}

impl ServiceManager {
    /// Creates a manager over `etc_dir` (descriptor files plus a
    /// `schemas/` subdirectory) persisting records under `data_dir`.
    /// A failing store is fatal: the manager never reports ready.
    pub fn new(etc_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let etc_dir = etc_dir.into();
        let data_dir = data_dir.into();
        let schemas = SchemaRegistry::new(vec![etc_dir.join("schemas"), etc_dir.clone()]);
        let service_kv = KvStore::open(data_dir.join("services.json"))?;
        let function_kv = KvStore::open(data_dir.join("functions.json"))?;
        Ok(ServiceManager {
            etc_dir,
            schemas,
            service_kv,
            function_kv,
            service_cache: Mutex::new(HashMap::new()),
            function_cache: Mutex::new(HashMap::new()),
            executor_pool: Mutex::new(HashMap::new()),
        })
    }

    /// Parses every `*.json` descriptor in the services directory. A
    /// file that fails to parse is logged and skipped; the remaining
    /// services stay servable.
    pub fn init(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.etc_dir).map_err(|e| {
            BridgeError::persistence(format!(
                "cannot read services folder {}: {e}",
                self.etc_dir.display()
            ))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Err(e) = self.register_file(name) {
                error!("failed to load service file {}: {e}", path.display());
            }
        }
        Ok(())
    }

    /// Parses one `<name>.json` descriptor and persists the service and
    /// its function mappings.
    pub(crate) fn register_file(&self, name: &str) -> Result<()> {
        let path = self.etc_dir.join(format!("{name}.json"));
        let content = std::fs::read(&path).map_err(|e| {
            BridgeError::schema(format!("parse services file {name}.json failed: {e}"))
        })?;
        let conf: ServiceConf = serde_json::from_slice(&content).map_err(|e| {
            BridgeError::schema(format!("parse services file {name}.json failed: {e}"))
        })?;

        let mut info = ServiceInfo {
            about: conf.about,
            interfaces: HashMap::new(),
        };
        for (interface_name, binding) in conf.interfaces {
            let descriptor = self
                .schemas
                .parse(binding.schema_type, &binding.schema_file)
                .map_err(|e| {
                    e.prefixed(&format!("fail to parse schema file {}", binding.schema_file))
                })?;

            let alias: HashMap<&str, &str> = binding
                .functions
                .iter()
                .map(|f| (f.service_name.as_str(), f.name.as_str()))
                .collect();
            let methods = descriptor.functions();
            let functions: Vec<String> = methods
                .iter()
                .map(|m| alias.get(m.as_str()).map_or_else(|| m.clone(), |a| a.to_string()))
                .collect();

            for (function, method) in functions.iter().zip(&methods) {
                if let Some(existing) = self.lookup_function(function) {
                    if existing.service_name != name {
                        warn!(
                            "function {function} already registered by service {}, overwriting with {name}",
                            existing.service_name
                        );
                    }
                }
                let container = FunctionContainer {
                    service_name: name.to_string(),
                    interface_name: interface_name.clone(),
                    method_name: method.clone(),
                };
                if let Err(e) = self.function_kv.set(function, &container) {
                    error!("fail to save the function mapping for {function}, the function is not available: {e}");
                    continue;
                }
                self.function_cache.lock().unwrap().remove(function);
            }

            info.interfaces.insert(
                interface_name,
                InterfaceInfo {
                    description: binding.description,
                    addr: binding.address,
                    protocol: binding.protocol,
                    schema: SchemaInfo {
                        schema_type: binding.schema_type,
                        schema_file: binding.schema_file,
                    },
                    functions,
                    options: binding.options,
                },
            );
        }
        self.service_kv
            .set(name, &info)
            .map_err(|e| e.prefixed("fail to save the parsing result"))?;
        self.service_cache.lock().unwrap().remove(name);
        Ok(())
    }

    /// Resolves an engine-visible function name to a callable bound to
    /// its interface executor. Argument validation is deferred entirely
    /// to call time.
    pub fn function(&self, name: &str) -> Result<ExternalFunction> {
        let container = self
            .lookup_function(name)
            .ok_or_else(|| BridgeError::mapping(format!("service function {name} not found")))?;
        let service = self.lookup_service(&container.service_name).ok_or_else(|| {
            BridgeError::mapping(format!(
                "service function {name}'s service {} not found",
                container.service_name
            ))
        })?;
        let interface = service
            .interfaces
            .get(&container.interface_name)
            .ok_or_else(|| {
                BridgeError::mapping(format!(
                    "service function {name}'s interface {} not found",
                    container.interface_name
                ))
            })?;
        let exe = self.executor_for(&container.interface_name, interface)?;
        Ok(ExternalFunction::new(exe, container.method_name.clone()))
    }

    pub fn conv_name(&self, name: &str) -> (String, bool) {
        (name.to_string(), self.lookup_function(name).is_some())
    }

    pub fn has_function_set(&self, _name: &str) -> bool {
        false
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.lookup_service(name).is_some()
    }

    /// All executors with the same interface name share one instance;
    /// creation is guarded so concurrent first calls converge on it.
    fn executor_for(&self, name: &str, info: &InterfaceInfo) -> Result<Arc<dyn Executor>> {
        let mut pool = self.executor_pool.lock().unwrap();
        if let Some(e) = pool.get(name) {
            return Ok(e.clone());
        }
        let e = executor::new_executor(info, &self.schemas)
            .map_err(|err| err.prefixed(&format!("fail to initiate the executor for {name}")))?;
        pool.insert(name.to_string(), e.clone());
        Ok(e)
    }

    fn lookup_function(&self, name: &str) -> Option<Arc<FunctionContainer>> {
        if let Some(f) = self.function_cache.lock().unwrap().get(name) {
            return Some(f.clone());
        }
        match self.function_kv.get::<FunctionContainer>(name) {
            Ok(Some(f)) => {
                let f = Arc::new(f);
                self.function_cache
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), f.clone());
                Some(f)
            }
            Ok(None) => None,
            Err(e) => {
                error!("failed to get service function {name} from store: {e}");
                None
            }
        }
    }

    fn lookup_service(&self, name: &str) -> Option<Arc<ServiceInfo>> {
        if let Some(s) = self.service_cache.lock().unwrap().get(name) {
            return Some(s.clone());
        }
        match self.service_kv.get::<ServiceInfo>(name) {
            Ok(Some(s)) => {
                let s = Arc::new(s);
                self.service_cache
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), s.clone());
                Some(s)
            }
            Ok(None) => None,
            Err(e) => {
                error!("failed to get service {name} from store: {e}");
                None
            }
        }
    }

    // ** CRUD of the service files **

    pub fn list(&self) -> Result<Vec<String>> {
        self.service_kv.keys()
    }

    pub fn list_functions(&self) -> Result<Vec<String>> {
        self.function_kv.keys()
    }

    pub fn get(&self, name: &str) -> Result<ServiceInfo> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BridgeError::mapping(format!(
                "invalid name {name}: should not be empty"
            )));
        }
        self.lookup_service(name)
            .map(|s| (*s).clone())
            .ok_or_else(|| BridgeError::mapping(format!("can't get the service {name}")))
    }

    pub fn get_function(&self, name: &str) -> Result<FunctionContainer> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BridgeError::mapping(format!(
                "invalid name {name}: should not be empty"
            )));
        }
        self.lookup_function(name)
            .map(|f| (*f).clone())
            .ok_or_else(|| BridgeError::mapping(format!("can't get the service function {name}")))
    }

    /// Downloads a service bundle, verifies it contains the descriptor,
    /// extracts it under the services directory and registers it. The
    /// downloaded archive is removed afterwards, success or not.
    pub async fn create(&self, req: &ServiceCreationRequest) -> Result<()> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(BridgeError::mapping(format!(
                "invalid name {}: should not be empty",
                req.name
            )));
        }
        if self.service_kv.get::<ServiceInfo>(name)?.is_some() {
            return Err(BridgeError::persistence(format!("service {name} exist")));
        }
        if url::Url::parse(&req.file).is_err() || !req.file.ends_with(".zip") {
            return Err(BridgeError::invocation(format!(
                "invalid file path {}",
                req.file
            )));
        }
        let zip_path = self.etc_dir.join(format!("{name}.zip"));
        let result = self.download_and_register(name, &req.file, &zip_path).await;
        let _ = std::fs::remove_file(&zip_path);
        result
    }

    async fn download_and_register(&self, name: &str, uri: &str, zip_path: &Path) -> Result<()> {
        let response = reqwest::get(uri)
            .await
            .map_err(|e| BridgeError::connection(format!("fail to download file {uri}: {e}")))?;
        if !response.status().is_success() {
            return Err(BridgeError::connection(format!(
                "fail to download file {uri}: status {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BridgeError::connection(format!("fail to download file {uri}: {e}")))?;
        std::fs::write(zip_path, &bytes).map_err(|e| {
            BridgeError::persistence(format!("cannot write {}: {e}", zip_path.display()))
        })?;
        self.unzip(name, zip_path)?;
        self.register_file(name)
    }

    fn unzip(&self, name: &str, src: &Path) -> Result<()> {
        let file = std::fs::File::open(src)
            .map_err(|e| BridgeError::persistence(format!("cannot open archive: {e}")))?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| BridgeError::persistence(format!("invalid zip archive: {e}")))?;
        let base_name = format!("{}.json", name.to_lowercase());
        let found = archive
            .file_names()
            .any(|n| n.to_lowercase() == base_name);
        if !found {
            return Err(BridgeError::persistence(format!(
                "cannot find the json descriptor file {base_name} for service"
            )));
        }
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| BridgeError::persistence(format!("invalid zip entry: {e}")))?;
            let Some(rel) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                continue;
            };
            let target = self.etc_dir.join(rel);
            if entry.is_dir() {
                std::fs::create_dir_all(&target).map_err(|e| {
                    BridgeError::persistence(format!("cannot extract archive: {e}"))
                })?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BridgeError::persistence(format!("cannot extract archive: {e}"))
                })?;
            }
            let mut out = std::fs::File::create(&target).map_err(|e| {
                BridgeError::persistence(format!("cannot extract {}: {e}", target.display()))
            })?;
            std::io::copy(&mut entry, &mut out).map_err(|e| {
                BridgeError::persistence(format!("cannot extract {}: {e}", target.display()))
            })?;
        }
        Ok(())
    }

    /// Removes the persisted service, every function mapping it owned,
    /// the descriptor file, and the service's in-memory cache entries.
    pub fn delete(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BridgeError::mapping(format!(
                "invalid name {name}: should not be empty"
            )));
        }
        self.delete_service_functions(name);
        self.service_cache.lock().unwrap().remove(name);
        self.service_kv.delete(name)?;
        let path = self.etc_dir.join(format!("{name}.json"));
        if let Err(e) = std::fs::remove_file(&path) {
            error!("remove service json fails: {e}");
        }
        Ok(())
    }

    fn delete_service_functions(&self, service: &str) {
        let Some(info) = self.lookup_service(service) else {
            return;
        };
        for interface in info.interfaces.values() {
            for function in &interface.functions {
                // only drop mappings this service still owns
                let owned = self
                    .lookup_function(function)
                    .map(|f| f.service_name == service)
                    .unwrap_or(false);
                if !owned {
                    continue;
                }
                self.function_cache.lock().unwrap().remove(function);
                if let Err(e) = self.function_kv.delete(function) {
                    error!("fail to delete function mapping {function}: {e}");
                }
            }
        }
    }

    /// Delete followed by create.
    pub async fn update(&self, req: &ServiceCreationRequest) -> Result<()> {
        self.delete(&req.name)?;
        self.create(req).await
    }
}
