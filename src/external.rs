//! The adapter handed to the rule engine: one resolved (executor,
//! method) pair behaving as a single callable unit.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::executor::Executor;
use crate::registry::ServiceManager;

/// A scalar external function bound to its interface executor.
#[derive(Debug)]
pub struct ExternalFunction {
    executor: Arc<dyn Executor>,
    method: String,
}

impl ExternalFunction {
    pub(crate) fn new(executor: Arc<dyn Executor>, method: String) -> Self {
        ExternalFunction { executor, method }
    }

    /// The RPC method this function resolves to.
    pub fn method_name(&self) -> &str {
        &self.method
    }

    #[cfg(test)]
    pub(crate) fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    /// Invokes the bound method. Errors mean "could not evaluate" to the
    /// engine; they never abort the process.
    pub async fn invoke(&self, params: &[Value]) -> Result<Value> {
        self.executor.invoke_function(&self.method, params).await
    }

    /// Engine-style invocation: `(result, true)` on success,
    /// `(error message, false)` on failure.
    pub async fn exec(&self, params: &[Value]) -> (Value, bool) {
        match self.invoke(params).await {
            Ok(v) => (v, true),
            Err(e) => (Value::String(e.to_string()), false),
        }
    }

    /// External functions are scalar; aggregates are not supported.
    pub fn is_aggregate(&self) -> bool {
        false
    }

    /// Argument validation is deferred entirely to call time.
    pub fn validate(&self, _args: &[Value]) -> Result<()> {
        Ok(())
    }
}

/// The engine's pluggable external-function-source contract.
pub trait FunctionProvider {
    /// Resolves a function name to a callable.
    fn function(&self, name: &str) -> Result<ExternalFunction>;

    /// Maps a function name to its canonical form, reporting whether it
    /// is known.
    fn conv_name(&self, name: &str) -> (String, bool);

    /// Whether this provider ships a named function set; external
    /// services never do.
    fn has_function_set(&self, name: &str) -> bool;
}

impl FunctionProvider for ServiceManager {
    fn function(&self, name: &str) -> Result<ExternalFunction> {
        ServiceManager::function(self, name)
    }

    fn conv_name(&self, name: &str) -> (String, bool) {
        ServiceManager::conv_name(self, name)
    }

    fn has_function_set(&self, name: &str) -> bool {
        ServiceManager::has_function_set(self, name)
    }
}
