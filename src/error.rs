use thiserror::Error;

/// Global error type for the bridge.
///
/// One variant per failure class; the class decides both how a failure
/// propagates (load-time errors abort a single registration, runtime
/// errors surface to the calling function) and whether the REST executor
/// may retry it.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed or unresolvable schema file.
    #[error("schema error: {0}")]
    Schema(String),

    /// URI/body mapping or name resolution failure.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Parameter count or type mismatch against a message type.
    #[error("binding error: {0}")]
    Binding(String),

    /// Dial, timeout or socket failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Remote fault: non-2xx HTTP, RPC error or undecodable response.
    #[error("invocation error: {0}")]
    Invocation(String),

    /// Key-value store or descriptor file persistence failure.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl BridgeError {
    pub fn schema(msg: impl Into<String>) -> Self {
        BridgeError::Schema(msg.into())
    }

    pub fn mapping(msg: impl Into<String>) -> Self {
        BridgeError::Mapping(msg.into())
    }

    pub fn binding(msg: impl Into<String>) -> Self {
        BridgeError::Binding(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        BridgeError::Connection(msg.into())
    }

    pub fn invocation(msg: impl Into<String>) -> Self {
        BridgeError::Invocation(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        BridgeError::Persistence(msg.into())
    }

    /// Whether a failed call may be retried. Only transient network
    /// failures qualify; application errors fail immediately.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BridgeError::Connection(_))
    }

    /// Rewraps the error with a context prefix, keeping the class.
    pub fn prefixed(self, prefix: &str) -> Self {
        match self {
            BridgeError::Schema(m) => BridgeError::Schema(format!("{prefix}: {m}")),
            BridgeError::Mapping(m) => BridgeError::Mapping(format!("{prefix}: {m}")),
            BridgeError::Binding(m) => BridgeError::Binding(format!("{prefix}: {m}")),
            BridgeError::Connection(m) => BridgeError::Connection(format!("{prefix}: {m}")),
            BridgeError::Invocation(m) => BridgeError::Invocation(format!("{prefix}: {m}")),
            BridgeError::Persistence(m) => BridgeError::Persistence(format!("{prefix}: {m}")),
        }
    }

    /// The message without the class label.
    pub fn message(&self) -> &str {
        match self {
            BridgeError::Schema(m)
            | BridgeError::Mapping(m)
            | BridgeError::Binding(m)
            | BridgeError::Connection(m)
            | BridgeError::Invocation(m)
            | BridgeError::Persistence(m) => m,
        }
    }
}

/// A specialized Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
