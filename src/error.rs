//! Top-level error type for Genesis
//!
//! Each subsystem defines its own error enum next to its code; this
//! aggregate exists for callers that drive several subsystems and want a
//! single fallible surface. Faults never cross the public API as panics.

use thiserror::Error;

/// Aggregate error for Genesis operations
#[derive(Debug, Error)]
pub enum GenesisError {
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),

    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),

    #[error(transparent)]
    Rpc(#[from] crate::rpc::RpcError),

    #[error(transparent)]
    Service(#[from] crate::service::ServiceError),

    #[error(transparent)]
    Agent(#[from] crate::agent::AgentError),

    #[error(transparent)]
    Interface(#[from] crate::interface::InterfaceError),

    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
