//! # Genesis - Distributed Multi-Agent Framework
//!
//! Genesis is a framework for building distributed multi-agent systems on
//! a data-centric publish/subscribe fabric. Services advertise typed
//! functions, agents discover them dynamically and invoke them through a
//! two-stage LLM pipeline, and interfaces bridge users into the system --
//! all over brokerless, event-driven discovery with schema-validated RPC
//! and observable lifecycle/chain monitoring.
//!
//! ## Architecture
//!
//! ```rust,no_run
//! use genesis::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), GenesisError> {
//! let fabric = MemoryFabric::new();
//!
//! // A service hosting one function.
//! let participant = Arc::new(Participant::new(&fabric, GenesisConfig::development()).await?);
//! let service = ServiceBase::new(participant, ServiceName::try_new("calc".to_string()).unwrap()).await?;
//! service.register_function(
//!     "add",
//!     "Adds two numbers",
//!     serde_json::json!({"type": "object", "properties": {
//!         "x": {"type": "number"}, "y": {"type": "number"}
//!     }, "required": ["x", "y"]}),
//!     vec![],
//!     OperationKind::Query,
//!     Arc::new(handler_fn(|args: serde_json::Value, _ctx: RequestContext| async move {
//!         Ok::<_, HandlerError>(serde_json::json!(args["x"].as_f64().unwrap_or(0.0)
//!             + args["y"].as_f64().unwrap_or(0.0)))
//!     })),
//! )?;
//! tokio::spawn(async move { service.run().await });
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod agent;
pub mod config;
pub mod domain_types;
pub mod error;
pub mod interface;
pub mod lifecycle;
pub mod llm;
pub mod messages;
pub mod monitoring;
pub mod participant;
pub mod registry;
pub mod rpc;
pub mod service;
pub mod transport;

// Re-export the public surface
pub use crate::agent::{AgentBase, AgentContext, AgentError};
pub use crate::config::{ConfigError, GenesisConfig};
pub use crate::domain_types::{
    AgentId, CallId, CapabilityTag, ChainId, DiscoveryTimeoutSecs, DomainId, FunctionId,
    FunctionName, LivenessTimeoutSecs, MaxExecutorTurns, MaxPayloadBytes, ParticipantGuid,
    PreferredName, RequestId, RpcTimeoutSecs, ServiceName,
};
pub use crate::error::GenesisError;
pub use crate::interface::{
    AgentDirectory, AgentHandle, DirectoryListener, InterfaceBase, InterfaceError,
};
pub use crate::lifecycle::{ComponentKind, ComponentState, LifecycleError, StateTracker};
pub use crate::llm::{
    ChatExecutor, ChatMessage, ChatRole, ExecutorTurn, FunctionClassifier, FunctionDigest,
    LlmError, ToolCallRequest, ToolDefinition,
};
pub use crate::messages::{
    AgentRegistration, AgentReply, AgentRequest, ChainEvent, ChainEventKind,
    ComponentLifecycleEvent, EventCategory, FunctionCapability, FunctionReply, FunctionRequest,
    LivelinessUpdate, LogMessage, RequestMetadata,
};
pub use crate::monitoring::MonitoringPublisher;
pub use crate::participant::Participant;
pub use crate::registry::{CapabilityChange, CapabilityRegistry, RegistryError};
pub use crate::rpc::{Replier, Requester, RpcError};
pub use crate::service::{
    FunctionHandler, HandlerError, OperationKind, RegisteredFunction, RequestContext, ServiceBase,
    ServiceError, handler_fn,
};
pub use crate::transport::memory::MemoryFabric;
pub use crate::transport::{
    Durability, Fabric, FabricPeer, InstanceState, Reliability, Sample, TopicDescriptor,
    TopicKind, TopicReader, TopicWriter, TransportError, topics,
};
