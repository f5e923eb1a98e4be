//! Wire types for the well-known topics
//!
//! Every type here crosses the fabric as JSON. Payload fields that carry
//! user data (`parameters`, `result`, `parameter_schema`) are JSON strings
//! so providers and callers agree on encoding without sharing Rust types.

use crate::domain_types::{
    AgentId, CallId, CapabilityTag, ChainId, FunctionId, FunctionName, ParticipantGuid,
    PreferredName, RequestId, ServiceName,
};
use crate::lifecycle::{ComponentKind, ComponentState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A published description of one remotely invocable function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCapability {
    /// Globally unique, stable across republish
    pub function_id: FunctionId,
    /// Function name as callers see it
    pub name: FunctionName,
    /// Human/LLM-facing description
    pub description: String,
    /// GUID of the advertising participant
    pub provider_id: ParticipantGuid,
    /// JSON-schema for the function's parameters, as a JSON string
    pub parameter_schema: String,
    /// Free-form capability tags
    pub capabilities: Vec<CapabilityTag>,
    /// Optional provider-reported performance hints, JSON string
    pub performance_metrics: Option<String>,
    /// Optional security requirements, JSON string
    pub security_requirements: Option<String>,
    /// Optional data classification label
    pub classification: Option<String>,
    /// Locally stamped on every registry upsert
    pub last_seen: DateTime<Utc>,
    /// RPC channel the function is served on
    pub service_name: ServiceName,
}

impl FunctionCapability {
    /// Instance key on the capability topic
    #[must_use]
    pub fn key(&self) -> String {
        self.function_id.to_string()
    }
}

/// An agent's durable self-announcement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Stable agent identity
    pub agent_id: AgentId,
    /// GUID of the announcing participant
    pub instance_id: ParticipantGuid,
    /// Free-form announcement text
    pub message: String,
    /// Name interfaces present to users
    pub preferred_name: PreferredName,
    /// RPC channel the agent serves on
    pub service_name: ServiceName,
    /// Whether interfaces may auto-select this agent
    pub default_capable: bool,
}

impl AgentRegistration {
    /// Instance key on the registration topic
    #[must_use]
    pub fn key(&self) -> String {
        self.agent_id.to_string()
    }
}

/// Correlation metadata carried on every RPC sample
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// GUID of the calling participant
    pub caller_id: ParticipantGuid,
    /// Causal chain this call belongs to
    pub chain_id: ChainId,
    /// This call's identifier within the chain
    pub call_id: CallId,
}

/// One function invocation on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRequest {
    /// Unique per invocation; replies correlate on this
    pub request_id: RequestId,
    /// Target function
    pub function_id: FunctionId,
    /// Arguments as a JSON object string
    pub parameters: String,
    /// Caller-side timestamp
    pub timestamp: DateTime<Utc>,
    /// Correlation metadata
    pub metadata: RequestMetadata,
}

/// Outcome of one function invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionReply {
    /// Mirrors the request's id
    pub request_id: RequestId,
    /// Mirrors the request's target
    pub function_id: FunctionId,
    /// Return value as a JSON string; empty on failure
    pub result: String,
    /// Whether the invocation succeeded
    pub success: bool,
    /// Short, actionable failure description
    pub error_message: Option<String>,
    /// Provider-side timestamp
    pub timestamp: DateTime<Utc>,
    /// Correlation metadata echoed from the request
    pub metadata: RequestMetadata,
}

impl FunctionReply {
    /// A failure reply mirroring a request
    #[must_use]
    pub fn failure(request: &FunctionRequest, error_message: impl Into<String>) -> Self {
        Self {
            request_id: request.request_id,
            function_id: request.function_id,
            result: String::new(),
            success: false,
            error_message: Some(error_message.into()),
            timestamp: Utc::now(),
            metadata: request.metadata,
        }
    }

    /// A success reply mirroring a request
    #[must_use]
    pub fn success(request: &FunctionRequest, result: String) -> Self {
        Self {
            request_id: request.request_id,
            function_id: request.function_id,
            result,
            success: true,
            error_message: None,
            timestamp: Utc::now(),
            metadata: request.metadata,
        }
    }
}

/// A text request sent to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Unique per request; replies correlate on this
    pub request_id: RequestId,
    /// The user's request text
    pub text: String,
    /// Chain the request belongs to; downstream calls inherit it
    pub chain_id: ChainId,
    /// GUID of the calling participant
    pub caller_id: ParticipantGuid,
    /// Caller-side timestamp
    pub timestamp: DateTime<Utc>,
}

/// An agent's final answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    /// Mirrors the request's id
    pub request_id: RequestId,
    /// Final response text; empty on failure
    pub text: String,
    /// Whether the pipeline completed
    pub success: bool,
    /// Short failure description
    pub error_message: Option<String>,
    /// Agent-side timestamp
    pub timestamp: DateTime<Utc>,
}

/// Correlation accessor shared by RPC wire types
pub trait Correlated {
    /// The identifier replies are matched on
    fn request_id(&self) -> RequestId;
}

impl Correlated for FunctionRequest {
    fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Correlated for FunctionReply {
    fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Correlated for AgentRequest {
    fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Correlated for AgentReply {
    fn request_id(&self) -> RequestId {
        self.request_id
    }
}

/// Kind of step in a request's causal chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEventKind {
    /// An RPC call left the caller
    CallStart,
    /// The call completed successfully
    CallComplete,
    /// The call failed
    CallError,
}

/// One step in a request's causal chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Stable across all steps of one end-user request
    pub chain_id: ChainId,
    /// Unique per RPC call within the chain
    pub call_id: CallId,
    /// Originating participant
    pub source: ParticipantGuid,
    /// Target participant, when known
    pub target: Option<ParticipantGuid>,
    /// Function involved, when the step is a function call
    pub function_id: Option<FunctionId>,
    /// Step kind
    pub kind: ChainEventKind,
    /// Short status or error description
    pub status: Option<String>,
    /// Emitter-side timestamp
    pub timestamp: DateTime<Utc>,
}

impl ChainEvent {
    /// Instance key on the chain topic
    #[must_use]
    pub fn key(&self) -> String {
        self.call_id.to_string()
    }
}

/// Discovery/state category of a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCategory {
    /// A function node appeared on the bus
    NodeDiscovery,
    /// A provider-to-function edge appeared
    EdgeDiscovery,
    /// A plain state change
    StateChange,
    /// Component began initializing
    AgentInit,
    /// Component finished advertising and is serving
    AgentReady,
    /// Component is shutting down
    AgentShutdown,
}

/// One component state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentLifecycleEvent {
    /// GUID of the transitioning component's participant
    pub component_id: ParticipantGuid,
    /// Human-readable component name
    pub component_name: String,
    /// What kind of component this is
    pub component_type: ComponentKind,
    /// State before the transition; absent for the initial event
    pub previous_state: Option<ComponentState>,
    /// State after the transition
    pub new_state: ComponentState,
    /// Why the transition happened
    pub category: EventCategory,
    /// Emitter-side timestamp
    pub timestamp: DateTime<Utc>,
}

impl ComponentLifecycleEvent {
    /// Instance key on the lifecycle topic
    #[must_use]
    pub fn key(&self) -> String {
        self.component_id.to_string()
    }
}

/// Participant liveliness notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivelinessUpdate {
    /// The participant whose liveliness changed
    pub component_id: ParticipantGuid,
    /// Whether the participant is alive
    pub alive: bool,
    /// Emitter-side timestamp
    pub timestamp: DateTime<Utc>,
}

/// One record on the best-effort log stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    /// The logging participant
    pub component_id: ParticipantGuid,
    /// Severity label
    pub level: String,
    /// Log body
    pub message: String,
    /// Emitter-side timestamp
    pub timestamp: DateTime<Utc>,
}
