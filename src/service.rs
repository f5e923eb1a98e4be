//! Service base: host, advertise, and serve functions
//!
//! A service registers its functions before `run()`, advertises each as a
//! durable capability, then serves its RPC channel until closed. Unknown
//! functions, unparsable arguments, and schema violations become error
//! replies, never panics; handler failures degrade the component briefly
//! and are reported on the chain topic.
//!
//! Services publish capabilities and never subscribe to them; only agents
//! and interfaces consume the capability topic.

use crate::domain_types::{
    CallId, CapabilityTag, ChainId, FunctionId, FunctionName, ParticipantGuid, RequestId,
    ServiceName,
};
use crate::lifecycle::{ComponentKind, ComponentState, LifecycleError, StateTracker};
use crate::messages::{
    ChainEvent, ChainEventKind, ComponentLifecycleEvent, EventCategory, FunctionCapability,
    FunctionReply, FunctionRequest,
};
use crate::participant::Participant;
use crate::rpc::{Replier, RpcError};
use crate::transport::{TopicWriter, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },

    #[error("rpc error: {source}")]
    Rpc {
        #[from]
        source: RpcError,
    },

    #[error("lifecycle error: {source}")]
    Lifecycle {
        #[from]
        source: LifecycleError,
    },

    #[error("invalid function name: {reason}")]
    InvalidFunctionName { reason: String },

    #[error("invalid parameter schema for {function}: {reason}")]
    InvalidSchema { function: FunctionName, reason: String },

    #[error("function already registered: {function}")]
    AlreadyRegistered { function: FunctionName },

    #[error("service is already running")]
    AlreadyRunning,

    #[error("registration is closed once the service is running")]
    RegistrationClosed,
}

/// Errors a function implementation may raise
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Request metadata handed to function implementations
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// GUID of the calling participant
    pub caller_id: ParticipantGuid,
    /// Chain the invocation belongs to
    pub chain_id: ChainId,
    /// This invocation's call id
    pub call_id: CallId,
    /// The wire request id
    pub request_id: RequestId,
    /// The invoked function
    pub function_id: FunctionId,
}

/// A locally implemented, remotely invocable function
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// Invokes the implementation with validated JSON arguments
    async fn invoke(&self, arguments: Value, context: RequestContext)
    -> Result<Value, HandlerError>;
}

/// Adapts an async closure into a [`FunctionHandler`]
pub struct FnHandler<F> {
    inner: F,
}

#[async_trait]
impl<F, Fut> FunctionHandler for FnHandler<F>
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn invoke(
        &self,
        arguments: Value,
        context: RequestContext,
    ) -> Result<Value, HandlerError> {
        (self.inner)(arguments, context).await
    }
}

/// Wraps an async closure as a handler
pub fn handler_fn<F, Fut>(inner: F) -> FnHandler<F>
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, HandlerError>> + Send,
{
    FnHandler { inner }
}

/// Delivery hint recorded with each registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Read-only; safe to retry at the application layer
    Query,
    /// Mutates provider state
    Command,
}

/// Local binding from a function id to its implementation
pub struct RegisteredFunction {
    /// Stable function identity
    pub id: FunctionId,
    /// Function name as advertised
    pub name: FunctionName,
    /// Advertised description
    pub description: String,
    /// The raw parameter schema
    pub schema: Value,
    /// Advertised capability tags
    pub tags: Vec<CapabilityTag>,
    /// Delivery hint
    pub operation: OperationKind,
    validator: jsonschema::Validator,
    handler: Arc<dyn FunctionHandler>,
}

/// Hosts a set of functions and serves their RPC channel
pub struct ServiceBase {
    participant: Arc<Participant>,
    service_name: ServiceName,
    functions: DashMap<FunctionId, Arc<RegisteredFunction>>,
    capability_writer: TopicWriter<FunctionCapability>,
    replier: Mutex<Option<Replier<FunctionRequest, FunctionReply>>>,
    tracker: StateTracker,
    cancel: CancellationToken,
    running: AtomicBool,
    closed: AtomicBool,
}

impl ServiceBase {
    /// Stands up the capability writer and RPC replier
    ///
    /// # Errors
    /// Fails when the fabric endpoints cannot be created.
    pub async fn new(
        participant: Arc<Participant>,
        service_name: ServiceName,
    ) -> Result<Self, ServiceError> {
        let capability_writer = participant.capability_writer()?;
        let replier = Replier::new(&participant, service_name.clone())?;
        let tracker = StateTracker::new(
            participant.guid(),
            service_name.to_string(),
            ComponentKind::Service,
            participant.monitoring(),
        )
        .await;
        Ok(Self {
            participant,
            service_name,
            functions: DashMap::new(),
            capability_writer,
            replier: Mutex::new(Some(replier)),
            tracker,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// The RPC channel identity of this service
    #[must_use]
    pub fn service_name(&self) -> &ServiceName {
        &self.service_name
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ComponentState {
        self.tracker.state()
    }

    /// Registers a function before the service runs.
    ///
    /// The function id is derived from the service identity and function
    /// name, so the same registration always advertises the same id.
    ///
    /// # Errors
    /// Rejects invalid names, uncompilable schemas, duplicates, and
    /// registration after `run()`.
    pub fn register_function(
        &self,
        name: &str,
        description: &str,
        schema: Value,
        tags: Vec<CapabilityTag>,
        operation: OperationKind,
        handler: Arc<dyn FunctionHandler>,
    ) -> Result<FunctionId, ServiceError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ServiceError::RegistrationClosed);
        }
        let function_name = FunctionName::try_new(name.to_string()).map_err(|e| {
            ServiceError::InvalidFunctionName {
                reason: e.to_string(),
            }
        })?;
        let validator =
            jsonschema::validator_for(&schema).map_err(|e| ServiceError::InvalidSchema {
                function: function_name.clone(),
                reason: e.to_string(),
            })?;
        let id = FunctionId::derive(&self.service_name, &function_name);
        if self.functions.contains_key(&id) {
            return Err(ServiceError::AlreadyRegistered {
                function: function_name,
            });
        }
        self.functions.insert(
            id,
            Arc::new(RegisteredFunction {
                id,
                name: function_name,
                description: description.to_string(),
                schema,
                tags,
                operation,
                validator,
                handler,
            }),
        );
        Ok(id)
    }

    /// Advertises all functions and serves requests until closed
    ///
    /// # Errors
    /// Fails when advertisement cannot complete; serve-loop faults become
    /// error replies, not errors from `run`.
    #[instrument(name = "service_run", skip(self), fields(service = %self.service_name))]
    pub async fn run(&self) -> Result<(), ServiceError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning);
        }
        self.advertise_all().await?;

        let mut replier = self
            .replier
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(ServiceError::AlreadyRunning)?;

        info!(service = %self.service_name, functions = self.functions.len(), "service serving");
        loop {
            let request = tokio::select! {
                () = self.cancel.cancelled() => break,
                request = replier.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.handle_request(&replier, request).await;
        }
        Ok(())
    }

    /// Publishes every registered function and walks the discovery states
    async fn advertise_all(&self) -> Result<(), ServiceError> {
        self.tracker
            .transition(ComponentState::Discovering, EventCategory::AgentInit)
            .await?;

        let monitoring = self.participant.monitoring();
        for entry in self.functions.iter() {
            let function = entry.value();
            let capability = self.capability_of(function);
            self.capability_writer
                .write(&capability.key(), &capability)
                .await?;

            monitoring
                .publish_lifecycle(&ComponentLifecycleEvent {
                    component_id: self.participant.guid(),
                    component_name: function.name.to_string(),
                    component_type: ComponentKind::Service,
                    previous_state: None,
                    new_state: ComponentState::Discovering,
                    category: EventCategory::NodeDiscovery,
                    timestamp: Utc::now(),
                })
                .await;
            monitoring
                .publish_lifecycle(&ComponentLifecycleEvent {
                    component_id: self.participant.guid(),
                    component_name: format!("{} -> {}", self.service_name, function.id),
                    component_type: ComponentKind::Service,
                    previous_state: None,
                    new_state: ComponentState::Discovering,
                    category: EventCategory::EdgeDiscovery,
                    timestamp: Utc::now(),
                })
                .await;
        }

        self.tracker
            .transition(ComponentState::Ready, EventCategory::AgentReady)
            .await?;
        Ok(())
    }

    fn capability_of(&self, function: &RegisteredFunction) -> FunctionCapability {
        FunctionCapability {
            function_id: function.id,
            name: function.name.clone(),
            description: function.description.clone(),
            provider_id: self.participant.guid(),
            parameter_schema: function.schema.to_string(),
            capabilities: function.tags.clone(),
            performance_metrics: None,
            security_requirements: None,
            classification: None,
            last_seen: Utc::now(),
            service_name: self.service_name.clone(),
        }
    }

    async fn handle_request(
        &self,
        replier: &Replier<FunctionRequest, FunctionReply>,
        request: FunctionRequest,
    ) {
        let Some(function) = self.functions.get(&request.function_id).map(|e| e.value().clone())
        else {
            self.send_reply(
                replier,
                FunctionReply::failure(
                    &request,
                    format!("unknown function: {}", request.function_id),
                ),
            )
            .await;
            return;
        };

        let arguments: Value = match serde_json::from_str(&request.parameters) {
            Ok(arguments) => arguments,
            Err(e) => {
                self.emit_chain(&request, ChainEventKind::CallError, Some(e.to_string()))
                    .await;
                self.send_reply(
                    replier,
                    FunctionReply::failure(&request, format!("invalid parameters JSON: {e}")),
                )
                .await;
                return;
            }
        };

        if self.participant.config().strict_schema_validation {
            if let Err(e) = function.validator.validate(&arguments) {
                self.emit_chain(&request, ChainEventKind::CallError, Some(e.to_string()))
                    .await;
                self.send_reply(
                    replier,
                    FunctionReply::failure(&request, format!("schema validation failed: {e}")),
                )
                .await;
                return;
            }
        }

        self.emit_chain(&request, ChainEventKind::CallStart, None).await;
        if let Err(e) = self
            .tracker
            .transition(ComponentState::Busy, EventCategory::StateChange)
            .await
        {
            warn!(%e, "state tracker rejected BUSY");
        }

        let context = RequestContext {
            caller_id: request.metadata.caller_id,
            chain_id: request.metadata.chain_id,
            call_id: request.metadata.call_id,
            request_id: request.request_id,
            function_id: request.function_id,
        };

        match function.handler.invoke(arguments, context).await {
            Ok(result) => {
                self.emit_chain(&request, ChainEventKind::CallComplete, None)
                    .await;
                self.send_reply(replier, FunctionReply::success(&request, result.to_string()))
                    .await;
                if let Err(e) = self
                    .tracker
                    .transition(ComponentState::Ready, EventCategory::StateChange)
                    .await
                {
                    warn!(%e, "state tracker rejected READY");
                }
            }
            Err(error) => {
                let reason = error.to_string();
                self.emit_chain(&request, ChainEventKind::CallError, Some(reason.clone()))
                    .await;
                self.participant
                    .monitoring()
                    .publish_log(
                        "ERROR",
                        format!("invocation failed for {}: {reason}", request.function_id),
                    )
                    .await;
                self.send_reply(
                    replier,
                    FunctionReply::failure(&request, format!("invocation failed: {reason}")),
                )
                .await;
                // Brief DEGRADED dip, then back to serving.
                if let Err(e) = self
                    .tracker
                    .transition(ComponentState::Degraded, EventCategory::StateChange)
                    .await
                {
                    warn!(%e, "state tracker rejected DEGRADED");
                }
                if let Err(e) = self
                    .tracker
                    .transition(ComponentState::Ready, EventCategory::StateChange)
                    .await
                {
                    warn!(%e, "state tracker rejected READY");
                }
            }
        }
    }

    async fn send_reply(
        &self,
        replier: &Replier<FunctionRequest, FunctionReply>,
        reply: FunctionReply,
    ) {
        // Write failures are logged, not retried; the requester's timeout
        // governs recovery.
        if let Err(error) = replier.reply(&reply).await {
            warn!(%error, request_id = %reply.request_id, "failed to write reply");
            self.participant
                .monitoring()
                .publish_log(
                    "ERROR",
                    format!("failed to write reply {}: {error}", reply.request_id),
                )
                .await;
        }
    }

    async fn emit_chain(
        &self,
        request: &FunctionRequest,
        kind: ChainEventKind,
        status: Option<String>,
    ) {
        self.participant
            .monitoring()
            .publish_chain(&ChainEvent {
                chain_id: request.metadata.chain_id,
                call_id: request.metadata.call_id,
                source: request.metadata.caller_id,
                target: Some(self.participant.guid()),
                function_id: Some(request.function_id),
                kind,
                status,
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Disposes advertisements, stops serving, and goes OFFLINE; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        for entry in self.functions.iter() {
            let key = entry.value().id.to_string();
            if let Err(error) = self.capability_writer.dispose(&key).await {
                warn!(%error, function_id = %entry.value().id, "failed to dispose advertisement");
            }
        }
        if let Err(e) = self
            .tracker
            .transition(ComponentState::Offline, EventCategory::AgentShutdown)
            .await
        {
            warn!(%e, "state tracker rejected OFFLINE");
        }
    }
}
