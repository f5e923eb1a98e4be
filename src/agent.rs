//! Agent base: announcement, agent RPC, and the function-calling pipeline
//!
//! An agent announces itself durably so late-joining interfaces discover
//! it, serves `AgentRequest`s on its own RPC channel, and fulfills each
//! request with a two-stage pipeline: a cheap classifier narrows the
//! advertised function set, then an executor reasons over the selection
//! and issues function calls that the agent forwards over RPC. Peer
//! agents are called through the same requester machinery.

use crate::domain_types::{
    AgentId, CallId, ChainId, FunctionId, PreferredName, RequestId, ServiceName,
};
use crate::lifecycle::{ComponentKind, ComponentState, LifecycleError, StateTracker};
use crate::llm::{
    ChatExecutor, ChatMessage, ExecutorTurn, FunctionClassifier, FunctionDigest, LlmError,
    ToolCallRequest, ToolDefinition,
};
use crate::messages::{
    AgentRegistration, AgentReply, AgentRequest, ChainEvent, ChainEventKind, EventCategory,
    FunctionCapability, FunctionReply, FunctionRequest, RequestMetadata,
};
use crate::participant::Participant;
use crate::registry::{CapabilityRegistry, RegistryError};
use crate::rpc::{Replier, Requester, RpcError};
use crate::transport::{TopicWriter, TransportError};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
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

    #[error("registry error: {source}")]
    Registry {
        #[from]
        source: RegistryError,
    },

    #[error("lifecycle error: {source}")]
    Lifecycle {
        #[from]
        source: LifecycleError,
    },

    #[error("executor error: {source}")]
    Executor {
        #[from]
        source: LlmError,
    },

    #[error("no capability available to fulfill the request")]
    NoCapabilityAvailable,

    #[error("executor exceeded {limit} turns without a final answer")]
    ExecutorLoopLimit { limit: u32 },

    #[error("processing cancelled")]
    Cancelled,

    #[error("agent is already running")]
    AlreadyRunning,
}

/// Caller-supplied per-turn conversation context
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    /// Messages preceding the current request
    pub prior_messages: Vec<ChatMessage>,
}

/// An LLM-backed reasoner on the bus
pub struct AgentBase {
    participant: Arc<Participant>,
    registration: AgentRegistration,
    registry: Arc<CapabilityRegistry>,
    classifier: Arc<dyn FunctionClassifier>,
    executor: Arc<dyn ChatExecutor>,
    registration_writer: TopicWriter<AgentRegistration>,
    replier: Mutex<Option<Replier<AgentRequest, AgentReply>>>,
    function_requesters: DashMap<ServiceName, Arc<Requester<FunctionRequest, FunctionReply>>>,
    agent_requesters: DashMap<ServiceName, Arc<Requester<AgentRequest, AgentReply>>>,
    tracker: StateTracker,
    cancel: CancellationToken,
    running: AtomicBool,
    closed: AtomicBool,
}

impl AgentBase {
    /// Stands up the registry listener, announcement writer, and replier
    ///
    /// # Errors
    /// Fails when any fabric endpoint cannot be created.
    pub async fn new(
        participant: Arc<Participant>,
        preferred_name: PreferredName,
        service_name: ServiceName,
        classifier: Arc<dyn FunctionClassifier>,
        executor: Arc<dyn ChatExecutor>,
    ) -> Result<Self, AgentError> {
        let registry = Arc::new(CapabilityRegistry::spawn(&participant)?);
        let registration_writer = participant.registration_writer()?;
        let replier = Replier::new(&participant, service_name.clone())?;
        let registration = AgentRegistration {
            agent_id: AgentId::generate(),
            instance_id: participant.guid(),
            message: format!("agent {preferred_name} online"),
            preferred_name: preferred_name.clone(),
            service_name,
            default_capable: true,
        };
        let tracker = StateTracker::new(
            participant.guid(),
            preferred_name.to_string(),
            ComponentKind::Agent,
            participant.monitoring(),
        )
        .await;
        Ok(Self {
            participant,
            registration,
            registry,
            classifier,
            executor,
            registration_writer,
            replier: Mutex::new(Some(replier)),
            function_requesters: DashMap::new(),
            agent_requesters: DashMap::new(),
            tracker,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// This agent's announcement record
    #[must_use]
    pub fn registration(&self) -> &AgentRegistration {
        &self.registration
    }

    /// The capability registry maintained for this agent
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ComponentState {
        self.tracker.state()
    }

    /// Announces the agent and serves requests until closed
    ///
    /// # Errors
    /// Fails when the announcement cannot be published.
    #[instrument(name = "agent_run", skip(self), fields(agent = %self.registration.preferred_name))]
    pub async fn run(&self) -> Result<(), AgentError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning);
        }
        self.tracker
            .transition(ComponentState::Discovering, EventCategory::AgentInit)
            .await?;
        self.registration_writer
            .write(&self.registration.key(), &self.registration)
            .await?;
        self.tracker
            .transition(ComponentState::Ready, EventCategory::AgentReady)
            .await?;

        let mut replier = self
            .replier
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(AgentError::AlreadyRunning)?;

        info!(agent = %self.registration.preferred_name, "agent serving");
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

    async fn handle_request(&self, replier: &Replier<AgentRequest, AgentReply>, request: AgentRequest) {
        if let Err(e) = self
            .tracker
            .transition(ComponentState::Busy, EventCategory::StateChange)
            .await
        {
            warn!(%e, "state tracker rejected BUSY");
        }

        let outcome = self
            .process_with_chain(&request.text, AgentContext::default(), request.chain_id)
            .await;

        let reply = match outcome {
            Ok(text) => AgentReply {
                request_id: request.request_id,
                text,
                success: true,
                error_message: None,
                timestamp: Utc::now(),
            },
            Err(error) => {
                self.participant
                    .monitoring()
                    .publish_log(
                        "ERROR",
                        format!("request {} failed: {error}", request.request_id),
                    )
                    .await;
                AgentReply {
                    request_id: request.request_id,
                    text: String::new(),
                    success: false,
                    error_message: Some(error.to_string()),
                    timestamp: Utc::now(),
                }
            }
        };
        let failed = !reply.success;
        if let Err(error) = replier.reply(&reply).await {
            warn!(%error, request_id = %request.request_id, "failed to write agent reply");
        }

        let dip = if failed {
            self.tracker
                .transition(ComponentState::Degraded, EventCategory::StateChange)
                .await
        } else {
            Ok(())
        };
        if let Err(e) = dip {
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

    /// Fulfills one text request through the two-stage pipeline
    ///
    /// # Errors
    /// Surfaces executor failures, cancellation, and the no-capability
    /// case as typed errors; tool-level failures are fed back to the
    /// executor instead.
    pub async fn process(
        &self,
        request_text: &str,
        context: AgentContext,
    ) -> Result<String, AgentError> {
        self.process_with_chain(request_text, context, ChainId::generate())
            .await
    }

    #[instrument(name = "agent_process", skip(self, context), fields(chain_id = %chain_id))]
    async fn process_with_chain(
        &self,
        request_text: &str,
        context: AgentContext,
        chain_id: ChainId,
    ) -> Result<String, AgentError> {
        // Stage A: narrow the advertised set down to what this request
        // needs. Classifier trouble falls back to the full list.
        let snapshot = self.registry.get_all();
        if snapshot.is_empty() {
            return Err(AgentError::NoCapabilityAvailable);
        }
        let selected = self.classify(request_text, &snapshot).await?;

        // Stage B: let the executor reason over the selection, forwarding
        // its function calls over RPC until it produces a final text.
        let tools: Vec<ToolDefinition> =
            selected.iter().map(ToolDefinition::from_capability).collect();
        let mut messages = context.prior_messages;
        messages.push(ChatMessage::user(request_text));

        let max_turns = self.participant.config().max_executor_turns.as_u32();
        for _ in 0..max_turns {
            let turn = tokio::select! {
                () = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                turn = self.executor.complete(&messages, &tools) => turn?,
            };
            match turn {
                ExecutorTurn::Final(text) => return Ok(text),
                ExecutorTurn::ToolCalls(calls) => {
                    for call in calls {
                        let result = self
                            .execute_tool_call(&call, &selected, &snapshot, chain_id)
                            .await?;
                        messages.push(ChatMessage::assistant(format!(
                            "calling {}({})",
                            call.name, call.arguments
                        )));
                        messages.push(ChatMessage::tool(result, call.call_id.clone()));
                    }
                }
            }
        }
        Err(AgentError::ExecutorLoopLimit { limit: max_turns })
    }

    async fn classify(
        &self,
        request_text: &str,
        snapshot: &HashMap<FunctionId, FunctionCapability>,
    ) -> Result<Vec<FunctionCapability>, AgentError> {
        let digest: Vec<FunctionDigest> =
            snapshot.values().map(FunctionDigest::from_capability).collect();

        let names = tokio::select! {
            () = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            names = self.classifier.classify(request_text, &digest) => names,
        };
        let names = match names {
            Ok(names) => names,
            Err(error) => {
                warn!(%error, "classifier failed; falling back to full function list");
                self.participant
                    .monitoring()
                    .publish_log(
                        "WARN",
                        format!("classifier failed, using full function list: {error}"),
                    )
                    .await;
                return Ok(snapshot.values().cloned().collect());
            }
        };

        let mut selected: Vec<FunctionCapability> = Vec::new();
        for name in names {
            for capability in snapshot.values() {
                if capability.name.as_str() == name
                    && !selected.iter().any(|c| c.function_id == capability.function_id)
                {
                    selected.push(capability.clone());
                }
            }
        }
        Ok(selected)
    }

    /// Resolves and performs one executor-requested function call.
    ///
    /// Returns the tool-result text to feed back; only cancellation
    /// escapes as an error.
    async fn execute_tool_call(
        &self,
        call: &ToolCallRequest,
        selected: &[FunctionCapability],
        snapshot: &HashMap<FunctionId, FunctionCapability>,
        chain_id: ChainId,
    ) -> Result<String, AgentError> {
        // First match among the classified set wins; fall back to the full
        // snapshot for names the classifier dropped.
        let capability = selected
            .iter()
            .find(|c| c.name.as_str() == call.name)
            .or_else(|| snapshot.values().find(|c| c.name.as_str() == call.name));
        let Some(capability) = capability else {
            return Ok(format!("error: unknown function '{}'", call.name));
        };

        let call_id = CallId::generate();
        let request = FunctionRequest {
            request_id: RequestId::generate(),
            function_id: capability.function_id,
            parameters: call.arguments.clone(),
            timestamp: Utc::now(),
            metadata: RequestMetadata {
                caller_id: self.participant.guid(),
                chain_id,
                call_id,
            },
        };

        // The provider emits CALL_START/COMPLETE/ERROR around the
        // invocation; the agent reports only failures the provider never
        // observes (endpoint setup, timeout, transport loss).
        let requester = match self.function_requester(&capability.service_name) {
            Ok(requester) => requester,
            Err(error) => {
                self.emit_chain_error(&request, capability, error.to_string())
                    .await;
                return Ok(format!("error: {error}"));
            }
        };

        let timeout = self.participant.config().rpc_timeout.as_duration();
        match requester.call(&request, timeout).await {
            Ok(reply) if reply.success => Ok(reply.result),
            Ok(reply) => {
                let message = reply
                    .error_message
                    .unwrap_or_else(|| "unspecified provider error".to_string());
                Ok(format!("error: {message}"))
            }
            Err(RpcError::Cancelled { .. }) => Err(AgentError::Cancelled),
            Err(error) => {
                self.emit_chain_error(&request, capability, error.to_string())
                    .await;
                Ok(format!("error: {error}"))
            }
        }
    }

    fn function_requester(
        &self,
        service_name: &ServiceName,
    ) -> Result<Arc<Requester<FunctionRequest, FunctionReply>>, RpcError> {
        if let Some(existing) = self.function_requesters.get(service_name) {
            return Ok(Arc::clone(existing.value()));
        }
        let requester = Arc::new(Requester::new(&self.participant, service_name.clone())?);
        self.function_requesters
            .insert(service_name.clone(), Arc::clone(&requester));
        Ok(requester)
    }

    /// Delegates a request to a peer agent over its RPC channel
    ///
    /// # Errors
    /// Surfaces RPC failures and unsuccessful peer replies.
    pub async fn delegate(
        &self,
        peer_service: ServiceName,
        request_text: &str,
        chain_id: ChainId,
    ) -> Result<String, AgentError> {
        let requester = if let Some(existing) = self.agent_requesters.get(&peer_service) {
            Arc::clone(existing.value())
        } else {
            let requester = Arc::new(Requester::new(&self.participant, peer_service.clone())?);
            self.agent_requesters
                .insert(peer_service.clone(), Arc::clone(&requester));
            requester
        };

        let request = AgentRequest {
            request_id: RequestId::generate(),
            text: request_text.to_string(),
            chain_id,
            caller_id: self.participant.guid(),
            timestamp: Utc::now(),
        };
        let timeout = self.participant.config().rpc_timeout.as_duration();
        let reply = requester.call(&request, timeout).await?;
        if reply.success {
            Ok(reply.text)
        } else {
            Err(AgentError::Executor {
                source: LlmError::Api(
                    reply
                        .error_message
                        .unwrap_or_else(|| "peer agent failed".to_string()),
                ),
            })
        }
    }

    async fn emit_chain_error(
        &self,
        request: &FunctionRequest,
        capability: &FunctionCapability,
        status: String,
    ) {
        self.participant
            .monitoring()
            .publish_chain(&ChainEvent {
                chain_id: request.metadata.chain_id,
                call_id: request.metadata.call_id,
                source: self.participant.guid(),
                target: Some(capability.provider_id),
                function_id: Some(request.function_id),
                kind: ChainEventKind::CallError,
                status: Some(status),
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Disposes the announcement, cancels in-flight work, and goes
    /// OFFLINE; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let function_requesters: Vec<_> = self
            .function_requesters
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        futures::future::join_all(function_requesters.iter().map(|r| r.close())).await;
        let agent_requesters: Vec<_> = self
            .agent_requesters
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        futures::future::join_all(agent_requesters.iter().map(|r| r.close())).await;
        if let Err(error) = self.registration_writer.dispose(&self.registration.key()).await {
            warn!(%error, "failed to dispose agent registration");
        }
        self.registry.close().await;
        if let Err(e) = self
            .tracker
            .transition(ComponentState::Offline, EventCategory::AgentShutdown)
            .await
        {
            warn!(%e, "state tracker rejected OFFLINE");
        }
    }
}
