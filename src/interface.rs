//! Interface base: the system edge
//!
//! Interfaces discover agents exclusively through the registration
//! topic's listener; there is no polling surface. A chosen agent is
//! reached through an [`AgentHandle`] that wraps a requester aimed at the
//! agent's RPC channel.

use crate::domain_types::{AgentId, ChainId, ParticipantGuid, RequestId};
use crate::lifecycle::{ComponentKind, ComponentState, LifecycleError, StateTracker};
use crate::messages::{AgentRegistration, AgentReply, AgentRequest, EventCategory};
use crate::participant::Participant;
use crate::rpc::{Requester, RpcError};
use crate::transport::{InstanceState, Sample, TopicReader, TransportError};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Interface errors
#[derive(Debug, Error)]
pub enum InterfaceError {
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

    #[error("no agent discovered within {timeout_ms}ms")]
    NoAgentDiscovered { timeout_ms: u64 },

    #[error("agent '{name}' not discovered within {timeout_ms}ms")]
    AgentNotFound { name: String, timeout_ms: u64 },

    #[error("agent reply failed: {message}")]
    AgentReplyFailed { message: String },
}

/// Callback surface for agent arrivals and departures
pub trait DirectoryListener: Send + Sync {
    /// An agent appeared on the registration topic
    fn on_agent_added(&self, registration: &AgentRegistration);

    /// An agent's announcement was disposed or lost its writer
    fn on_agent_removed(&self, agent_id: AgentId);
}

/// Listener-maintained view of announced agents
pub struct AgentDirectory {
    agents: Arc<DashMap<AgentId, AgentRegistration>>,
    listeners: Arc<Mutex<Vec<Box<dyn DirectoryListener>>>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentDirectory {
    /// Spawns the registration listener
    ///
    /// # Errors
    /// Fails when the registration reader cannot be created.
    pub fn spawn(participant: &Participant) -> Result<Self, InterfaceError> {
        let reader = participant.registration_reader()?;
        let agents: Arc<DashMap<AgentId, AgentRegistration>> = Arc::new(DashMap::new());
        let listeners: Arc<Mutex<Vec<Box<dyn DirectoryListener>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Self::listen(
            reader,
            Arc::clone(&agents),
            Arc::clone(&listeners),
            Arc::clone(&notify),
            cancel.clone(),
        ));

        Ok(Self {
            agents,
            listeners,
            notify,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    async fn listen(
        mut reader: TopicReader<AgentRegistration>,
        agents: Arc<DashMap<AgentId, AgentRegistration>>,
        listeners: Arc<Mutex<Vec<Box<dyn DirectoryListener>>>>,
        notify: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        loop {
            let sample = tokio::select! {
                () = cancel.cancelled() => break,
                sample = reader.take() => match sample {
                    Some(sample) => sample,
                    None => break,
                },
            };
            Self::apply(&agents, &listeners, &notify, sample);
        }
    }

    fn apply(
        agents: &DashMap<AgentId, AgentRegistration>,
        listeners: &Mutex<Vec<Box<dyn DirectoryListener>>>,
        notify: &Notify,
        sample: Sample<AgentRegistration>,
    ) {
        match sample.state {
            InstanceState::Alive => {
                let Some(registration) = sample.data else {
                    warn!(key = %sample.key, "skipping malformed registration sample");
                    return;
                };
                let is_new = agents
                    .insert(registration.agent_id, registration.clone())
                    .is_none();
                if is_new {
                    debug!(agent = %registration.preferred_name, "agent discovered");
                    for listener in listeners
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .iter()
                    {
                        listener.on_agent_added(&registration);
                    }
                    notify.notify_waiters();
                }
            }
            InstanceState::NotAliveDisposed | InstanceState::NotAliveNoWriters => {
                let Ok(uuid) = Uuid::parse_str(&sample.key) else {
                    warn!(key = %sample.key, "unparsable key on not-alive registration sample");
                    return;
                };
                let agent_id = AgentId::new(uuid);
                if agents.remove(&agent_id).is_some() {
                    debug!(%agent_id, "agent departed");
                    for listener in listeners
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .iter()
                    {
                        listener.on_agent_removed(agent_id);
                    }
                }
            }
        }
    }

    /// Registers a callback listener
    pub fn add_listener(&self, listener: Box<dyn DirectoryListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(listener);
    }

    /// Snapshot of currently announced agents
    #[must_use]
    pub fn agents(&self) -> Vec<AgentRegistration> {
        self.agents
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Waits (event-driven) until any agent is announced.
    ///
    /// Prefers a `default_capable` agent when several are present.
    ///
    /// # Errors
    /// Returns [`InterfaceError::NoAgentDiscovered`] on timeout.
    pub async fn wait_for_any(&self, timeout: Duration) -> Result<AgentRegistration, InterfaceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(found) = self.pick(|_| true) {
                return Ok(found);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                return Err(InterfaceError::NoAgentDiscovered {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    /// Waits (event-driven) for an agent announced under a preferred name
    ///
    /// # Errors
    /// Returns [`InterfaceError::AgentNotFound`] on timeout.
    pub async fn wait_for_named(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<AgentRegistration, InterfaceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(found) = self.pick(|r| r.preferred_name.as_str() == name) {
                return Ok(found);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                return Err(InterfaceError::AgentNotFound {
                    name: name.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    fn pick<P: Fn(&AgentRegistration) -> bool>(&self, accept: P) -> Option<AgentRegistration> {
        let mut fallback = None;
        for entry in self.agents.iter() {
            let registration = entry.value();
            if !accept(registration) {
                continue;
            }
            if registration.default_capable {
                return Some(registration.clone());
            }
            fallback.get_or_insert_with(|| registration.clone());
        }
        fallback
    }

    /// Stops the listener; idempotent
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// The outward-facing entry point of the system
pub struct InterfaceBase {
    participant: Arc<Participant>,
    directory: AgentDirectory,
    tracker: StateTracker,
}

impl InterfaceBase {
    /// Spawns discovery and walks the interface to READY
    ///
    /// # Errors
    /// Fails when the registration reader cannot be created.
    pub async fn new(participant: Arc<Participant>) -> Result<Self, InterfaceError> {
        let directory = AgentDirectory::spawn(&participant)?;
        let tracker = StateTracker::new(
            participant.guid(),
            "interface",
            ComponentKind::Interface,
            participant.monitoring(),
        )
        .await;
        tracker
            .transition(ComponentState::Discovering, EventCategory::AgentInit)
            .await?;
        tracker
            .transition(ComponentState::Ready, EventCategory::AgentReady)
            .await?;
        Ok(Self {
            participant,
            directory,
            tracker,
        })
    }

    /// The discovery directory
    #[must_use]
    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    /// Connects a requester to a discovered agent, waiting for a matched
    /// replier
    ///
    /// # Errors
    /// Surfaces discovery timeouts and endpoint failures.
    pub async fn connect_to_agent(
        &self,
        registration: &AgentRegistration,
    ) -> Result<AgentHandle, InterfaceError> {
        let requester = Requester::new(&self.participant, registration.service_name.clone())?;
        let timeout = self.participant.config().discovery_timeout.as_duration();
        requester.wait_for_replier(timeout).await?;
        Ok(AgentHandle {
            agent: registration.clone(),
            requester,
            caller_id: self.participant.guid(),
            rpc_timeout: self.participant.config().rpc_timeout.as_duration(),
        })
    }

    /// Stops discovery and goes OFFLINE; idempotent
    pub async fn close(&self) {
        self.directory.close().await;
        if self.tracker.state() != ComponentState::Offline {
            if let Err(e) = self
                .tracker
                .transition(ComponentState::Offline, EventCategory::AgentShutdown)
                .await
            {
                warn!(%e, "state tracker rejected OFFLINE");
            }
        }
    }
}

/// A connected conversation with one agent
pub struct AgentHandle {
    agent: AgentRegistration,
    requester: Requester<AgentRequest, AgentReply>,
    caller_id: ParticipantGuid,
    rpc_timeout: Duration,
}

impl AgentHandle {
    /// The agent this handle is connected to
    #[must_use]
    pub fn agent(&self) -> &AgentRegistration {
        &self.agent
    }

    /// Sends one request and waits for the correlated reply
    ///
    /// # Errors
    /// Surfaces RPC failures and unsuccessful agent replies.
    pub async fn send(&self, text: &str) -> Result<String, InterfaceError> {
        let request = AgentRequest {
            request_id: RequestId::generate(),
            text: text.to_string(),
            chain_id: ChainId::generate(),
            caller_id: self.caller_id,
            timestamp: Utc::now(),
        };
        let reply = self.requester.call(&request, self.rpc_timeout).await?;
        if reply.success {
            Ok(reply.text)
        } else {
            Err(InterfaceError::AgentReplyFailed {
                message: reply
                    .error_message
                    .unwrap_or_else(|| "unspecified agent error".to_string()),
            })
        }
    }

    /// Releases the requester; idempotent
    pub async fn close(&self) {
        self.requester.close().await;
    }
}
