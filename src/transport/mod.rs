//! Transport abstraction for the Genesis fabric
//!
//! Defines the publish/subscribe + request/reply semantics every fabric
//! implementation must honor: typed keyed topics, reliability/durability
//! QoS, per-participant GUIDs, matched-peer awareness, and instance
//! liveliness. The in-process reference fabric lives in [`memory`].

use crate::domain_types::{DomainId, ParticipantGuid};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod memory;

/// Errors surfaced by fabric endpoints
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to attach to fabric: {reason}")]
    AttachFailed { reason: String },

    #[error("topic {topic} already exists with an incompatible descriptor")]
    TopicMismatch { topic: String },

    #[error("payload too large on {topic}: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge {
        topic: String,
        size: usize,
        max: usize,
    },

    #[error("no matched peer on {topic}")]
    NoMatchedPeer { topic: String },

    #[error("discovery timed out on {topic} after {timeout_ms}ms")]
    DiscoveryTimeout { topic: String, timeout_ms: u64 },

    #[error("endpoint closed: {topic}")]
    Closed { topic: String },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// Delivery reliability knob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum Reliability {
    /// Every sample reaches every matched reader
    Reliable,
    /// Samples may be dropped under pressure
    BestEffort,
}

/// Sample retention knob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum Durability {
    /// Late-joining readers see nothing published before they matched
    Volatile,
    /// Late-joining readers receive the current live instance set
    TransientLocal,
}

/// Distribution shape of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum TopicKind {
    /// Every matched reader observes every sample
    Event,
    /// Each sample is delivered to exactly one matched reader
    Queue,
}

/// Everything the fabric needs to know to stand up a topic endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescriptor {
    /// Stable topic name
    pub name: String,
    /// Distribution shape
    pub kind: TopicKind,
    /// Delivery reliability
    pub reliability: Reliability,
    /// Retention for late joiners
    pub durability: Durability,
}

impl TopicDescriptor {
    /// Event topic, reliable, volatile
    #[must_use]
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TopicKind::Event,
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
        }
    }

    /// Event topic, reliable, transient-local
    #[must_use]
    pub fn durable_event(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TopicKind::Event,
            reliability: Reliability::Reliable,
            durability: Durability::TransientLocal,
        }
    }

    /// Event topic, best-effort, volatile
    #[must_use]
    pub fn best_effort_event(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TopicKind::Event,
            reliability: Reliability::BestEffort,
            durability: Durability::Volatile,
        }
    }

    /// Queue topic, reliable, volatile
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TopicKind::Queue,
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
        }
    }
}

/// Well-known topic names and RPC channel derivation
pub mod topics {
    /// Agent self-announcements (durable)
    pub const REGISTRATION: &str = "GenesisRegistration";
    /// Function capability advertisements (durable, keyed by function id)
    pub const FUNCTION_CAPABILITY: &str = "FunctionCapability";
    /// Component lifecycle transitions (durable)
    pub const COMPONENT_LIFECYCLE: &str = "ComponentLifecycle";
    /// Per-call chain events (volatile)
    pub const CHAIN_EVENT: &str = "ChainEvent";
    /// Participant liveliness notifications (volatile)
    pub const LIVELINESS_UPDATE: &str = "LivelinessUpdate";
    /// Best-effort log stream
    pub const LOG_MESSAGE: &str = "LogMessage";

    /// Request half of a service's RPC channel
    #[must_use]
    pub fn rpc_request(service_name: &str) -> String {
        format!("rpc/{service_name}/request")
    }

    /// Reply half of a service's RPC channel
    #[must_use]
    pub fn rpc_reply(service_name: &str) -> String {
        format!("rpc/{service_name}/reply")
    }
}

/// Lifecycle state of a keyed topic instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum InstanceState {
    /// A writer is actively asserting the instance
    Alive,
    /// A writer explicitly disposed the instance
    NotAliveDisposed,
    /// Every writer asserting the instance has gone away
    NotAliveNoWriters,
}

/// One raw sample as it crosses the fabric
#[derive(Debug, Clone)]
pub struct RawSample {
    /// Instance key
    pub key: String,
    /// Instance state this sample communicates
    pub state: InstanceState,
    /// Serialized payload; absent for not-alive transitions
    pub payload: Option<Bytes>,
    /// GUID of the participant that produced the sample
    pub writer: ParticipantGuid,
}

/// A fabric that participants can attach to
pub trait Fabric: Send + Sync + 'static {
    /// Attaches a new participant in the given domain
    ///
    /// # Errors
    /// Returns [`TransportError::AttachFailed`] when the fabric cannot
    /// allocate the attachment.
    fn attach(&self, domain_id: DomainId) -> Result<Arc<dyn FabricPeer>, TransportError>;
}

/// One participant's attachment to a fabric
pub trait FabricPeer: Send + Sync + 'static {
    /// The GUID the fabric assigned to this attachment
    fn guid(&self) -> ParticipantGuid;

    /// The domain this attachment lives in
    fn domain_id(&self) -> DomainId;

    /// Creates a raw writer on a topic
    ///
    /// # Errors
    /// Returns [`TransportError::TopicMismatch`] when the topic exists with
    /// a different descriptor, or [`TransportError::Closed`] after close.
    fn create_writer(&self, topic: &TopicDescriptor) -> Result<Box<dyn RawWriter>, TransportError>;

    /// Creates a raw reader on a topic
    ///
    /// # Errors
    /// Same failure modes as [`FabricPeer::create_writer`].
    fn create_reader(&self, topic: &TopicDescriptor) -> Result<Box<dyn RawReader>, TransportError>;

    /// Number of readers currently attached to a topic in this domain
    fn reader_count(&self, topic_name: &str) -> usize;

    /// Number of writers currently attached to a topic in this domain
    fn writer_count(&self, topic_name: &str) -> usize;

    /// Detaches from the fabric; idempotent
    fn close(&self);
}

/// Raw byte-level writer on one topic
#[async_trait]
pub trait RawWriter: Send + Sync {
    /// Publishes a sample, asserting the instance ALIVE
    async fn write(&self, key: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Explicitly disposes the instance
    async fn dispose(&self, key: &str) -> Result<(), TransportError>;

    /// Number of readers currently matched with this writer
    fn matched_readers(&self) -> usize;

    /// Waits until at least one reader is matched
    async fn wait_matched(&self, timeout: Duration) -> Result<(), TransportError>;
}

/// Raw byte-level reader on one topic
#[async_trait]
pub trait RawReader: Send + Sync {
    /// Takes the next sample; `None` once the topic is closed
    async fn take(&mut self) -> Option<RawSample>;
}

/// One decoded sample delivered to a typed reader
#[derive(Debug, Clone)]
pub struct Sample<T> {
    /// Instance key
    pub key: String,
    /// Instance state
    pub state: InstanceState,
    /// GUID of the producing participant
    pub writer: ParticipantGuid,
    /// Decoded payload; absent for not-alive samples and malformed payloads
    pub data: Option<T>,
}

impl<T: DeserializeOwned> Sample<T> {
    fn decode(raw: RawSample) -> Self {
        let data = raw
            .payload
            .as_ref()
            .and_then(|bytes| serde_json::from_slice(bytes).ok());
        Self {
            key: raw.key,
            state: raw.state,
            writer: raw.writer,
            data,
        }
    }

    /// An ALIVE sample whose payload failed to decode.
    ///
    /// Listeners must skip these without aborting.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        self.state == InstanceState::Alive && self.data.is_none()
    }
}

/// Typed writer over a raw endpoint
pub struct TopicWriter<T> {
    raw: Box<dyn RawWriter>,
    topic_name: String,
    max_payload: usize,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> TopicWriter<T> {
    /// Wraps a raw writer with serde encoding and a payload bound
    #[must_use]
    pub fn new(raw: Box<dyn RawWriter>, topic_name: String, max_payload: usize) -> Self {
        Self {
            raw,
            topic_name,
            max_payload,
            _marker: PhantomData,
        }
    }

    /// Serializes and publishes a value under an instance key
    ///
    /// # Errors
    /// Fails on serialization, payload-bound violation, or fabric error.
    pub async fn write(&self, key: &str, value: &T) -> Result<(), TransportError> {
        let encoded = serde_json::to_vec(value)?;
        if encoded.len() > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                topic: self.topic_name.clone(),
                size: encoded.len(),
                max: self.max_payload,
            });
        }
        self.raw.write(key, Bytes::from(encoded)).await
    }

    /// Disposes the instance under the key
    ///
    /// # Errors
    /// Propagates fabric errors.
    pub async fn dispose(&self, key: &str) -> Result<(), TransportError> {
        self.raw.dispose(key).await
    }

    /// Number of currently matched readers
    #[must_use]
    pub fn matched_readers(&self) -> usize {
        self.raw.matched_readers()
    }

    /// Waits until at least one reader is matched
    ///
    /// # Errors
    /// Returns [`TransportError::DiscoveryTimeout`] if none appears in time.
    pub async fn wait_matched(&self, timeout: Duration) -> Result<(), TransportError> {
        self.raw.wait_matched(timeout).await
    }
}

/// Typed reader over a raw endpoint
pub struct TopicReader<T> {
    raw: Box<dyn RawReader>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TopicReader<T> {
    /// Wraps a raw reader with serde decoding
    #[must_use]
    pub fn new(raw: Box<dyn RawReader>) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Takes the next sample; `None` once the topic is closed
    pub async fn take(&mut self) -> Option<Sample<T>> {
        let raw = self.raw.take().await?;
        Some(Sample::decode(raw))
    }
}
