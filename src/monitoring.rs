//! Monitoring event publication
//!
//! A thin helper owning the four monitoring topic writers. Lifecycle
//! events are durable so late-joining dashboards reconstruct the current
//! component graph; chain events are reliable but volatile; the log
//! stream is best-effort. Publish failures are logged and swallowed —
//! monitoring must never take down the data path.

use crate::domain_types::{MaxPayloadBytes, ParticipantGuid};
use crate::messages::{ChainEvent, ComponentLifecycleEvent, LivelinessUpdate, LogMessage};
use crate::transport::{FabricPeer, TopicDescriptor, TopicWriter, TransportError, topics};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

/// Publishes lifecycle, chain, liveliness, and log events
pub struct MonitoringPublisher {
    component_id: ParticipantGuid,
    lifecycle: TopicWriter<ComponentLifecycleEvent>,
    chain: TopicWriter<ChainEvent>,
    liveliness: TopicWriter<LivelinessUpdate>,
    log: TopicWriter<LogMessage>,
}

impl MonitoringPublisher {
    /// Stands up the four monitoring writers on a participant's peer
    ///
    /// # Errors
    /// Fails when any writer cannot be created.
    pub fn new(
        peer: &Arc<dyn FabricPeer>,
        max_payload: MaxPayloadBytes,
    ) -> Result<Self, TransportError> {
        let max = max_payload.as_usize();
        let lifecycle_raw =
            peer.create_writer(&TopicDescriptor::durable_event(topics::COMPONENT_LIFECYCLE))?;
        let chain_raw = peer.create_writer(&TopicDescriptor::event(topics::CHAIN_EVENT))?;
        let liveliness_raw =
            peer.create_writer(&TopicDescriptor::event(topics::LIVELINESS_UPDATE))?;
        let log_raw = peer.create_writer(&TopicDescriptor::best_effort_event(topics::LOG_MESSAGE))?;
        Ok(Self {
            component_id: peer.guid(),
            lifecycle: TopicWriter::new(
                lifecycle_raw,
                topics::COMPONENT_LIFECYCLE.to_string(),
                max,
            ),
            chain: TopicWriter::new(chain_raw, topics::CHAIN_EVENT.to_string(), max),
            liveliness: TopicWriter::new(liveliness_raw, topics::LIVELINESS_UPDATE.to_string(), max),
            log: TopicWriter::new(log_raw, topics::LOG_MESSAGE.to_string(), max),
        })
    }

    /// The participant this publisher reports for
    #[must_use]
    pub fn component_id(&self) -> ParticipantGuid {
        self.component_id
    }

    /// Publishes a component lifecycle transition
    pub async fn publish_lifecycle(&self, event: &ComponentLifecycleEvent) {
        if let Err(error) = self.lifecycle.write(&event.key(), event).await {
            warn!(%error, "failed to publish lifecycle event");
        }
    }

    /// Publishes one chain step
    pub async fn publish_chain(&self, event: &ChainEvent) {
        if let Err(error) = self.chain.write(&event.key(), event).await {
            warn!(%error, "failed to publish chain event");
        }
    }

    /// Publishes a liveliness notification for this participant
    pub async fn publish_liveliness(&self, alive: bool) {
        let update = LivelinessUpdate {
            component_id: self.component_id,
            alive,
            timestamp: Utc::now(),
        };
        if let Err(error) = self
            .liveliness
            .write(&self.component_id.to_string(), &update)
            .await
        {
            warn!(%error, "failed to publish liveliness update");
        }
    }

    /// Publishes a record on the best-effort log stream
    pub async fn publish_log(&self, level: &str, message: impl Into<String>) {
        let record = LogMessage {
            component_id: self.component_id,
            level: level.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        };
        if let Err(error) = self.log.write(&self.component_id.to_string(), &record).await {
            warn!(%error, "failed to publish log message");
        }
    }
}
