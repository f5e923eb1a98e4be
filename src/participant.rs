//! Per-process bus attachment
//!
//! One [`Participant`] per process. It owns the fabric peer, the
//! monitoring publisher, and the well-known topic endpoints; every other
//! core object borrows it. Children must be closed before the
//! participant; `close()` is idempotent and releases the peer last.

use crate::config::GenesisConfig;
use crate::domain_types::{DomainId, ParticipantGuid};
use crate::error::GenesisError;
use crate::messages::{AgentRegistration, FunctionCapability};
use crate::monitoring::MonitoringPublisher;
use crate::transport::{
    Fabric, FabricPeer, TopicDescriptor, TopicReader, TopicWriter, TransportError, topics,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// One process's attachment to the bus
pub struct Participant {
    peer: Arc<dyn FabricPeer>,
    config: GenesisConfig,
    monitoring: Arc<MonitoringPublisher>,
    closed: AtomicBool,
}

impl Participant {
    /// Attaches to the fabric and stands up the monitoring publisher
    ///
    /// # Errors
    /// Fails on invalid configuration or when the fabric rejects the
    /// attachment; both are fatal at startup.
    pub async fn new(fabric: &dyn Fabric, config: GenesisConfig) -> Result<Self, GenesisError> {
        config.validate()?;
        let peer = fabric.attach(config.domain_id)?;
        let monitoring = Arc::new(MonitoringPublisher::new(&peer, config.max_payload_bytes)?);
        monitoring.publish_liveliness(true).await;
        info!(guid = %peer.guid(), domain = %config.domain_id, "participant attached");
        Ok(Self {
            peer,
            config,
            monitoring,
            closed: AtomicBool::new(false),
        })
    }

    /// The GUID the fabric assigned to this process
    #[must_use]
    pub fn guid(&self) -> ParticipantGuid {
        self.peer.guid()
    }

    /// The domain this participant lives in
    #[must_use]
    pub fn domain_id(&self) -> DomainId {
        self.peer.domain_id()
    }

    /// The resolved configuration
    #[must_use]
    pub fn config(&self) -> &GenesisConfig {
        &self.config
    }

    /// The monitoring publisher shared by this process's components
    #[must_use]
    pub fn monitoring(&self) -> Arc<MonitoringPublisher> {
        Arc::clone(&self.monitoring)
    }

    /// The underlying fabric peer
    #[must_use]
    pub fn peer(&self) -> &Arc<dyn FabricPeer> {
        &self.peer
    }

    /// Writer for advertising function capabilities
    ///
    /// # Errors
    /// Propagates fabric endpoint errors.
    pub fn capability_writer(&self) -> Result<TopicWriter<FunctionCapability>, TransportError> {
        let raw = self
            .peer
            .create_writer(&TopicDescriptor::durable_event(topics::FUNCTION_CAPABILITY))?;
        Ok(TopicWriter::new(
            raw,
            topics::FUNCTION_CAPABILITY.to_string(),
            self.config.max_payload_bytes.as_usize(),
        ))
    }

    /// Reader for consuming function capabilities.
    ///
    /// Only agents and interfaces subscribe here; services publish only.
    ///
    /// # Errors
    /// Propagates fabric endpoint errors.
    pub fn capability_reader(&self) -> Result<TopicReader<FunctionCapability>, TransportError> {
        let raw = self
            .peer
            .create_reader(&TopicDescriptor::durable_event(topics::FUNCTION_CAPABILITY))?;
        Ok(TopicReader::new(raw))
    }

    /// Writer for agent self-announcements
    ///
    /// # Errors
    /// Propagates fabric endpoint errors.
    pub fn registration_writer(&self) -> Result<TopicWriter<AgentRegistration>, TransportError> {
        let raw = self
            .peer
            .create_writer(&TopicDescriptor::durable_event(topics::REGISTRATION))?;
        Ok(TopicWriter::new(
            raw,
            topics::REGISTRATION.to_string(),
            self.config.max_payload_bytes.as_usize(),
        ))
    }

    /// Reader for agent self-announcements
    ///
    /// # Errors
    /// Propagates fabric endpoint errors.
    pub fn registration_reader(&self) -> Result<TopicReader<AgentRegistration>, TransportError> {
        let raw = self
            .peer
            .create_reader(&TopicDescriptor::durable_event(topics::REGISTRATION))?;
        Ok(TopicReader::new(raw))
    }

    /// Announces departure and releases the peer; idempotent.
    ///
    /// Callers close children (repliers, registries, trackers) first; the
    /// participant goes last.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitoring.publish_liveliness(false).await;
        self.peer.close();
        debug!(guid = %self.peer.guid(), "participant closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryFabric;

    #[tokio::test]
    async fn attaches_with_unique_guid() {
        let fabric = MemoryFabric::new();
        let first = Participant::new(&fabric, GenesisConfig::development())
            .await
            .unwrap();
        let second = Participant::new(&fabric, GenesisConfig::development())
            .await
            .unwrap();
        assert_ne!(first.guid(), second.guid());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let fabric = MemoryFabric::new();
        let participant = Participant::new(&fabric, GenesisConfig::development())
            .await
            .unwrap();
        participant.close().await;
        participant.close().await;
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let fabric = MemoryFabric::new();
        let mut config = GenesisConfig::development();
        config.qos_profile = String::new();
        assert!(Participant::new(&fabric, config).await.is_err());
    }
}
