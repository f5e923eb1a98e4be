//! Event-driven capability registry
//!
//! A per-participant cache of every function currently advertised on the
//! bus. All mutation happens on the listener task that drains the
//! capability reader; in-process consumers only ever see point-in-time
//! snapshots. The registry never writes to the wire.

use crate::domain_types::FunctionId;
use crate::messages::FunctionCapability;
use crate::participant::Participant;
use crate::transport::{InstanceState, Sample, TopicReader, TransportError};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },
}

/// One delta observed on the capability topic
#[derive(Debug, Clone)]
pub enum CapabilityChange {
    /// A function appeared
    Added(FunctionCapability),
    /// An existing function republished
    Updated(FunctionCapability),
    /// A function's provider disposed it or went away
    Removed(FunctionId),
}

/// Thread-safe cache of currently advertised functions
pub struct CapabilityRegistry {
    cache: Arc<DashMap<FunctionId, FunctionCapability>>,
    changes: broadcast::Sender<CapabilityChange>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CapabilityRegistry {
    /// Spawns the listener on the participant's capability reader
    ///
    /// # Errors
    /// Fails when the reader cannot be created.
    pub fn spawn(participant: &Participant) -> Result<Self, RegistryError> {
        let reader = participant.capability_reader()?;
        let cache: Arc<DashMap<FunctionId, FunctionCapability>> = Arc::new(DashMap::new());
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let listener = tokio::spawn(Self::listen(
            reader,
            Arc::clone(&cache),
            changes.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            cache,
            changes,
            cancel,
            listener: Mutex::new(Some(listener)),
        })
    }

    async fn listen(
        mut reader: TopicReader<FunctionCapability>,
        cache: Arc<DashMap<FunctionId, FunctionCapability>>,
        changes: broadcast::Sender<CapabilityChange>,
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
            Self::apply(&cache, &changes, sample);
        }
    }

    /// Applies one sample to the cache. Runs only on the listener task.
    fn apply(
        cache: &DashMap<FunctionId, FunctionCapability>,
        changes: &broadcast::Sender<CapabilityChange>,
        sample: Sample<FunctionCapability>,
    ) {
        match sample.state {
            InstanceState::Alive => {
                let Some(mut capability) = sample.data else {
                    // Transient malformed samples surface from the wire;
                    // skip without aborting the listener.
                    warn!(key = %sample.key, "skipping malformed capability sample");
                    return;
                };
                capability.last_seen = Utc::now();
                let id = capability.function_id;
                let previous = cache.insert(id, capability.clone());
                let change = if previous.is_some() {
                    CapabilityChange::Updated(capability)
                } else {
                    debug!(function_id = %id, name = %capability.name, "capability added");
                    CapabilityChange::Added(capability)
                };
                let _ = changes.send(change);
            }
            InstanceState::NotAliveDisposed | InstanceState::NotAliveNoWriters => {
                let Ok(uuid) = Uuid::parse_str(&sample.key) else {
                    warn!(key = %sample.key, "unparsable key on not-alive capability sample");
                    return;
                };
                let id = FunctionId::new(uuid);
                if cache.remove(&id).is_some() {
                    debug!(function_id = %id, "capability removed");
                    let _ = changes.send(CapabilityChange::Removed(id));
                }
            }
        }
    }

    /// Point-in-time snapshot of every advertised function
    #[must_use]
    pub fn get_all(&self) -> HashMap<FunctionId, FunctionCapability> {
        self.cache
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Every currently advertised function with a matching name
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Vec<FunctionCapability> {
        self.cache
            .iter()
            .filter(|entry| entry.value().name.as_str() == name)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of currently advertised functions
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether no functions are currently advertised
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Subscribes to add/update/remove deltas
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CapabilityChange> {
        self.changes.subscribe()
    }

    /// Stops the listener; idempotent
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
