//! In-process reference fabric
//!
//! An explicitly shared, in-memory implementation of the transport
//! semantics: per-topic broadcast for event topics, competing consumers
//! for queue topics, a retained instance cache for transient-local
//! durability, and writer-owned instance liveliness. A [`MemoryFabric`]
//! is `Clone` and cheap; participants only match within the same domain.

use super::{
    Durability, Fabric, FabricPeer, InstanceState, RawReader, RawSample, RawWriter,
    TopicDescriptor, TopicKind, TransportError,
};
use crate::domain_types::{DomainId, ParticipantGuid};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::warn;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const QUEUE_CHANNEL_CAPACITY: usize = 1024;

/// Shared in-process fabric
#[derive(Clone, Default)]
pub struct MemoryFabric {
    shared: Arc<FabricShared>,
}

#[derive(Default)]
struct FabricShared {
    topics: DashMap<(u32, String), Arc<TopicCore>>,
}

impl MemoryFabric {
    /// Creates an empty fabric
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Fabric for MemoryFabric {
    fn attach(&self, domain_id: DomainId) -> Result<Arc<dyn FabricPeer>, TransportError> {
        Ok(Arc::new(MemoryPeer {
            guid: ParticipantGuid::generate(),
            domain: domain_id,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

struct RetainedInstance {
    payload: Bytes,
    writer: ParticipantGuid,
    owners: HashSet<u64>,
}

struct TopicCore {
    descriptor: TopicDescriptor,
    event_tx: broadcast::Sender<RawSample>,
    retained: DashMap<String, RetainedInstance>,
    consumers: Mutex<Vec<(u64, mpsc::Sender<RawSample>)>>,
    next_endpoint_id: AtomicU64,
    reader_count_tx: watch::Sender<usize>,
    writer_count: AtomicUsize,
    rr_cursor: AtomicUsize,
}

impl TopicCore {
    fn new(descriptor: TopicDescriptor) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (reader_count_tx, _) = watch::channel(0);
        Self {
            descriptor,
            event_tx,
            retained: DashMap::new(),
            consumers: Mutex::new(Vec::new()),
            next_endpoint_id: AtomicU64::new(0),
            reader_count_tx,
            writer_count: AtomicUsize::new(0),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    fn allocate_endpoint_id(&self) -> u64 {
        self.next_endpoint_id.fetch_add(1, Ordering::SeqCst)
    }

    fn adjust_reader_count(&self, delta: isize) {
        self.reader_count_tx.send_modify(|count| {
            *count = count.saturating_add_signed(delta);
        });
    }

    /// Removes a writer's claim on an instance, announcing NO_WRITERS when
    /// the last claim goes away.
    fn release_instance(&self, key: &str, writer_id: u64, guid: ParticipantGuid) {
        let emptied = if let Some(mut entry) = self.retained.get_mut(key) {
            entry.owners.remove(&writer_id);
            entry.owners.is_empty()
        } else {
            false
        };
        if emptied {
            self.retained.remove(key);
            let _ = self.event_tx.send(RawSample {
                key: key.to_string(),
                state: InstanceState::NotAliveNoWriters,
                payload: None,
                writer: guid,
            });
        }
    }
}

struct MemoryPeer {
    guid: ParticipantGuid,
    domain: DomainId,
    shared: Arc<FabricShared>,
    closed: AtomicBool,
}

impl MemoryPeer {
    fn topic(&self, descriptor: &TopicDescriptor) -> Result<Arc<TopicCore>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                topic: descriptor.name.clone(),
            });
        }
        let key = (self.domain.as_u32(), descriptor.name.clone());
        let core = self
            .shared
            .topics
            .entry(key)
            .or_insert_with(|| Arc::new(TopicCore::new(descriptor.clone())))
            .clone();
        if core.descriptor != *descriptor {
            return Err(TransportError::TopicMismatch {
                topic: descriptor.name.clone(),
            });
        }
        Ok(core)
    }

    fn lookup(&self, topic_name: &str) -> Option<Arc<TopicCore>> {
        self.shared
            .topics
            .get(&(self.domain.as_u32(), topic_name.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl FabricPeer for MemoryPeer {
    fn guid(&self) -> ParticipantGuid {
        self.guid
    }

    fn domain_id(&self) -> DomainId {
        self.domain
    }

    fn create_writer(&self, topic: &TopicDescriptor) -> Result<Box<dyn RawWriter>, TransportError> {
        let core = self.topic(topic)?;
        core.writer_count.fetch_add(1, Ordering::SeqCst);
        let matched_rx = core.reader_count_tx.subscribe();
        Ok(Box::new(MemoryWriter {
            writer_id: core.allocate_endpoint_id(),
            guid: self.guid,
            written: Mutex::new(HashSet::new()),
            matched_rx,
            core,
        }))
    }

    fn create_reader(&self, topic: &TopicDescriptor) -> Result<Box<dyn RawReader>, TransportError> {
        let core = self.topic(topic)?;
        let reader_id = core.allocate_endpoint_id();
        let inner = match core.descriptor.kind {
            TopicKind::Event => {
                // Subscribe before snapshotting the retained set so nothing
                // is missed; a sample may arrive through both paths, which
                // listeners absorb as an idempotent upsert.
                let rx = core.event_tx.subscribe();
                let replay: VecDeque<RawSample> = if core.descriptor.durability
                    == Durability::TransientLocal
                {
                    core.retained
                        .iter()
                        .map(|entry| RawSample {
                            key: entry.key().clone(),
                            state: InstanceState::Alive,
                            payload: Some(entry.value().payload.clone()),
                            writer: entry.value().writer,
                        })
                        .collect()
                } else {
                    VecDeque::new()
                };
                ReaderInner::Event { replay, rx }
            }
            TopicKind::Queue => {
                let (tx, rx) = mpsc::channel(QUEUE_CHANNEL_CAPACITY);
                core.consumers
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push((reader_id, tx));
                ReaderInner::Queue { rx }
            }
        };
        core.adjust_reader_count(1);
        Ok(Box::new(MemoryReader {
            reader_id,
            core,
            inner,
        }))
    }

    fn reader_count(&self, topic_name: &str) -> usize {
        self.lookup(topic_name)
            .map_or(0, |core| *core.reader_count_tx.borrow())
    }

    fn writer_count(&self, topic_name: &str) -> usize {
        self.lookup(topic_name)
            .map_or(0, |core| core.writer_count.load(Ordering::SeqCst))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryWriter {
    writer_id: u64,
    guid: ParticipantGuid,
    written: Mutex<HashSet<String>>,
    matched_rx: watch::Receiver<usize>,
    core: Arc<TopicCore>,
}

impl MemoryWriter {
    fn record_written(&self, key: &str) {
        self.written
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string());
    }

    fn forget_written(&self, key: &str) {
        self.written
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }

    async fn write_queue(&self, sample: RawSample) -> Result<(), TransportError> {
        loop {
            let picked = {
                let mut consumers = self
                    .core
                    .consumers
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                consumers.retain(|(_, tx)| !tx.is_closed());
                if consumers.is_empty() {
                    return Err(TransportError::NoMatchedPeer {
                        topic: self.core.descriptor.name.clone(),
                    });
                }
                let index = self.core.rr_cursor.fetch_add(1, Ordering::SeqCst) % consumers.len();
                consumers[index].clone()
            };
            if picked.1.send(sample.clone()).await.is_ok() {
                return Ok(());
            }
            // Consumer went away between pick and send; retry with the rest.
        }
    }
}

#[async_trait]
impl RawWriter for MemoryWriter {
    async fn write(&self, key: &str, payload: Bytes) -> Result<(), TransportError> {
        let sample = RawSample {
            key: key.to_string(),
            state: InstanceState::Alive,
            payload: Some(payload.clone()),
            writer: self.guid,
        };
        match self.core.descriptor.kind {
            TopicKind::Event => {
                if self.core.descriptor.durability == Durability::TransientLocal {
                    match self.core.retained.entry(key.to_string()) {
                        dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                            let instance = occupied.get_mut();
                            instance.payload = payload;
                            instance.writer = self.guid;
                            instance.owners.insert(self.writer_id);
                        }
                        dashmap::mapref::entry::Entry::Vacant(vacant) => {
                            vacant.insert(RetainedInstance {
                                payload,
                                writer: self.guid,
                                owners: HashSet::from([self.writer_id]),
                            });
                        }
                    }
                    self.record_written(key);
                }
                let _ = self.core.event_tx.send(sample);
                Ok(())
            }
            TopicKind::Queue => self.write_queue(sample).await,
        }
    }

    async fn dispose(&self, key: &str) -> Result<(), TransportError> {
        if self.core.descriptor.kind != TopicKind::Event {
            return Ok(());
        }
        self.core.retained.remove(key);
        self.forget_written(key);
        let _ = self.core.event_tx.send(RawSample {
            key: key.to_string(),
            state: InstanceState::NotAliveDisposed,
            payload: None,
            writer: self.guid,
        });
        Ok(())
    }

    fn matched_readers(&self) -> usize {
        *self.matched_rx.borrow()
    }

    async fn wait_matched(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.matched_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|count| *count > 0)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed {
                topic: self.core.descriptor.name.clone(),
            }),
            Err(_) => Err(TransportError::DiscoveryTimeout {
                topic: self.core.descriptor.name.clone(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        self.core.writer_count.fetch_sub(1, Ordering::SeqCst);
        let keys: Vec<String> = self
            .written
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .collect();
        for key in keys {
            self.core.release_instance(&key, self.writer_id, self.guid);
        }
    }
}

enum ReaderInner {
    Event {
        replay: VecDeque<RawSample>,
        rx: broadcast::Receiver<RawSample>,
    },
    Queue {
        rx: mpsc::Receiver<RawSample>,
    },
}

struct MemoryReader {
    reader_id: u64,
    core: Arc<TopicCore>,
    inner: ReaderInner,
}

#[async_trait]
impl RawReader for MemoryReader {
    async fn take(&mut self) -> Option<RawSample> {
        match &mut self.inner {
            ReaderInner::Event { replay, rx } => {
                if let Some(sample) = replay.pop_front() {
                    return Some(sample);
                }
                loop {
                    match rx.recv().await {
                        Ok(sample) => return Some(sample),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(
                                topic = %self.core.descriptor.name,
                                missed, "reader lagged; samples dropped"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
            ReaderInner::Queue { rx } => rx.recv().await,
        }
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.core.adjust_reader_count(-1);
        if let ReaderInner::Queue { .. } = self.inner {
            self.core
                .consumers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .retain(|(id, _)| *id != self.reader_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::topics;

    fn attach(fabric: &MemoryFabric) -> Arc<dyn FabricPeer> {
        fabric.attach(DomainId::default()).unwrap()
    }

    #[tokio::test]
    async fn event_topic_delivers_to_all_readers() {
        let fabric = MemoryFabric::new();
        let writer_peer = attach(&fabric);
        let reader_peer = attach(&fabric);

        let descriptor = TopicDescriptor::event("events");
        let mut first = reader_peer.create_reader(&descriptor).unwrap();
        let mut second = reader_peer.create_reader(&descriptor).unwrap();
        let writer = writer_peer.create_writer(&descriptor).unwrap();

        writer.write("k", Bytes::from_static(b"1")).await.unwrap();

        assert_eq!(first.take().await.unwrap().key, "k");
        assert_eq!(second.take().await.unwrap().key, "k");
    }

    #[tokio::test]
    async fn transient_local_replays_to_late_reader() {
        let fabric = MemoryFabric::new();
        let writer_peer = attach(&fabric);
        let descriptor = TopicDescriptor::durable_event(topics::FUNCTION_CAPABILITY);
        let writer = writer_peer.create_writer(&descriptor).unwrap();
        writer.write("f1", Bytes::from_static(b"{}")).await.unwrap();

        let reader_peer = attach(&fabric);
        let mut reader = reader_peer.create_reader(&descriptor).unwrap();
        let sample = reader.take().await.unwrap();
        assert_eq!(sample.key, "f1");
        assert_eq!(sample.state, InstanceState::Alive);
    }

    #[tokio::test]
    async fn writer_drop_announces_no_writers() {
        let fabric = MemoryFabric::new();
        let writer_peer = attach(&fabric);
        let reader_peer = attach(&fabric);
        let descriptor = TopicDescriptor::durable_event(topics::FUNCTION_CAPABILITY);

        let mut reader = reader_peer.create_reader(&descriptor).unwrap();
        let writer = writer_peer.create_writer(&descriptor).unwrap();
        writer.write("f1", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(reader.take().await.unwrap().state, InstanceState::Alive);

        drop(writer);
        let sample = reader.take().await.unwrap();
        assert_eq!(sample.state, InstanceState::NotAliveNoWriters);
        assert_eq!(sample.key, "f1");
    }

    #[tokio::test]
    async fn pooled_writers_keep_instance_alive_until_last_drop() {
        let fabric = MemoryFabric::new();
        let first_peer = attach(&fabric);
        let second_peer = attach(&fabric);
        let reader_peer = attach(&fabric);
        let descriptor = TopicDescriptor::durable_event(topics::FUNCTION_CAPABILITY);

        let mut reader = reader_peer.create_reader(&descriptor).unwrap();
        let first = first_peer.create_writer(&descriptor).unwrap();
        let second = second_peer.create_writer(&descriptor).unwrap();
        first.write("f1", Bytes::from_static(b"{}")).await.unwrap();
        second.write("f1", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(reader.take().await.unwrap().state, InstanceState::Alive);
        assert_eq!(reader.take().await.unwrap().state, InstanceState::Alive);

        drop(first);
        // Still one live writer; no not-alive transition yet.
        second.write("f1", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(reader.take().await.unwrap().state, InstanceState::Alive);

        drop(second);
        assert_eq!(
            reader.take().await.unwrap().state,
            InstanceState::NotAliveNoWriters
        );
    }

    #[tokio::test]
    async fn queue_topic_delivers_each_sample_once() {
        let fabric = MemoryFabric::new();
        let writer_peer = attach(&fabric);
        let reader_peer = attach(&fabric);
        let descriptor = TopicDescriptor::queue(topics::rpc_request("calc"));

        let mut first = reader_peer.create_reader(&descriptor).unwrap();
        let mut second = reader_peer.create_reader(&descriptor).unwrap();
        let writer = writer_peer.create_writer(&descriptor).unwrap();

        for i in 0..10u8 {
            writer
                .write(&format!("r{i}"), Bytes::from(vec![i]))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(first.take().await.unwrap().key);
            seen.push(second.take().await.unwrap().key);
        }
        seen.sort();
        let expected: Vec<String> = {
            let mut keys: Vec<String> = (0..10).map(|i| format!("r{i}")).collect();
            keys.sort();
            keys
        };
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn queue_write_without_consumers_fails() {
        let fabric = MemoryFabric::new();
        let writer_peer = attach(&fabric);
        let descriptor = TopicDescriptor::queue(topics::rpc_request("nobody"));
        let writer = writer_peer.create_writer(&descriptor).unwrap();
        let result = writer.write("r", Bytes::from_static(b"{}")).await;
        assert!(matches!(result, Err(TransportError::NoMatchedPeer { .. })));
    }

    #[tokio::test]
    async fn wait_matched_observes_late_reader() {
        let fabric = MemoryFabric::new();
        let writer_peer = attach(&fabric);
        let reader_peer = attach(&fabric);
        let descriptor = TopicDescriptor::queue(topics::rpc_request("calc"));
        let writer = writer_peer.create_writer(&descriptor).unwrap();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reader_peer.create_reader(&descriptor).unwrap()
        });
        writer.wait_matched(Duration::from_secs(1)).await.unwrap();
        let _reader = handle.await.unwrap();
        assert_eq!(writer.matched_readers(), 1);
    }

    #[tokio::test]
    async fn domains_are_isolated() {
        let fabric = MemoryFabric::new();
        let zero = fabric.attach(DomainId::default()).unwrap();
        let one = fabric.attach(DomainId::try_new(1).unwrap()).unwrap();
        let descriptor = TopicDescriptor::event("events");

        let _reader = zero.create_reader(&descriptor).unwrap();
        let writer = one.create_writer(&descriptor).unwrap();
        assert_eq!(writer.matched_readers(), 0);
        assert_eq!(zero.reader_count("events"), 1);
        assert_eq!(one.reader_count("events"), 0);
    }
}
