//! Request/reply plumbing
//!
//! A [`Requester`] writes to a service's request queue and pumps the
//! reply topic into per-request oneshot channels, correlating strictly by
//! request id; arrival order is irrelevant and multiple requests may be
//! outstanding. A [`Replier`] drains the request queue and writes
//! replies. Every outbound call carries an explicit timeout; expiration
//! yields a typed failure, never a hang.

use crate::domain_types::{RequestId, ServiceName};
use crate::messages::Correlated;
use crate::participant::Participant;
use crate::transport::{TopicDescriptor, TopicReader, TopicWriter, TransportError, topics};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// RPC errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },

    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout {
        request_id: RequestId,
        timeout_ms: u64,
    },

    #[error("request {request_id} cancelled")]
    Cancelled { request_id: RequestId },

    #[error("reply channel closed for request {request_id}")]
    ReplyChannelClosed { request_id: RequestId },
}

/// Calls a named service and awaits correlated replies
pub struct Requester<Req, Rep> {
    service_name: ServiceName,
    request_writer: TopicWriter<Req>,
    pending: Arc<DashMap<RequestId, oneshot::Sender<Rep>>>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<Req, Rep> Requester<Req, Rep>
where
    Req: Correlated + Serialize + Send + Sync + 'static,
    Rep: Correlated + DeserializeOwned + Send + 'static,
{
    /// Builds the request writer and reply pump for a service channel
    ///
    /// # Errors
    /// Fails when either endpoint cannot be created.
    pub fn new(participant: &Participant, service_name: ServiceName) -> Result<Self, RpcError> {
        let max_payload = participant.config().max_payload_bytes.as_usize();
        let request_topic = topics::rpc_request(service_name.as_str());
        let reply_topic = topics::rpc_reply(service_name.as_str());

        let request_raw = participant
            .peer()
            .create_writer(&TopicDescriptor::queue(request_topic.clone()))?;
        let request_writer = TopicWriter::new(request_raw, request_topic, max_payload);

        let reply_raw = participant
            .peer()
            .create_reader(&TopicDescriptor::event(reply_topic.clone()))?;
        let reply_reader: TopicReader<Rep> = TopicReader::new(reply_raw);

        let pending: Arc<DashMap<RequestId, oneshot::Sender<Rep>>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(Self::pump_replies(
            reply_reader,
            Arc::clone(&pending),
            cancel.clone(),
        ));

        Ok(Self {
            service_name,
            request_writer,
            pending,
            cancel,
            pump: Mutex::new(Some(pump)),
        })
    }

    async fn pump_replies(
        mut reader: TopicReader<Rep>,
        pending: Arc<DashMap<RequestId, oneshot::Sender<Rep>>>,
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
            let Some(reply) = sample.data else {
                if sample.is_malformed() {
                    warn!(key = %sample.key, "skipping malformed reply sample");
                }
                continue;
            };
            // Replies for other requesters on the same channel land here
            // too; anything without a pending entry is simply not ours.
            if let Some((_, tx)) = pending.remove(&reply.request_id()) {
                let _ = tx.send(reply);
            }
        }
    }

    /// The service this requester targets
    #[must_use]
    pub fn service_name(&self) -> &ServiceName {
        &self.service_name
    }

    /// Number of currently matched repliers
    #[must_use]
    pub fn matched_repliers(&self) -> usize {
        self.request_writer.matched_readers()
    }

    /// Waits until at least one replier is matched
    ///
    /// # Errors
    /// Returns a transport discovery timeout when none appears in time.
    pub async fn wait_for_replier(&self, timeout: Duration) -> Result<(), RpcError> {
        self.request_writer.wait_matched(timeout).await?;
        Ok(())
    }

    /// Sends one request and awaits its correlated reply
    ///
    /// # Errors
    /// - [`RpcError::Timeout`] when no reply arrives in time
    /// - [`RpcError::Cancelled`] when the requester is closed mid-flight
    /// - [`RpcError::Transport`] when the request cannot be written
    pub async fn call(&self, request: &Req, timeout: Duration) -> Result<Rep, RpcError> {
        let request_id = request.request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        if let Err(source) = self
            .request_writer
            .write(&request_id.to_string(), request)
            .await
        {
            self.pending.remove(&request_id);
            return Err(source.into());
        }

        tokio::select! {
            () = self.cancel.cancelled() => {
                self.pending.remove(&request_id);
                Err(RpcError::Cancelled { request_id })
            }
            outcome = tokio::time::timeout(timeout, rx) => match outcome {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => {
                    self.pending.remove(&request_id);
                    Err(RpcError::ReplyChannelClosed { request_id })
                }
                Err(_) => {
                    self.pending.remove(&request_id);
                    Err(RpcError::Timeout {
                        request_id,
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            }
        }
    }

    /// Cancels in-flight calls and stops the reply pump; idempotent
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.pending.clear();
    }
}

/// Serves a named RPC channel
pub struct Replier<Req, Rep> {
    service_name: ServiceName,
    request_reader: TopicReader<Req>,
    reply_writer: TopicWriter<Rep>,
}

impl<Req, Rep> Replier<Req, Rep>
where
    Req: Correlated + DeserializeOwned + Send + 'static,
    Rep: Correlated + Serialize + Send + Sync + 'static,
{
    /// Builds the request reader and reply writer for a service channel
    ///
    /// # Errors
    /// Fails when either endpoint cannot be created.
    pub fn new(participant: &Participant, service_name: ServiceName) -> Result<Self, RpcError> {
        let max_payload = participant.config().max_payload_bytes.as_usize();
        let request_topic = topics::rpc_request(service_name.as_str());
        let reply_topic = topics::rpc_reply(service_name.as_str());

        let request_raw = participant
            .peer()
            .create_reader(&TopicDescriptor::queue(request_topic.clone()))?;
        let reply_raw = participant
            .peer()
            .create_writer(&TopicDescriptor::event(reply_topic.clone()))?;

        Ok(Self {
            service_name,
            request_reader: TopicReader::new(request_raw),
            reply_writer: TopicWriter::new(reply_raw, reply_topic, max_payload),
        })
    }

    /// The service this replier serves
    #[must_use]
    pub fn service_name(&self) -> &ServiceName {
        &self.service_name
    }

    /// Receives the next request; `None` once the channel is closed.
    ///
    /// Malformed samples are skipped with a warning.
    pub async fn recv(&mut self) -> Option<Req> {
        loop {
            let sample = self.request_reader.take().await?;
            match sample.data {
                Some(request) => return Some(request),
                None => {
                    if sample.is_malformed() {
                        warn!(key = %sample.key, "skipping malformed request sample");
                    }
                }
            }
        }
    }

    /// Writes one reply, keyed by the request id
    ///
    /// # Errors
    /// Propagates transport write failures; callers log and do not retry.
    pub async fn reply(&self, reply: &Rep) -> Result<(), RpcError> {
        self.reply_writer
            .write(&reply.request_id().to_string(), reply)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisConfig;
    use crate::domain_types::{CallId, ChainId, FunctionId, ParticipantGuid};
    use crate::messages::{FunctionReply, FunctionRequest, RequestMetadata};
    use crate::transport::memory::MemoryFabric;
    use chrono::Utc;

    async fn participant(fabric: &MemoryFabric) -> Participant {
        Participant::new(fabric, GenesisConfig::development())
            .await
            .unwrap()
    }

    fn request(guid: ParticipantGuid) -> FunctionRequest {
        FunctionRequest {
            request_id: RequestId::generate(),
            function_id: FunctionId::generate(),
            parameters: r#"{"x":1,"y":2}"#.to_string(),
            timestamp: Utc::now(),
            metadata: RequestMetadata {
                caller_id: guid,
                chain_id: ChainId::generate(),
                call_id: CallId::generate(),
            },
        }
    }

    fn service() -> ServiceName {
        ServiceName::try_new("calc".to_string()).unwrap()
    }

    #[tokio::test]
    async fn round_trip_correlates_by_request_id() {
        let fabric = MemoryFabric::new();
        let caller = participant(&fabric).await;
        let server = participant(&fabric).await;

        let requester: Requester<FunctionRequest, FunctionReply> =
            Requester::new(&caller, service()).unwrap();
        let mut replier: Replier<FunctionRequest, FunctionReply> =
            Replier::new(&server, service()).unwrap();

        let serve = tokio::spawn(async move {
            while let Some(req) = replier.recv().await {
                let reply = FunctionReply::success(&req, "3".to_string());
                replier.reply(&reply).await.unwrap();
            }
        });

        let req = request(caller.guid());
        let reply = requester.call(&req, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.request_id, req.request_id);
        assert!(reply.success);

        requester.close().await;
        serve.abort();
    }

    #[tokio::test]
    async fn concurrent_requests_each_get_their_own_reply() {
        let fabric = MemoryFabric::new();
        let caller = participant(&fabric).await;
        let server = participant(&fabric).await;

        let requester: Arc<Requester<FunctionRequest, FunctionReply>> =
            Arc::new(Requester::new(&caller, service()).unwrap());
        let mut replier: Replier<FunctionRequest, FunctionReply> =
            Replier::new(&server, service()).unwrap();

        // Reply in reverse arrival order to prove correlation is by id.
        let serve = tokio::spawn(async move {
            let mut batch = Vec::new();
            for _ in 0..4 {
                batch.push(replier.recv().await.unwrap());
            }
            batch.reverse();
            for req in batch {
                let reply = FunctionReply::success(&req, req.parameters.clone());
                replier.reply(&reply).await.unwrap();
            }
        });

        let mut handles = Vec::new();
        for i in 0..4 {
            let requester = Arc::clone(&requester);
            let guid = caller.guid();
            handles.push(tokio::spawn(async move {
                let mut req = request(guid);
                req.parameters = format!("{i}");
                let reply = requester.call(&req, Duration::from_secs(1)).await.unwrap();
                assert_eq!(reply.request_id, req.request_id);
                assert_eq!(reply.result, format!("{i}"));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn missing_reply_times_out() {
        let fabric = MemoryFabric::new();
        let caller = participant(&fabric).await;
        let server = participant(&fabric).await;

        let requester: Requester<FunctionRequest, FunctionReply> =
            Requester::new(&caller, service()).unwrap();
        // A replier that never answers.
        let mut replier: Replier<FunctionRequest, FunctionReply> =
            Replier::new(&server, service()).unwrap();
        let serve = tokio::spawn(async move {
            let _ = replier.recv().await;
            std::future::pending::<()>().await;
        });

        let req = request(caller.guid());
        let outcome = requester.call(&req, Duration::from_millis(50)).await;
        assert!(matches!(outcome, Err(RpcError::Timeout { .. })));
        serve.abort();
    }

    #[tokio::test]
    async fn close_cancels_in_flight_call() {
        let fabric = MemoryFabric::new();
        let caller = participant(&fabric).await;
        let server = participant(&fabric).await;

        let requester: Arc<Requester<FunctionRequest, FunctionReply>> =
            Arc::new(Requester::new(&caller, service()).unwrap());
        let mut replier: Replier<FunctionRequest, FunctionReply> =
            Replier::new(&server, service()).unwrap();
        let serve = tokio::spawn(async move {
            let _ = replier.recv().await;
            std::future::pending::<()>().await;
        });

        let req = request(caller.guid());
        let in_flight = {
            let requester = Arc::clone(&requester);
            tokio::spawn(async move { requester.call(&req, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        requester.close().await;

        let outcome = in_flight.await.unwrap();
        assert!(matches!(outcome, Err(RpcError::Cancelled { .. })));
        serve.abort();
    }
}
