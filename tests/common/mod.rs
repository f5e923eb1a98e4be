//! Shared fixtures for the integration suite

use async_trait::async_trait;
use genesis::{
    CapabilityTag, ChainEvent, ChatExecutor, ChatMessage, ChatRole, DomainId, ExecutorTurn, Fabric,
    FunctionId, GenesisConfig, HandlerError, LlmError, MemoryFabric, OperationKind, Participant,
    RequestContext, ServiceBase, ServiceName, ToolCallRequest, ToolDefinition, TopicDescriptor,
    TopicReader, handler_fn, topics,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub async fn participant(fabric: &MemoryFabric) -> Arc<Participant> {
    Arc::new(
        Participant::new(fabric, GenesisConfig::development())
            .await
            .expect("participant"),
    )
}

pub fn number_pair_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "x": {"type": "number"},
            "y": {"type": "number"}
        },
        "required": ["x", "y"]
    })
}

/// A calculator service with `add` and `multiply`, counting invocations.
pub struct CalcService {
    pub service: Arc<ServiceBase>,
    pub add_id: FunctionId,
    pub multiply_id: FunctionId,
    pub invocations: Arc<AtomicUsize>,
    pub serve: JoinHandle<()>,
}

pub async fn spawn_calc_service(fabric: &MemoryFabric, name: &str) -> CalcService {
    let service = Arc::new(
        ServiceBase::new(
            participant(fabric).await,
            ServiceName::try_new(name.to_string()).expect("service name"),
        )
        .await
        .expect("service"),
    );
    let invocations = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&invocations);
    let add_id = service
        .register_function(
            "add",
            "Adds two numbers",
            number_pair_schema(),
            vec![CapabilityTag::try_new("math".to_string()).expect("tag")],
            OperationKind::Query,
            Arc::new(handler_fn(move |args: Value, _ctx: RequestContext| {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    let x = args["x"].as_f64().ok_or("x must be a number")?;
                    let y = args["y"].as_f64().ok_or("y must be a number")?;
                    Ok::<Value, HandlerError>(json!(x + y))
                }
            })),
        )
        .expect("register add");

    let count = Arc::clone(&invocations);
    let multiply_id = service
        .register_function(
            "multiply",
            "Multiplies two numbers",
            number_pair_schema(),
            vec![CapabilityTag::try_new("math".to_string()).expect("tag")],
            OperationKind::Query,
            Arc::new(handler_fn(move |args: Value, _ctx: RequestContext| {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    let x = args["x"].as_f64().ok_or("x must be a number")?;
                    let y = args["y"].as_f64().ok_or("y must be a number")?;
                    Ok::<Value, HandlerError>(json!(x * y))
                }
            })),
        )
        .expect("register multiply");

    let serve = tokio::spawn({
        let service = Arc::clone(&service);
        async move {
            let _ = service.run().await;
        }
    });

    CalcService {
        service,
        add_id,
        multiply_id,
        invocations,
        serve,
    }
}

pub fn tool_call(name: &str, arguments: Value) -> ToolCallRequest {
    ToolCallRequest {
        call_id: format!("call-{name}"),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

/// Replays scripted tool-call batches, then relays the last tool result
/// as the final answer.
pub struct RelayExecutor {
    batches: Mutex<VecDeque<Vec<ToolCallRequest>>>,
}

impl RelayExecutor {
    pub fn new(batches: Vec<Vec<ToolCallRequest>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
        }
    }
}

#[async_trait]
impl ChatExecutor for RelayExecutor {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ExecutorTurn, LlmError> {
        let next = self
            .batches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        if let Some(batch) = next {
            return Ok(ExecutorTurn::ToolCalls(batch));
        }
        let text = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::Tool)
            .or(messages.last())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ExecutorTurn::Final(text))
    }
}

/// Records every chain event published in the default domain.
pub struct ChainRecorder {
    events: Arc<Mutex<Vec<ChainEvent>>>,
    task: JoinHandle<()>,
}

impl ChainRecorder {
    pub fn spawn(fabric: &MemoryFabric) -> Self {
        let peer = fabric.attach(DomainId::default()).expect("attach recorder");
        let raw = peer
            .create_reader(&TopicDescriptor::event(topics::CHAIN_EVENT))
            .expect("chain reader");
        let mut reader: TopicReader<ChainEvent> = TopicReader::new(raw);
        let events: Arc<Mutex<Vec<ChainEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let task = tokio::spawn(async move {
            while let Some(sample) = reader.take().await {
                if let Some(event) = sample.data {
                    sink.lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push(event);
                }
            }
        });
        Self { events, task }
    }

    pub fn snapshot(&self) -> Vec<ChainEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Waits until the recorded events satisfy `predicate`.
    pub async fn wait_until<P>(&self, predicate: P, timeout: Duration) -> Vec<ChainEvent>
    where
        P: Fn(&[ChainEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.snapshot();
            if predicate(&snapshot) || Instant::now() >= deadline {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for ChainRecorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
