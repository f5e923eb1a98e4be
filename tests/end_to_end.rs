//! End-to-end scenarios: interface -> agent -> service over the
//! in-process fabric, with chain monitoring observed from the side.

mod common;

use common::{ChainRecorder, RelayExecutor, participant, spawn_calc_service, tool_call};
use genesis::llm::scripted::{FailingClassifier, KeywordClassifier};
use genesis::{
    AgentBase, ChainEventKind, ChainId, DomainId, Fabric, FunctionReply, FunctionRequest,
    InterfaceBase, LogMessage, MemoryFabric, OperationKind, PreferredName, RequestId,
    RequestMetadata, Requester, ServiceBase, ServiceName, TopicDescriptor, TopicReader, topics,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

async fn spawn_agent(
    fabric: &MemoryFabric,
    name: &str,
    executor: RelayExecutor,
) -> (Arc<AgentBase>, JoinHandle<()>) {
    let agent = Arc::new(
        AgentBase::new(
            participant(fabric).await,
            PreferredName::try_new(name.to_string()).unwrap(),
            ServiceName::try_new(name.to_string()).unwrap(),
            Arc::new(KeywordClassifier::new()),
            Arc::new(executor),
        )
        .await
        .unwrap(),
    );
    let serve = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move {
            let _ = agent.run().await;
        }
    });
    (agent, serve)
}

async fn connected_interface(
    fabric: &MemoryFabric,
    agent_name: &str,
) -> (InterfaceBase, genesis::AgentHandle) {
    let interface = InterfaceBase::new(participant(fabric).await).await.unwrap();
    let registration = interface
        .directory()
        .wait_for_named(agent_name, Duration::from_secs(5))
        .await
        .unwrap();
    let handle = interface.connect_to_agent(&registration).await.unwrap();
    (interface, handle)
}

#[test_log::test(tokio::test)]
async fn direct_function_call_reaches_the_service() {
    let fabric = MemoryFabric::new();
    let recorder = ChainRecorder::spawn(&fabric);
    let calc = spawn_calc_service(&fabric, "calc").await;
    let (agent, agent_serve) = spawn_agent(
        &fabric,
        "assistant",
        RelayExecutor::new(vec![vec![tool_call("add", json!({"x": 17, "y": 25}))]]),
    )
    .await;
    let (interface, handle) = connected_interface(&fabric, "assistant").await;

    let reply = handle.send("What is 17 plus 25?").await.unwrap();
    assert!(reply.contains("42"), "expected 42 in {reply:?}");

    // Exactly one CALL_START -> CALL_COMPLETE pair, resolving to `add`.
    let events = recorder
        .wait_until(
            |events| {
                events
                    .iter()
                    .any(|e| e.kind == ChainEventKind::CallComplete)
            },
            Duration::from_secs(2),
        )
        .await;
    let starts: Vec<_> = events
        .iter()
        .filter(|e| e.kind == ChainEventKind::CallStart)
        .collect();
    let completes: Vec<_> = events
        .iter()
        .filter(|e| e.kind == ChainEventKind::CallComplete)
        .collect();
    assert_eq!(starts.len(), 1);
    assert_eq!(completes.len(), 1);
    assert_eq!(starts[0].function_id, Some(calc.add_id));
    assert_eq!(completes[0].function_id, Some(calc.add_id));
    assert!(
        events
            .iter()
            .all(|e| e.kind != ChainEventKind::CallError)
    );

    handle.close().await;
    interface.close().await;
    agent.close().await;
    agent_serve.abort();
    calc.service.close().await;
    calc.serve.abort();
}

#[tokio::test]
async fn two_step_reasoning_shares_one_chain() {
    let fabric = MemoryFabric::new();
    let recorder = ChainRecorder::spawn(&fabric);
    let calc = spawn_calc_service(&fabric, "calc").await;
    let (agent, agent_serve) = spawn_agent(
        &fabric,
        "assistant",
        RelayExecutor::new(vec![
            vec![tool_call("add", json!({"x": 3, "y": 4}))],
            vec![tool_call("multiply", json!({"x": 7, "y": 5}))],
        ]),
    )
    .await;
    let (interface, handle) = connected_interface(&fabric, "assistant").await;

    let reply = handle.send("compute (3 add 4) multiply 5").await.unwrap();
    assert!(reply.contains("35"), "expected 35 in {reply:?}");

    let events = recorder
        .wait_until(
            |events| {
                events
                    .iter()
                    .filter(|e| e.kind == ChainEventKind::CallComplete)
                    .count()
                    >= 2
            },
            Duration::from_secs(2),
        )
        .await;
    let completes: Vec<_> = events
        .iter()
        .filter(|e| e.kind == ChainEventKind::CallComplete)
        .collect();
    assert_eq!(completes.len(), 2);
    // add happens before multiply, on the same chain, with distinct calls.
    assert_eq!(completes[0].function_id, Some(calc.add_id));
    assert_eq!(completes[1].function_id, Some(calc.multiply_id));
    assert_eq!(completes[0].chain_id, completes[1].chain_id);
    assert_ne!(completes[0].call_id, completes[1].call_id);

    handle.close().await;
    interface.close().await;
    agent.close().await;
    agent_serve.abort();
    calc.service.close().await;
    calc.serve.abort();
}

#[tokio::test]
async fn multiple_calls_in_one_turn_execute_in_order() {
    let fabric = MemoryFabric::new();
    let recorder = ChainRecorder::spawn(&fabric);
    let calc = spawn_calc_service(&fabric, "calc").await;
    let (agent, agent_serve) = spawn_agent(
        &fabric,
        "assistant",
        RelayExecutor::new(vec![vec![
            tool_call("add", json!({"x": 1, "y": 2})),
            tool_call("multiply", json!({"x": 2, "y": 3})),
        ]]),
    )
    .await;
    let (interface, handle) = connected_interface(&fabric, "assistant").await;

    handle.send("add then multiply").await.unwrap();

    let events = recorder
        .wait_until(
            |events| {
                events
                    .iter()
                    .filter(|e| e.kind == ChainEventKind::CallComplete)
                    .count()
                    >= 2
            },
            Duration::from_secs(2),
        )
        .await;
    let completes: Vec<_> = events
        .iter()
        .filter(|e| e.kind == ChainEventKind::CallComplete)
        .collect();
    assert_eq!(completes[0].function_id, Some(calc.add_id));
    assert_eq!(completes[1].function_id, Some(calc.multiply_id));

    handle.close().await;
    interface.close().await;
    agent.close().await;
    agent_serve.abort();
    calc.service.close().await;
    calc.serve.abort();
}

#[tokio::test]
async fn unknown_function_becomes_a_tool_error_not_a_crash() {
    let fabric = MemoryFabric::new();
    let calc = spawn_calc_service(&fabric, "calc").await;
    let (agent, agent_serve) = spawn_agent(
        &fabric,
        "assistant",
        RelayExecutor::new(vec![vec![tool_call("subtract", json!({"x": 5, "y": 3}))]]),
    )
    .await;
    let (interface, handle) = connected_interface(&fabric, "assistant").await;

    // The relayed final text carries the synthetic tool error.
    let reply = handle.send("subtract these").await.unwrap();
    assert!(
        reply.contains("unknown function"),
        "expected tool error in {reply:?}"
    );
    assert_eq!(calc.invocations.load(std::sync::atomic::Ordering::SeqCst), 0);

    handle.close().await;
    interface.close().await;
    agent.close().await;
    agent_serve.abort();
    calc.service.close().await;
    calc.serve.abort();
}

#[tokio::test]
async fn classifier_failure_falls_back_to_full_list() {
    let fabric = MemoryFabric::new();
    let calc = spawn_calc_service(&fabric, "calc").await;

    let agent = Arc::new(
        AgentBase::new(
            participant(&fabric).await,
            PreferredName::try_new("assistant".to_string()).unwrap(),
            ServiceName::try_new("assistant".to_string()).unwrap(),
            Arc::new(FailingClassifier),
            Arc::new(RelayExecutor::new(vec![vec![tool_call(
                "add",
                json!({"x": 20, "y": 22}),
            )]])),
        )
        .await
        .unwrap(),
    );
    let agent_serve = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move {
            let _ = agent.run().await;
        }
    });
    let (interface, handle) = connected_interface(&fabric, "assistant").await;

    let reply = handle.send("What is 20 plus 22?").await.unwrap();
    assert!(reply.contains("42"), "expected 42 in {reply:?}");

    handle.close().await;
    interface.close().await;
    agent.close().await;
    agent_serve.abort();
    calc.service.close().await;
    calc.serve.abort();
}

#[tokio::test]
async fn schema_violation_is_rejected_before_the_handler() {
    let fabric = MemoryFabric::new();
    let recorder = ChainRecorder::spawn(&fabric);
    let calc = spawn_calc_service(&fabric, "calc").await;

    let caller = participant(&fabric).await;
    let requester: Requester<FunctionRequest, FunctionReply> =
        Requester::new(&caller, ServiceName::try_new("calc".to_string()).unwrap()).unwrap();
    requester
        .wait_for_replier(Duration::from_secs(2))
        .await
        .unwrap();

    let request = FunctionRequest {
        request_id: RequestId::generate(),
        function_id: calc.add_id,
        parameters: json!({"x": "hello", "y": 1}).to_string(),
        timestamp: chrono::Utc::now(),
        metadata: RequestMetadata {
            caller_id: caller.guid(),
            chain_id: ChainId::generate(),
            call_id: genesis::CallId::generate(),
        },
    };
    let reply = requester.call(&request, Duration::from_secs(2)).await.unwrap();

    assert!(!reply.success);
    let message = reply.error_message.unwrap();
    assert!(
        message.contains("schema validation failed"),
        "unexpected message: {message}"
    );
    // The implementation was never entered.
    assert_eq!(calc.invocations.load(std::sync::atomic::Ordering::SeqCst), 0);

    let events = recorder
        .wait_until(
            |events| events.iter().any(|e| e.kind == ChainEventKind::CallError),
            Duration::from_secs(2),
        )
        .await;
    assert!(events.iter().any(|e| {
        e.kind == ChainEventKind::CallError && e.function_id == Some(calc.add_id)
    }));

    requester.close().await;
    calc.service.close().await;
    calc.serve.abort();
}

#[tokio::test]
async fn pool_fan_out_serves_every_request_exactly_once() {
    let fabric = MemoryFabric::new();
    let recorder = ChainRecorder::spawn(&fabric);
    let first = spawn_calc_service(&fabric, "calc").await;
    let second = spawn_calc_service(&fabric, "calc").await;

    let caller = participant(&fabric).await;
    let requester: Requester<FunctionRequest, FunctionReply> =
        Requester::new(&caller, ServiceName::try_new("calc".to_string()).unwrap()).unwrap();
    requester
        .wait_for_replier(Duration::from_secs(2))
        .await
        .unwrap();

    for i in 0..50 {
        let request = FunctionRequest {
            request_id: RequestId::generate(),
            function_id: first.add_id,
            parameters: json!({"x": i, "y": 1}).to_string(),
            timestamp: chrono::Utc::now(),
            metadata: RequestMetadata {
                caller_id: caller.guid(),
                chain_id: ChainId::generate(),
                call_id: genesis::CallId::generate(),
            },
        };
        let reply = requester.call(&request, Duration::from_secs(2)).await.unwrap();
        assert!(reply.success, "request {i} failed: {:?}", reply.error_message);
        assert_eq!(reply.request_id, request.request_id);
    }

    // Both instances served, and no request was served twice.
    let total = first.invocations.load(std::sync::atomic::Ordering::SeqCst)
        + second.invocations.load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(total, 50);
    assert!(first.invocations.load(std::sync::atomic::Ordering::SeqCst) > 0);
    assert!(second.invocations.load(std::sync::atomic::Ordering::SeqCst) > 0);

    let events = recorder
        .wait_until(
            |events| {
                events
                    .iter()
                    .filter(|e| e.kind == ChainEventKind::CallComplete)
                    .count()
                    >= 50
            },
            Duration::from_secs(2),
        )
        .await;
    let providers: std::collections::HashSet<_> = events
        .iter()
        .filter(|e| e.kind == ChainEventKind::CallComplete)
        .filter_map(|e| e.target)
        .collect();
    assert_eq!(providers.len(), 2, "expected both pool instances observed");

    requester.close().await;
    first.service.close().await;
    first.serve.abort();
    second.service.close().await;
    second.serve.abort();
}

#[tokio::test]
async fn results_round_trip_as_json() {
    let fabric = MemoryFabric::new();
    let echo_participant = participant(&fabric).await;
    let service = Arc::new(
        genesis::ServiceBase::new(echo_participant, ServiceName::try_new("echo".to_string()).unwrap())
            .await
            .unwrap(),
    );
    service
        .register_function(
            "echo",
            "Returns its arguments",
            json!({"type": "object"}),
            vec![],
            genesis::OperationKind::Query,
            Arc::new(genesis::handler_fn(|args: serde_json::Value, _ctx: genesis::RequestContext| async move {
                Ok::<serde_json::Value, genesis::HandlerError>(args)
            })),
        )
        .unwrap();
    let noop_id = service.register_function(
        "noop",
        "Does nothing",
        json!({"type": "object"}),
        vec![],
        genesis::OperationKind::Query,
        Arc::new(genesis::handler_fn(|_args: serde_json::Value, _ctx: genesis::RequestContext| async move {
            Ok::<serde_json::Value, genesis::HandlerError>(json!(null))
        })),
    );
    assert!(noop_id.is_ok());
    let serve = tokio::spawn({
        let service = Arc::clone(&service);
        async move {
            let _ = service.run().await;
        }
    });

    let caller = participant(&fabric).await;
    let requester: Requester<FunctionRequest, FunctionReply> =
        Requester::new(&caller, ServiceName::try_new("echo".to_string()).unwrap()).unwrap();
    requester
        .wait_for_replier(Duration::from_secs(2))
        .await
        .unwrap();

    let payload = json!({
        "nested": {"list": [1, 2.5, "three"], "flag": true},
        "unicode": "héllo wörld",
        "null": null
    });
    let request = FunctionRequest {
        request_id: RequestId::generate(),
        function_id: genesis::FunctionId::derive(
            &ServiceName::try_new("echo".to_string()).unwrap(),
            &genesis::FunctionName::try_new("echo".to_string()).unwrap(),
        ),
        parameters: payload.to_string(),
        timestamp: chrono::Utc::now(),
        metadata: RequestMetadata {
            caller_id: caller.guid(),
            chain_id: ChainId::generate(),
            call_id: genesis::CallId::generate(),
        },
    };
    let reply = requester.call(&request, Duration::from_secs(2)).await.unwrap();
    assert!(reply.success);
    let decoded: serde_json::Value = serde_json::from_str(&reply.result).unwrap();
    assert_eq!(decoded, payload);

    requester.close().await;
    service.close().await;
    serve.abort();
}

#[tokio::test]
async fn handler_failure_reaches_the_log_topic() {
    let fabric = MemoryFabric::new();

    // Attach a log reader before the provider exists so nothing is missed.
    let observer = fabric.attach(DomainId::default()).unwrap();
    let raw = observer
        .create_reader(&TopicDescriptor::best_effort_event(topics::LOG_MESSAGE))
        .unwrap();
    let mut log_reader: TopicReader<LogMessage> = TopicReader::new(raw);

    let service = Arc::new(
        ServiceBase::new(
            participant(&fabric).await,
            ServiceName::try_new("flaky".to_string()).unwrap(),
        )
        .await
        .unwrap(),
    );
    let explode_id = service
        .register_function(
            "explode",
            "Always fails",
            json!({"type": "object"}),
            vec![],
            OperationKind::Command,
            Arc::new(genesis::handler_fn(
                |_args: serde_json::Value, _ctx: genesis::RequestContext| async move {
                    Err::<serde_json::Value, genesis::HandlerError>("boom".into())
                },
            )),
        )
        .unwrap();
    let serve = tokio::spawn({
        let service = Arc::clone(&service);
        async move {
            let _ = service.run().await;
        }
    });

    let caller = participant(&fabric).await;
    let requester: Requester<FunctionRequest, FunctionReply> =
        Requester::new(&caller, ServiceName::try_new("flaky".to_string()).unwrap()).unwrap();
    requester
        .wait_for_replier(Duration::from_secs(2))
        .await
        .unwrap();

    let request = FunctionRequest {
        request_id: RequestId::generate(),
        function_id: explode_id,
        parameters: json!({}).to_string(),
        timestamp: chrono::Utc::now(),
        metadata: RequestMetadata {
            caller_id: caller.guid(),
            chain_id: ChainId::generate(),
            call_id: genesis::CallId::generate(),
        },
    };
    let reply = requester.call(&request, Duration::from_secs(2)).await.unwrap();
    assert!(!reply.success);
    assert!(reply.error_message.unwrap().contains("invocation failed"));

    // The failure also lands on the best-effort log stream.
    let record = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let sample = log_reader.take().await.expect("log topic closed");
            if let Some(record) = sample.data {
                if record.level == "ERROR" {
                    return record;
                }
            }
        }
    })
    .await
    .expect("no error record on the log topic");
    assert!(record.message.contains(&explode_id.to_string()));

    requester.close().await;
    service.close().await;
    serve.abort();
}
