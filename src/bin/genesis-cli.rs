//! Genesis CLI - reference interface implementation
//!
//! Connects to an agent discovered on the bus and relays stdin lines as
//! requests. `quit` or `exit` terminates with code 0; configuration and
//! connection failures exit non-zero. `--demo` spawns an in-process
//! calculator service and agent to talk to.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use genesis::llm::scripted::KeywordClassifier;
use genesis::{
    AgentBase, ChatExecutor, ChatMessage, ChatRole, ExecutorTurn, GenesisConfig, HandlerError,
    InterfaceBase, LlmError, MemoryFabric, OperationKind, Participant, PreferredName,
    RequestContext, ServiceName, ToolCallRequest, ToolDefinition, handler_fn,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

/// Genesis CLI - talk to an agent on the bus
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Preferred name of the agent to connect to; auto-selects when omitted
    agent: Option<String>,

    /// Bus domain to join
    #[arg(long, default_value_t = 0)]
    domain_id: u32,

    /// Spawn a built-in calculator service and agent to talk to
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("genesis=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = GenesisConfig::from_env()
        .context("configuration error")?
        .with_domain_id(
            genesis::DomainId::try_new(args.domain_id).context("invalid --domain-id")?,
        );

    let fabric = MemoryFabric::new();

    if args.demo {
        spawn_demo(&fabric, &config).await?;
    }

    let participant = Arc::new(Participant::new(&fabric, config.clone()).await?);
    let interface = InterfaceBase::new(Arc::clone(&participant)).await?;

    let discovery = config.discovery_timeout.as_duration();
    let registration = match &args.agent {
        Some(name) => interface.directory().wait_for_named(name, discovery).await,
        None => interface.directory().wait_for_any(discovery).await,
    }
    .context("no agent available")?;
    info!(agent = %registration.preferred_name, "connecting");

    let handle = interface
        .connect_to_agent(&registration)
        .await
        .context("failed to connect to agent")?;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        match handle.send(line).await {
            Ok(reply) => {
                stdout.write_all(reply.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
            Err(error) => {
                stdout
                    .write_all(format!("error: {error}\n").as_bytes())
                    .await?;
            }
        }
    }

    handle.close().await;
    interface.close().await;
    participant.close().await;
    Ok(())
}

/// Spawns a calculator service and an agent driven by [`DemoExecutor`].
async fn spawn_demo(fabric: &MemoryFabric, config: &GenesisConfig) -> Result<()> {
    let service_participant = Arc::new(Participant::new(fabric, config.clone()).await?);
    let service = Arc::new(
        genesis::ServiceBase::new(service_participant, ServiceName::try_new("calculator".to_string())?).await?,
    );
    let number_pair = json!({
        "type": "object",
        "properties": {
            "x": {"type": "number"},
            "y": {"type": "number"}
        },
        "required": ["x", "y"]
    });
    service.register_function(
        "add",
        "Adds two numbers",
        number_pair.clone(),
        vec![],
        OperationKind::Query,
        Arc::new(handler_fn(|args: Value, _ctx: RequestContext| async move {
            let x = args["x"].as_f64().ok_or("x must be a number")?;
            let y = args["y"].as_f64().ok_or("y must be a number")?;
            Ok::<Value, HandlerError>(json!(x + y))
        })),
    )?;
    service.register_function(
        "multiply",
        "Multiplies two numbers",
        number_pair,
        vec![],
        OperationKind::Query,
        Arc::new(handler_fn(|args: Value, _ctx: RequestContext| async move {
            let x = args["x"].as_f64().ok_or("x must be a number")?;
            let y = args["y"].as_f64().ok_or("y must be a number")?;
            Ok::<Value, HandlerError>(json!(x * y))
        })),
    )?;
    tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run().await }
    });

    let agent_participant = Arc::new(Participant::new(fabric, config.clone()).await?);
    let agent = Arc::new(
        AgentBase::new(
            agent_participant,
            PreferredName::try_new("calculator-agent".to_string())?,
            ServiceName::try_new("calculator-agent".to_string())?,
            Arc::new(KeywordClassifier::new()),
            Arc::new(DemoExecutor),
        )
        .await?,
    );
    tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.run().await }
    });
    Ok(())
}

/// Deterministic executor for the demo: turns "3 + 4" into an `add` call
/// (or `multiply` for `*`) and relays the tool result as the final text.
struct DemoExecutor;

#[async_trait]
impl ChatExecutor for DemoExecutor {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ExecutorTurn, LlmError> {
        let last = messages
            .last()
            .ok_or_else(|| LlmError::InvalidResponse("empty conversation".to_string()))?;
        if last.role == ChatRole::Tool {
            return Ok(ExecutorTurn::Final(last.content.clone()));
        }

        let user = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .ok_or_else(|| LlmError::InvalidResponse("no user message".to_string()))?;
        let numbers: Vec<f64> = user
            .content
            .split(|c: char| !c.is_ascii_digit() && c != '.')
            .filter_map(|token| token.parse().ok())
            .collect();
        let multiply = user.content.contains('*')
            || user.content.to_lowercase().contains("times")
            || user.content.to_lowercase().contains("multipl");
        match numbers.as_slice() {
            [x, y] => Ok(ExecutorTurn::ToolCalls(vec![ToolCallRequest {
                call_id: "demo-1".to_string(),
                name: if multiply { "multiply" } else { "add" }.to_string(),
                arguments: json!({"x": x, "y": y}).to_string(),
            }])),
            _ => Ok(ExecutorTurn::Final(
                "try a request like '3 + 4' or '3 * 4'".to_string(),
            )),
        }
    }
}
