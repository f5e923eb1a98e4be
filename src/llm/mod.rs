//! LLM collaborator abstractions
//!
//! The core never speaks to a vendor API. Agents are injected with two
//! collaborators: a [`FunctionClassifier`] that narrows the advertised
//! function set down to what is relevant for a request, and a
//! [`ChatExecutor`] that produces either a final text or function-call
//! requests. Deterministic in-process implementations for tests and
//! demos live in [`scripted`].

use crate::messages::FunctionCapability;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod scripted;

/// Errors from LLM collaborators
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    Api(String),

    #[error("invalid response format: {0}")]
    InvalidResponse(String),

    #[error("request timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Role of one chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatRole {
    /// System / instruction message
    System,
    /// End-user message
    User,
    /// Model output
    Assistant,
    /// Tool invocation result
    Tool,
}

/// One message in an executor conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced the message
    pub role: ChatRole,
    /// Message body
    pub content: String,
    /// Correlates tool results to the call that produced them
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// A system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    /// A user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    /// An assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }

    /// A tool-result message
    #[must_use]
    pub fn tool(content: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool the executor may call, derived from a capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Function name
    pub name: String,
    /// What the function does
    pub description: String,
    /// JSON-schema for the arguments
    pub parameters: Value,
}

impl ToolDefinition {
    /// Builds a tool definition from an advertised capability
    #[must_use]
    pub fn from_capability(capability: &FunctionCapability) -> Self {
        let parameters = serde_json::from_str(&capability.parameter_schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
        Self {
            name: capability.name.to_string(),
            description: capability.description.clone(),
            parameters,
        }
    }
}

/// One function call the executor wants made
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Executor-assigned id; the tool result echoes it
    pub call_id: String,
    /// Target function name
    pub name: String,
    /// Arguments as a JSON object string
    pub arguments: String,
}

/// Outcome of one executor completion
#[derive(Debug, Clone)]
pub enum ExecutorTurn {
    /// The conversation is done; return this text to the caller
    Final(String),
    /// Invoke these functions and feed the results back
    ToolCalls(Vec<ToolCallRequest>),
}

/// Lightweight description of one function for classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDigest {
    /// Function name
    pub name: String,
    /// Short description
    pub description: String,
    /// Parameter names with their declared types
    pub schema_summary: String,
}

impl FunctionDigest {
    /// Builds a digest from an advertised capability
    #[must_use]
    pub fn from_capability(capability: &FunctionCapability) -> Self {
        Self {
            name: capability.name.to_string(),
            description: capability.description.clone(),
            schema_summary: summarize_schema(&capability.parameter_schema),
        }
    }
}

/// Renders a parameter schema down to `name: type` pairs.
fn summarize_schema(schema: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(schema) else {
        return String::new();
    };
    let Some(properties) = value.get("properties").and_then(Value::as_object) else {
        return String::new();
    };
    let mut pairs: Vec<String> = properties
        .iter()
        .map(|(name, prop)| {
            let kind = prop
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            format!("{name}: {kind}")
        })
        .collect();
    pairs.sort();
    pairs.join(", ")
}

/// Narrows the advertised function set to what a request needs
#[async_trait]
pub trait FunctionClassifier: Send + Sync {
    /// Returns the names of the relevant functions, and only names
    async fn classify(
        &self,
        request_text: &str,
        digest: &[FunctionDigest],
    ) -> Result<Vec<String>, LlmError>;
}

/// Produces final text or function-call requests from a conversation
#[async_trait]
pub trait ChatExecutor: Send + Sync {
    /// Runs one completion over the conversation so far
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ExecutorTurn, LlmError>;
}
