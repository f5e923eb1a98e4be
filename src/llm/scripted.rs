//! Deterministic LLM collaborators
//!
//! Used by the test suite and the demo CLI. The keyword classifier
//! selects any function whose name appears in the request text; the
//! scripted executor replays a fixed queue of turns.

use super::{
    ChatExecutor, ChatMessage, ExecutorTurn, FunctionClassifier, FunctionDigest, LlmError,
    ToolDefinition,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Selects every function whose name occurs in the request text
#[derive(Debug, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    /// Creates a keyword classifier
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FunctionClassifier for KeywordClassifier {
    async fn classify(
        &self,
        request_text: &str,
        digest: &[FunctionDigest],
    ) -> Result<Vec<String>, LlmError> {
        let lowered = request_text.to_lowercase();
        Ok(digest
            .iter()
            .filter(|entry| lowered.contains(&entry.name.to_lowercase()))
            .map(|entry| entry.name.clone())
            .collect())
    }
}

/// Returns a fixed set of names regardless of the request
#[derive(Debug, Default)]
pub struct FixedClassifier {
    names: Vec<String>,
}

impl FixedClassifier {
    /// Always selects the given names
    #[must_use]
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

#[async_trait]
impl FunctionClassifier for FixedClassifier {
    async fn classify(
        &self,
        _request_text: &str,
        _digest: &[FunctionDigest],
    ) -> Result<Vec<String>, LlmError> {
        Ok(self.names.clone())
    }
}

/// Fails every classification; exercises the full-list fallback
#[derive(Debug, Default)]
pub struct FailingClassifier;

#[async_trait]
impl FunctionClassifier for FailingClassifier {
    async fn classify(
        &self,
        _request_text: &str,
        _digest: &[FunctionDigest],
    ) -> Result<Vec<String>, LlmError> {
        Err(LlmError::Api("classifier unavailable".to_string()))
    }
}

/// Replays a scripted queue of executor turns
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    turns: Mutex<VecDeque<ExecutorTurn>>,
}

impl ScriptedExecutor {
    /// Creates an executor that yields the given turns in order
    #[must_use]
    pub fn new(turns: Vec<ExecutorTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }
}

#[async_trait]
impl ChatExecutor for ScriptedExecutor {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ExecutorTurn, LlmError> {
        self.turns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| LlmError::InvalidResponse("script exhausted".to_string()))
    }
}

/// Echoes the latest tool result, or the request itself, as final text
#[derive(Debug, Default)]
pub struct EchoExecutor;

#[async_trait]
impl ChatExecutor for EchoExecutor {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ExecutorTurn, LlmError> {
        let text = messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        Ok(ExecutorTurn::Final(text))
    }
}
