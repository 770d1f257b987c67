//! OpenRouter-backed implementations of the engine's LLM seams.

use crate::agent::collaborators::{AgentResponse, CodingAgent, CollabFuture, FileChange};
use crate::api::client::{ChatRequest, Message, OpenRouterClient};
use crate::api::retry::{RetryConfig, retry_api_call};
use crate::context::summarizer::{Summarizer, SummaryFuture, SummaryRequest, build_summarization_request};
use crate::error::RelayError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Prefix the agent uses to report a changed file, one per line.
pub const FILE_MARKER: &str = "FILE:";

const AGENT_SYSTEM_PROMPT: &str = "\
You are an autonomous coding agent working through a task in turns.
Each turn, do the next piece of work and report it concisely.
For every file you create or modify, add a line `FILE: <path>`.
State decisions on their own line starting with `DECISION:` and open problems with `ISSUE:`.";

/// Coding agent that talks to a chat model. Each `session_ref` gets its own
/// conversation; a new ref starts from a clean history.
pub struct OpenRouterAgent {
    client: Arc<OpenRouterClient>,
    model: String,
    max_tokens: u32,
    retry: RetryConfig,
    conversations: Mutex<HashMap<String, Vec<Message>>>,
}

impl OpenRouterAgent {
    pub fn new(client: Arc<OpenRouterClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens: 4_096,
            retry: RetryConfig::default(),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn history(&self, session_ref: &str) -> Vec<Message> {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_ref)
            .cloned()
            .unwrap_or_else(|| vec![Message::system(AGENT_SYSTEM_PROMPT)])
    }
}

/// Paths reported with `FILE:` lines.
pub fn parse_file_changes(content: &str) -> Vec<FileChange> {
    content
        .lines()
        .filter_map(|l| l.trim().strip_prefix(FILE_MARKER))
        .map(|p| p.trim().trim_matches('`'))
        .filter(|p| !p.is_empty())
        .map(|p| FileChange {
            path: p.to_string(),
            content: None,
        })
        .collect()
}

impl CodingAgent for OpenRouterAgent {
    fn send<'a>(&'a self, prompt: &'a str, session_ref: &'a str) -> CollabFuture<'a, AgentResponse> {
        Box::pin(async move {
            let mut messages = self.history(session_ref);
            messages.push(Message::user(prompt));
            let body = ChatRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                max_tokens: self.max_tokens,
                temperature: 0.2,
            };
            let completion = retry_api_call(&self.retry, || self.client.chat(&body))
                .await
                .map_err(|e| match e {
                    RelayError::Api(msg) => RelayError::Agent(msg),
                    other => other,
                })?;
            let content = completion.content.unwrap_or_default();
            messages.push(Message::assistant(content.clone()));
            self.conversations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(session_ref.to_string(), messages);

            let tokens_used = completion
                .usage
                .and_then(|u| u.total_tokens)
                .map(|t| t as usize);
            debug!("Agent turn on {session_ref}: {} chars", content.len());
            Ok(AgentResponse {
                files_changed: parse_file_changes(&content),
                content,
                tokens_used,
            })
        })
    }
}

/// Summarizer backed by a one-shot chat completion.
pub struct LlmSummarizer {
    client: Arc<OpenRouterClient>,
    model: String,
    retry: RetryConfig,
}

impl LlmSummarizer {
    pub fn new(client: Arc<OpenRouterClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Summarizer for LlmSummarizer {
    fn summarize<'a>(&'a self, request: &'a SummaryRequest) -> SummaryFuture<'a> {
        Box::pin(async move {
            let (system, user) = build_summarization_request(request);
            let body = ChatRequest {
                model: self.model.clone(),
                messages: vec![Message::system(system), Message::user(user)],
                max_tokens: u32::try_from(request.target_tokens).unwrap_or(u32::MAX).max(64),
                temperature: 0.3,
            };
            let completion = retry_api_call(&self.retry, || self.client.chat(&body)).await?;
            completion
                .content
                .ok_or_else(|| RelayError::Api("empty summarization response".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_lines_become_changes() {
        let changes = parse_file_changes("Did it.\nFILE: src/lib.rs\n  FILE: `tests/a.rs`\nFILE:\n");
        let paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.rs", "tests/a.rs"]);
    }
}
