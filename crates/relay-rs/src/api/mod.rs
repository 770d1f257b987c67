//! LLM API plumbing: the OpenRouter client, retry with backoff, and the
//! adapters that plug it into the engine.

pub mod adapters;
pub mod client;
pub mod retry;

pub use adapters::{LlmSummarizer, OpenRouterAgent};
pub use client::{ChatRequest, Message, OpenRouterClient};
pub use retry::RetryConfig;
