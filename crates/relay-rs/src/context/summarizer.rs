//! Summarization seam used by the optimizer and document compression.
//!
//! [`Summarizer`] is the pluggable compression step. The LLM-backed
//! implementation lives in [`crate::api::adapters::LlmSummarizer`];
//! [`ExtractiveSummarizer`] is a deterministic fallback that keeps leading
//! lines within the budget and needs no network access.
//!
//! Whatever the implementation, [`summarize_preserving`] guarantees that
//! marker lines (`DECISION:`, `ISSUE:`, `DONE:`) survive verbatim.

use crate::context::tokens::TokenEstimator;
use crate::error::Result;
use std::future::Future;
use std::pin::Pin;

/// Line prefixes that are never paraphrased by compression.
pub const MARKERS: [&str; 3] = ["DECISION:", "ISSUE:", "DONE:"];

/// The prompt used for LLM summarization.
pub const SUMMARIZATION_PROMPT: &str = "\
Summarize the following work log concisely. Focus on:
- What was accomplished (completed steps, files modified)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- Open issues and what remains to be done

Rules:
- Only include facts explicitly stated in the log. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Never rewrite lines starting with DECISION:, ISSUE: or DONE:; they are kept separately.
- Stay within the token budget given by the user.";

/// Boxed future returned by [`Summarizer::summarize`].
pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

/// Input to a summarization call.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    /// Text to compress.
    pub text: String,
    /// Upper bound on the summary size.
    pub target_tokens: usize,
    /// Short label for logs and the LLM prompt (e.g. `"phase 3"`).
    pub label: String,
}

/// Compresses text to a token budget.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, request: &'a SummaryRequest) -> SummaryFuture<'a>;
}

/// Build the (system, user) pair for a one-shot LLM summarization call.
pub fn build_summarization_request(request: &SummaryRequest) -> (String, String) {
    let user = format!(
        "=== {} (target: at most {} tokens) ===\n{}",
        request.label, request.target_tokens, request.text
    );
    (SUMMARIZATION_PROMPT.to_string(), user)
}

pub fn is_marker_line(line: &str) -> bool {
    let trimmed = line.trim_start_matches(['-', '*', ' ']);
    MARKERS.iter().any(|m| trimmed.starts_with(m))
}

/// All marker lines in document order, trimmed of list bullets.
pub fn extract_markers(text: &str) -> Vec<String> {
    text.lines()
        .filter(|l| is_marker_line(l))
        .map(|l| l.trim_start_matches(['-', '*', ' ']).trim_end().to_string())
        .collect()
}

/// Deterministic summarizer: keeps the first non-marker lines that fit.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveSummarizer {
    estimator: TokenEstimator,
}

impl ExtractiveSummarizer {
    pub fn new(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }

    fn extract(&self, request: &SummaryRequest) -> String {
        let mut out = String::new();
        let mut used = 0usize;
        for line in request.text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || is_marker_line(line) {
                continue;
            }
            let cost = self.estimator.estimate(line) + 1;
            if used + cost > request.target_tokens {
                if out.is_empty() {
                    out = self.estimator.truncate_to(line, request.target_tokens);
                }
                break;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(line);
            used += cost;
        }
        out
    }
}

impl Summarizer for ExtractiveSummarizer {
    fn summarize<'a>(&'a self, request: &'a SummaryRequest) -> SummaryFuture<'a> {
        Box::pin(async move { Ok(self.extract(request)) })
    }
}

/// Summarize `text` to roughly `target_tokens`, re-appending every marker
/// line verbatim after the summary body.
///
/// Markers are budgeted first; the summarizer gets whatever remains. The
/// result can exceed `target_tokens` only when the markers alone do.
pub async fn summarize_preserving(
    summarizer: &dyn Summarizer,
    estimator: &TokenEstimator,
    label: &str,
    text: &str,
    target_tokens: usize,
) -> Result<String> {
    let markers = extract_markers(text);
    let marker_block = markers.join("\n");
    let marker_tokens = estimator.estimate(&marker_block);
    let body: String = text
        .lines()
        .filter(|l| !is_marker_line(l))
        .collect::<Vec<_>>()
        .join("\n");

    let body_budget = target_tokens.saturating_sub(marker_tokens + 1);
    let summary = if body_budget > 0 && !body.trim().is_empty() {
        let request = SummaryRequest {
            text: body,
            target_tokens: body_budget,
            label: label.to_string(),
        };
        let raw = summarizer.summarize(&request).await?;
        estimator.truncate_to(raw.trim(), body_budget)
    } else {
        String::new()
    };

    Ok(match (summary.is_empty(), marker_block.is_empty()) {
        (true, _) => marker_block,
        (false, true) => summary,
        (false, false) => format!("{summary}\n{marker_block}"),
    })
}
