//! Compression of long-lived memory documents.
//!
//! A document over its limit is rewritten as a summary plus a preserved
//! block. The newest `keep_decisions` `DECISION:` lines are always kept
//! verbatim. Other marker lines are kept newest-first while they fit. The
//! result targets 30% of the original size.

use crate::context::summarizer::{Summarizer, SummaryRequest, is_marker_line};
use crate::context::tokens::TokenEstimator;
use crate::error::Result;
use tracing::debug;

/// Fraction of the original size a compressed document aims for.
pub const COMPRESSION_RATIO: f64 = 0.3;

/// Heading placed before the preserved marker lines.
pub const PRESERVED_HEADING: &str = "## Preserved";

fn strip_bullet(line: &str) -> &str {
    line.trim_start_matches(['-', '*', ' ']).trim_end()
}

fn is_decision(line: &str) -> bool {
    strip_bullet(line).starts_with("DECISION:")
}

/// Compress `text`. Returns the rewritten document.
pub async fn compress_document(
    text: &str,
    label: &str,
    keep_decisions: usize,
    summarizer: &dyn Summarizer,
    estimator: &TokenEstimator,
) -> Result<String> {
    let before = estimator.estimate(text);
    let budget = ((before as f64) * COMPRESSION_RATIO).floor() as usize;

    // (line index, text) for every marker, in document order.
    let markers: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .filter(|(_, l)| is_marker_line(l))
        .map(|(i, l)| (i, strip_bullet(l)))
        .collect();

    let decision_positions: Vec<usize> = markers
        .iter()
        .enumerate()
        .filter(|(_, (_, l))| is_decision(l))
        .map(|(pos, _)| pos)
        .collect();
    let required_from = decision_positions.len().saturating_sub(keep_decisions);
    let mut keep = vec![false; markers.len()];
    for &pos in decision_positions.iter().skip(required_from) {
        keep[pos] = true;
    }

    let mut used: usize = markers
        .iter()
        .zip(&keep)
        .filter(|(_, k)| **k)
        .map(|((_, l), _)| estimator.estimate(l) + 1)
        .sum();

    for pos in (0..markers.len()).rev() {
        if keep[pos] {
            continue;
        }
        let cost = estimator.estimate(markers[pos].1) + 1;
        if used + cost <= budget {
            keep[pos] = true;
            used += cost;
        }
    }

    let preserved: Vec<&str> = markers
        .iter()
        .zip(&keep)
        .filter(|(_, k)| **k)
        .map(|((_, l), _)| *l)
        .collect();

    let heading = format!("## Summary (compressed from {before} tokens)");
    let overhead = estimator.estimate(&heading) + estimator.estimate(PRESERVED_HEADING) + 2;
    let summary_budget = budget.saturating_sub(used + overhead);

    let body: String = text
        .lines()
        .filter(|l| !is_marker_line(l))
        .collect::<Vec<_>>()
        .join("\n");
    let summary = if summary_budget > 0 && !body.trim().is_empty() {
        let request = SummaryRequest {
            text: body,
            target_tokens: summary_budget,
            label: label.to_string(),
        };
        let raw = summarizer.summarize(&request).await?;
        estimator.truncate_to(raw.trim(), summary_budget)
    } else {
        String::new()
    };

    let mut out = heading;
    out.push('\n');
    if !summary.is_empty() {
        out.push_str(&summary);
        out.push('\n');
    }
    if !preserved.is_empty() {
        out.push('\n');
        out.push_str(PRESERVED_HEADING);
        out.push('\n');
        for line in &preserved {
            out.push_str(line);
            out.push('\n');
        }
    }

    debug!(
        "Compressed {label}: {before} -> {} tokens ({} markers kept)",
        estimator.estimate(&out),
        preserved.len()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::summarizer::ExtractiveSummarizer;

    fn long_log(decisions: usize) -> String {
        let mut text = String::new();
        for i in 0..decisions {
            text.push_str(&format!(
                "Turn {i}: the agent edited several files and ran the test suite again.\n"
            ));
            text.push_str(&format!("DECISION: proceed with step {i}\n"));
            text.push_str(&format!(
                "Long narrative about step {i} that carries little signal for later turns.\n"
            ));
        }
        text.push_str("ISSUE: flaky integration test\n");
        text
    }

    #[tokio::test]
    async fn keeps_last_decisions_verbatim() {
        let est = TokenEstimator::default();
        let summarizer = ExtractiveSummarizer::new(est);
        let text = long_log(40);
        let out = compress_document(&text, "session", 10, &summarizer, &est)
            .await
            .unwrap();
        for i in 30..40 {
            assert!(out.contains(&format!("DECISION: proceed with step {i}\n")), "missing {i}");
        }
        assert!(est.estimate(&out) <= est.estimate(&text) * 3 / 10 + 1);
    }

    #[tokio::test]
    async fn required_decisions_survive_tiny_budget() {
        let est = TokenEstimator::default();
        let summarizer = ExtractiveSummarizer::new(est);
        let text = "DECISION: a\nDECISION: b\nDECISION: c\n";
        let out = compress_document(text, "log", 2, &summarizer, &est)
            .await
            .unwrap();
        assert!(out.contains("DECISION: b"));
        assert!(out.contains("DECISION: c"));
        assert!(!out.contains("DECISION: a"));
    }

    #[tokio::test]
    async fn output_shrinks() {
        let est = TokenEstimator::default();
        let summarizer = ExtractiveSummarizer::new(est);
        let text = long_log(60);
        let out = compress_document(&text, "plan", 5, &summarizer, &est)
            .await
            .unwrap();
        assert!(out.starts_with("## Summary (compressed from"));
        assert!(out.len() < text.len() / 2);
    }
}
