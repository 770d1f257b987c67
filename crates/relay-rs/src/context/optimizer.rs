//! Token reduction for the live context snapshot.
//!
//! [`ContextOptimizer::optimize`] applies five techniques in a fixed order,
//! cheapest and safest first, stopping as soon as the target is met:
//!
//! 1. **Pruning**: stale debug traces, surplus validation results and old
//!    resolved errors are dropped.
//! 2. **Artifact registry**: file contents become `{path, summary,
//!    last_modified, size}` records.
//! 3. **External storage**: any item above the size threshold moves to the
//!    artifact store and is replaced by `{ref, summary, tokens}`.
//! 4. **Differential state**: the state blob becomes a delta against the
//!    last checkpoint's state.
//! 5. **Summarization**: completed phases are compressed, with the full text
//!    externalized first and marker lines kept verbatim.
//!
//! A successful pass always removes at least 30% of the tokens. When the
//! techniques cannot reach that, the input comes back unchanged with
//! `no_op` set.

use crate::context::snapshot::{
    ArtifactRecord, ContextItem, ContextSnapshot, ExternalRef, ItemBody, ItemKind, StateDelta,
};
use crate::context::summarizer::{Summarizer, summarize_preserving};
use crate::context::tokens::TokenEstimator;
use crate::error::Result;
use crate::memory::artifacts::ArtifactStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Tunables for the five techniques.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Debug traces older than this are pruned. Default: 3600.
    pub debug_trace_max_age_secs: u64,
    /// Validation results retained. Default: 5.
    pub keep_validations: usize,
    /// Resolved errors retained (unresolved errors are always kept). Default: 10.
    pub keep_resolved_errors: usize,
    /// Items above this size are externalized. Default: 2000.
    pub external_threshold_tokens: usize,
    /// Phase summary budget for large windows. Default: 500.
    pub summary_tokens_large: usize,
    /// Phase summary budget for small windows. Default: 100.
    pub summary_tokens_small: usize,
    /// Windows at or below this size count as small. Default: 16384.
    pub small_window_max: usize,
    /// Minimum reduction fraction for a pass to count. Default: 0.3.
    pub min_reduction: f64,
    /// Characters of a file kept as its registry summary. Default: 160.
    pub file_summary_chars: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            debug_trace_max_age_secs: 3_600,
            keep_validations: 5,
            keep_resolved_errors: 10,
            external_threshold_tokens: 2_000,
            summary_tokens_large: 500,
            summary_tokens_small: 100,
            small_window_max: 16_384,
            min_reduction: 0.3,
            file_summary_chars: 160,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    Pruning,
    ArtifactRegistry,
    ExternalStorage,
    DifferentialState,
    Summarization,
}

impl Technique {
    pub const ORDER: [Technique; 5] = [
        Technique::Pruning,
        Technique::ArtifactRegistry,
        Technique::ExternalStorage,
        Technique::DifferentialState,
        Technique::Summarization,
    ];
}

/// Before/after accounting for one technique.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TechniqueReport {
    pub technique: Technique,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub items_affected: usize,
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub snapshot: ContextSnapshot,
    /// True when the input was returned unchanged.
    pub no_op: bool,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Whether the caller's requested reduction was reached.
    pub target_met: bool,
    pub reports: Vec<TechniqueReport>,
}

impl OptimizationResult {
    /// `1 - after/before`.
    pub fn reduction(&self) -> f64 {
        if self.tokens_before == 0 {
            0.0
        } else {
            1.0 - self.tokens_after as f64 / self.tokens_before as f64
        }
    }
}

/// Applies the reduction techniques to a [`ContextSnapshot`].
pub struct ContextOptimizer {
    config: OptimizerConfig,
    estimator: TokenEstimator,
    artifacts: ArtifactStore,
    summarizer: Arc<dyn Summarizer>,
    window_tokens: usize,
    summarization_trigger_tokens: usize,
}

impl ContextOptimizer {
    pub fn new(
        config: OptimizerConfig,
        estimator: TokenEstimator,
        artifacts: ArtifactStore,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            config,
            estimator,
            artifacts,
            summarizer,
            window_tokens: 128_000,
            summarization_trigger_tokens: 0,
        }
    }

    /// Context window size; selects the phase summary budget.
    pub fn with_window(mut self, max_tokens: usize) -> Self {
        self.window_tokens = max_tokens;
        self
    }

    /// Phases smaller than this are left alone by summarization.
    pub fn with_summarization_trigger(mut self, tokens: usize) -> Self {
        self.summarization_trigger_tokens = tokens;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Summary budget for one completed phase.
    pub fn summary_target(&self) -> usize {
        if self.window_tokens <= self.config.small_window_max {
            self.config.summary_tokens_small
        } else {
            self.config.summary_tokens_large
        }
    }

    /// Reduce `snapshot` by at least `target_reduction` (never less than the
    /// configured minimum).
    pub async fn optimize(
        &self,
        snapshot: &ContextSnapshot,
        target_reduction: f64,
    ) -> Result<OptimizationResult> {
        self.optimize_at(snapshot, target_reduction, Utc::now()).await
    }

    pub(crate) async fn optimize_at(
        &self,
        snapshot: &ContextSnapshot,
        target_reduction: f64,
        now: DateTime<Utc>,
    ) -> Result<OptimizationResult> {
        let before = snapshot.total_tokens();
        let reduction = target_reduction.clamp(self.config.min_reduction, 0.95);
        let target = (before as f64 * (1.0 - reduction)).floor() as usize;
        let ceiling = (before as f64 * (1.0 - self.config.min_reduction)).floor() as usize;

        let mut working = snapshot.clone();
        let mut reports = Vec::new();

        for technique in Technique::ORDER {
            let tokens_before = working.total_tokens();
            if tokens_before <= target {
                break;
            }
            let items_affected = match technique {
                Technique::Pruning => self.prune(&mut working, now),
                Technique::ArtifactRegistry => self.register_artifacts(&mut working),
                Technique::ExternalStorage => self.externalize(&mut working)?,
                Technique::DifferentialState => self.differential_state(&mut working),
                Technique::Summarization => self.summarize_phases(&mut working).await?,
            };
            let tokens_after = working.total_tokens();
            debug!("{technique:?}: {tokens_before} -> {tokens_after} tokens ({items_affected} item(s))");
            reports.push(TechniqueReport {
                technique,
                tokens_before,
                tokens_after,
                items_affected,
            });
        }

        let after = working.total_tokens();
        if before == 0 || after > ceiling {
            debug!(
                "Optimization would only reach {after}/{before} tokens; returning input unchanged"
            );
            return Ok(OptimizationResult {
                snapshot: snapshot.clone(),
                no_op: true,
                tokens_before: before,
                tokens_after: before,
                target_met: false,
                reports,
            });
        }

        info!(
            "Context optimized: {before} -> {after} tokens ({:.0}% reduction)",
            (1.0 - after as f64 / before as f64) * 100.0
        );
        Ok(OptimizationResult {
            snapshot: working,
            no_op: false,
            tokens_before: before,
            tokens_after: after,
            target_met: after <= target,
            reports,
        })
    }

    // ── Techniques ─────────────────────────────────────────────────

    fn prune(&self, snap: &mut ContextSnapshot, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::seconds(self.config.debug_trace_max_age_secs as i64);
        let validations = snap
            .items
            .iter()
            .filter(|i| i.kind == ItemKind::Validation)
            .count();
        let resolved = snap
            .items
            .iter()
            .filter(|i| i.kind == ItemKind::Error && i.resolved)
            .count();
        let mut drop_validations = validations.saturating_sub(self.config.keep_validations);
        let mut drop_resolved = resolved.saturating_sub(self.config.keep_resolved_errors);

        let before = snap.items.len();
        snap.items.retain(|item| match item.kind {
            ItemKind::DebugTrace => now - item.created_at <= max_age,
            ItemKind::Validation if drop_validations > 0 => {
                drop_validations -= 1;
                false
            }
            ItemKind::Error if item.resolved && drop_resolved > 0 => {
                drop_resolved -= 1;
                false
            }
            _ => true,
        });
        before - snap.items.len()
    }

    fn register_artifacts(&self, snap: &mut ContextSnapshot) -> usize {
        let mut affected = 0;
        for item in snap.items.iter_mut() {
            let ItemBody::FileContents {
                path,
                content,
                last_modified,
            } = &item.body
            else {
                continue;
            };
            let summary = file_summary(content, self.config.file_summary_chars);
            let record = ArtifactRecord {
                path: path.clone(),
                summary,
                last_modified: *last_modified,
                size: content.len(),
            };
            item.replace_body(ItemBody::FileRef(record), &self.estimator);
            affected += 1;
        }
        affected
    }

    fn externalize(&self, snap: &mut ContextSnapshot) -> Result<usize> {
        let mut affected = 0;
        for item in snap.items.iter_mut() {
            let already_small = matches!(
                item.body,
                ItemBody::External(_) | ItemBody::FileRef(_) | ItemBody::Summary { .. }
            );
            if already_small || item.tokens <= self.config.external_threshold_tokens {
                continue;
            }
            let full = item.render();
            let reference = self.artifacts.store(&full)?;
            let summary = self.estimator.truncate_to(first_line(&full), 40);
            let tokens = item.tokens;
            item.replace_body(
                ItemBody::External(ExternalRef {
                    reference,
                    summary,
                    tokens,
                }),
                &self.estimator,
            );
            affected += 1;
        }
        Ok(affected)
    }

    fn differential_state(&self, snap: &mut ContextSnapshot) -> usize {
        let Some(baseline) = snap.baseline.clone() else {
            return 0;
        };
        let mut affected = 0;
        for item in snap
            .items
            .iter_mut()
            .filter(|i| i.kind == ItemKind::State)
        {
            let ItemBody::State { state } = &item.body else {
                continue;
            };
            let Some(delta) = StateDelta::compute(&baseline.checkpoint_id, &baseline.state, state)
            else {
                continue;
            };
            let candidate = ContextItem::new(
                ItemKind::State,
                item.phase,
                ItemBody::StateDelta(delta),
                &self.estimator,
            );
            if candidate.tokens < item.tokens {
                item.replace_body(candidate.body, &self.estimator);
                affected += 1;
            }
        }
        affected
    }

    async fn summarize_phases(&self, snap: &mut ContextSnapshot) -> Result<usize> {
        let current = snap.current_phase;
        let mut phases: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (idx, item) in snap.items.iter().enumerate() {
            if item.kind == ItemKind::Phase
                && item.phase < current
                && matches!(item.body, ItemBody::Text { .. })
            {
                phases.entry(item.phase).or_default().push(idx);
            }
        }

        let target = self.summary_target();
        let mut replacements: Vec<(Vec<usize>, ContextItem)> = Vec::new();
        for (phase, indices) in phases {
            let tokens: usize = indices.iter().map(|i| snap.items[*i].tokens).sum();
            if tokens < self.summarization_trigger_tokens || tokens <= target {
                continue;
            }
            let full = indices
                .iter()
                .map(|i| snap.items[*i].render())
                .collect::<Vec<_>>()
                .join("\n");
            // Externalize before compressing so nothing is destroyed.
            let full_ref = self.artifacts.store(&full)?;
            let label = format!("phase {phase}");
            let text = summarize_preserving(
                self.summarizer.as_ref(),
                &self.estimator,
                &label,
                &full,
                target,
            )
            .await?;
            let created_at = snap.items[indices[0]].created_at;
            let mut summary = ContextItem::new(
                ItemKind::Phase,
                phase,
                ItemBody::Summary { text, full_ref },
                &self.estimator,
            )
            .with_created_at(created_at);
            // Evicted together with the newest operation it covers.
            summary.op_id = indices
                .iter()
                .rev()
                .find_map(|i| snap.items[*i].op_id.clone());
            if summary.tokens < tokens {
                replacements.push((indices, summary));
            }
        }

        let affected = replacements.len();
        // Apply back to front so earlier indices stay valid.
        replacements.sort_by_key(|(indices, _)| std::cmp::Reverse(indices[0]));
        for (indices, summary) in replacements {
            let first = indices[0];
            for idx in indices.iter().rev() {
                snap.items.remove(*idx);
            }
            snap.items.insert(first, summary);
        }
        Ok(affected)
    }
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("")
}

fn file_summary(content: &str, max_chars: usize) -> String {
    let line = first_line(content).trim();
    let mut out: String = line.chars().take(max_chars).collect();
    if line.chars().count() > max_chars {
        out.push_str("...");
    }
    let lines = content.lines().count();
    format!("{out} [{lines} lines]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::summarizer::ExtractiveSummarizer;
    use serde_json::json;

    fn optimizer(dir: &std::path::Path) -> ContextOptimizer {
        let est = TokenEstimator::default();
        ContextOptimizer::new(
            OptimizerConfig::default(),
            est,
            ArtifactStore::open(dir).unwrap(),
            Arc::new(ExtractiveSummarizer::new(est)),
        )
    }

    fn text_item(kind: ItemKind, phase: u32, text: &str) -> ContextItem {
        ContextItem::text(kind, phase, text, &TokenEstimator::default())
    }

    #[tokio::test]
    async fn pruning_drops_stale_and_surplus_items() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer(dir.path());
        let now = Utc::now();
        let mut snap = ContextSnapshot::new();
        for i in 0..10 {
            snap.push(
                text_item(ItemKind::DebugTrace, 0, &format!("trace {i} {}", "x".repeat(200)))
                    .with_created_at(now - chrono::Duration::hours(2)),
            );
        }
        for i in 0..8 {
            snap.push(text_item(ItemKind::Validation, 0, &format!("validation {i}")));
        }
        for i in 0..15 {
            let mut err = text_item(ItemKind::Error, 0, &format!("resolved error {i}"));
            err.resolved = true;
            snap.push(err);
        }
        snap.push(text_item(ItemKind::Error, 0, "open error"));

        let result = opt.optimize_at(&snap, 0.3, now).await.unwrap();
        assert!(!result.no_op);
        let items = &result.snapshot.items;
        assert_eq!(items.iter().filter(|i| i.kind == ItemKind::DebugTrace).count(), 0);
        let validations: Vec<String> = items
            .iter()
            .filter(|i| i.kind == ItemKind::Validation)
            .map(|i| i.render())
            .collect();
        assert_eq!(validations.len(), 5);
        assert_eq!(validations[0], "validation 3");
        let resolved = items
            .iter()
            .filter(|i| i.kind == ItemKind::Error && i.resolved)
            .count();
        assert_eq!(resolved, 10);
        assert!(items.iter().any(|i| i.render() == "open error"));
        assert_eq!(result.reports[0].technique, Technique::Pruning);
    }

    #[tokio::test]
    async fn file_contents_become_registry_records() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer(dir.path());
        let est = TokenEstimator::default();
        let mut snap = ContextSnapshot::new();
        let content = format!("//! Parser module.\n{}", "fn f() {}\n".repeat(300));
        snap.push_file("src/parser.rs", content.clone(), Utc::now(), &est);

        let result = opt.optimize(&snap, 0.3).await.unwrap();
        assert!(!result.no_op);
        match &result.snapshot.items[0].body {
            ItemBody::FileRef(r) => {
                assert_eq!(r.path, "src/parser.rs");
                assert_eq!(r.size, content.len());
                assert!(r.summary.starts_with("//! Parser module."));
            }
            other => panic!("expected file ref, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_items_move_to_artifact_store() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer(dir.path());
        let mut snap = ContextSnapshot::new();
        let big = format!("agent transcript\n{}", "lorem ipsum ".repeat(1_000));
        snap.push(text_item(ItemKind::Phase, 0, &big));

        let result = opt.optimize(&snap, 0.3).await.unwrap();
        assert!(!result.no_op);
        let ItemBody::External(ext) = &result.snapshot.items[0].body else {
            panic!("expected external ref");
        };
        assert_eq!(ext.tokens, snap.items[0].tokens);
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert_eq!(store.load(&ext.reference).unwrap(), big);
    }

    #[tokio::test]
    async fn state_blob_becomes_delta() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer(dir.path());
        let est = TokenEstimator::default();
        let mut base = serde_json::Map::new();
        for i in 0..50 {
            base.insert(format!("key_{i}"), json!(format!("value number {i}")));
        }
        let base = serde_json::Value::Object(base);
        let mut current = base.clone();
        current["key_1"] = json!("changed");

        let mut snap = ContextSnapshot::new();
        snap.set_state(current.clone(), &est);
        snap.set_baseline("cp-base", base);

        let result = opt.optimize(&snap, 0.3).await.unwrap();
        assert!(!result.no_op);
        assert!(matches!(
            result.snapshot.items[0].body,
            ItemBody::StateDelta(_)
        ));
        assert_eq!(result.snapshot.state(), Some(current));
    }

    #[tokio::test]
    async fn completed_phases_are_summarized_with_markers() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer(dir.path()).with_window(4_096);
        let mut snap = ContextSnapshot::new();
        for i in 0..30 {
            snap.push(
                text_item(
                    ItemKind::Phase,
                    0,
                    &format!("step {i}: edited src/module_{i}.rs and reran the suite"),
                )
                .with_op_id(format!("op-{i}")),
            );
        }
        snap.push(text_item(ItemKind::Phase, 0, "DECISION: keep the FIFO strict"));
        snap.push(text_item(ItemKind::Phase, 1, "current work in progress"));
        snap.current_phase = 1;

        let result = opt.optimize(&snap, 0.3).await.unwrap();
        assert!(!result.no_op);
        assert!(result.tokens_after as f64 <= result.tokens_before as f64 * 0.7);
        let summary = &result.snapshot.items[0];
        let ItemBody::Summary { text, full_ref } = &summary.body else {
            panic!("expected summary");
        };
        assert!(text.contains("DECISION: keep the FIFO strict"));
        assert_eq!(summary.op_id.as_deref(), Some("op-29"));
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert!(store.load(full_ref).unwrap().contains("step 29"));
        // The open phase is untouched.
        assert_eq!(
            result.snapshot.items.last().unwrap().render(),
            "current work in progress"
        );
    }

    #[tokio::test]
    async fn insufficient_reduction_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer(dir.path());
        let mut snap = ContextSnapshot::new();
        snap.push(text_item(ItemKind::Phase, 0, "only the current phase"));
        snap.push(text_item(ItemKind::Error, 0, "unresolved"));

        let result = opt.optimize(&snap, 0.5).await.unwrap();
        assert!(result.no_op);
        assert_eq!(result.snapshot, snap);
        assert_eq!(result.tokens_after, result.tokens_before);
    }

    #[tokio::test]
    async fn stops_once_target_met() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimizer(dir.path());
        let now = Utc::now();
        let mut snap = ContextSnapshot::new();
        snap.push(
            text_item(ItemKind::DebugTrace, 0, &"old trace ".repeat(100))
                .with_created_at(now - chrono::Duration::hours(3)),
        );
        snap.push(text_item(ItemKind::Phase, 0, "kept"));

        let result = opt.optimize_at(&snap, 0.3, now).await.unwrap();
        assert!(result.target_met);
        assert_eq!(result.reports.len(), 1);
        assert!(result.reduction() >= 0.3);
    }
}
