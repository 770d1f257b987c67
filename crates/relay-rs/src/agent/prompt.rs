//! Budgeted turn prompt builder.
//!
//! [`PromptBuilder`] assembles a turn prompt from markdown sections, in the
//! same builder style as a system prompt, but every prompt must fit a token
//! budget. Required sections (the task, resume instructions, retry
//! feedback) are always kept. Trimmable sections (episodic excerpts, the
//! session tail, recent operations) share whatever budget remains, in the
//! order they were added, and are cut from the end that matters least.

use crate::context::tokens::TokenEstimator;
use crate::memory::document::tail_within;
use tracing::debug;

/// Which end of a trimmable section survives trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    Head,
    Tail,
}

#[derive(Debug)]
struct Section {
    text: String,
    trim: Option<Keep>,
}

/// Builder for a budgeted prompt.
///
/// ```
/// use relay_rs::agent::prompt::{Keep, PromptBuilder};
/// use relay_rs::context::tokens::TokenEstimator;
///
/// let prompt = PromptBuilder::new("Continue the task.", TokenEstimator::default())
///     .section("Task", "Add a login page.")
///     .trimmable("Recent operations", "line\n".repeat(500), Keep::Tail)
///     .section_opt("Feedback", None::<String>)
///     .build(200);
///
/// assert!(prompt.contains("## Task"));
/// assert!(!prompt.contains("## Feedback"));
/// assert!(TokenEstimator::default().estimate(&prompt) <= 200);
/// ```
#[derive(Debug)]
pub struct PromptBuilder {
    estimator: TokenEstimator,
    sections: Vec<Section>,
}

impl PromptBuilder {
    pub fn new(preamble: impl Into<String>, estimator: TokenEstimator) -> Self {
        let preamble = preamble.into();
        let mut sections = Vec::new();
        if !preamble.is_empty() {
            sections.push(Section {
                text: preamble,
                trim: None,
            });
        }
        Self {
            estimator,
            sections,
        }
    }

    fn push(mut self, heading: &str, content: String, trim: Option<Keep>) -> Self {
        if !content.trim().is_empty() {
            self.sections.push(Section {
                text: format!("## {heading}\n\n{}", content.trim_end()),
                trim,
            });
        }
        self
    }

    /// A required section. Skipped if empty.
    pub fn section(self, heading: &str, content: impl Into<String>) -> Self {
        self.push(heading, content.into(), None)
    }

    pub fn section_opt(self, heading: &str, content: Option<impl Into<String>>) -> Self {
        match content {
            Some(c) => self.section(heading, c),
            None => self,
        }
    }

    pub fn section_if(self, condition: bool, heading: &str, content_fn: impl FnOnce() -> String) -> Self {
        if condition {
            self.section(heading, content_fn())
        } else {
            self
        }
    }

    /// A section that is cut down, or dropped, to fit the budget.
    pub fn trimmable(self, heading: &str, content: impl Into<String>, keep: Keep) -> Self {
        self.push(heading, content.into(), Some(keep))
    }

    /// Join sections with blank lines, fitting at most `max_tokens`.
    pub fn build(self, max_tokens: usize) -> String {
        let est = self.estimator;
        let cost = |s: &str| est.estimate(s) + 1;

        let required: usize = self
            .sections
            .iter()
            .filter(|s| s.trim.is_none())
            .map(|s| cost(&s.text))
            .sum();
        let mut remaining = max_tokens.saturating_sub(required);

        let mut parts = Vec::with_capacity(self.sections.len());
        for section in self.sections {
            let Some(keep) = section.trim else {
                parts.push(section.text);
                continue;
            };
            let full = cost(&section.text);
            if full <= remaining {
                remaining -= full;
                parts.push(section.text);
                continue;
            }
            // Leave room for the separator and the heading line.
            let budget = remaining.saturating_sub(2);
            let cut = match keep {
                Keep::Head => est.truncate_to(&section.text, budget),
                Keep::Tail => {
                    let (heading, body) = section.text.split_once("\n\n").unwrap_or(("", &section.text));
                    let heading_cost = cost(heading);
                    let body = tail_within(body, budget.saturating_sub(heading_cost), &est);
                    if body.is_empty() {
                        String::new()
                    } else {
                        format!("{heading}\n\n{body}")
                    }
                }
            };
            if cut.lines().count() > 1 {
                remaining = remaining.saturating_sub(cost(&cut));
                debug!("Trimmed prompt section to {} of {full} tokens", cost(&cut));
                parts.push(cut);
            } else {
                debug!("Dropped prompt section ({full} tokens) for lack of budget");
            }
        }

        let prompt = parts.join("\n\n");
        if est.estimate(&prompt) > max_tokens {
            debug!("Required prompt sections exceed {max_tokens} tokens; truncating");
            return est.truncate_to(&prompt, max_tokens);
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn est() -> TokenEstimator {
        TokenEstimator::default()
    }

    #[test]
    fn everything_fits() {
        let prompt = PromptBuilder::new("Preamble", est())
            .section("Task", "do it")
            .trimmable("Recent", "a\nb", Keep::Tail)
            .build(1_000);
        assert_eq!(prompt, "Preamble\n\n## Task\n\ndo it\n\n## Recent\n\na\nb");
    }

    #[test]
    fn tail_sections_keep_newest_lines() {
        let lines: Vec<String> = (0..200).map(|i| format!("op {i:03}")).collect();
        let prompt = PromptBuilder::new("", est())
            .section("Task", "do it")
            .trimmable("Recent", lines.join("\n"), Keep::Tail)
            .build(60);
        assert!(prompt.contains("op 199"));
        assert!(!prompt.contains("op 000"));
        assert!(est().estimate(&prompt) <= 60);
    }

    #[test]
    fn head_sections_keep_leading_text() {
        let body: Vec<String> = (0..200).map(|i| format!("fact {i:03}")).collect();
        let prompt = PromptBuilder::new("", est())
            .trimmable("Project state", body.join("\n"), Keep::Head)
            .build(40);
        assert!(prompt.starts_with("## Project state"));
        assert!(prompt.contains("fact 000"));
        assert!(!prompt.contains("fact 199"));
    }

    #[test]
    fn earlier_trimmable_sections_win_the_budget() {
        let big = "x".repeat(700);
        let prompt = PromptBuilder::new("", est())
            .trimmable("First", big.clone(), Keep::Head)
            .trimmable("Second", big, Keep::Head)
            .build(210);
        assert!(prompt.contains("## First"));
        assert!(!prompt.contains("## Second"));
    }

    #[test]
    fn empty_sections_skipped() {
        let prompt = PromptBuilder::new("P", est())
            .section("Empty", "  ")
            .section_if(false, "Hidden", || "x".into())
            .section_opt("None", None::<String>)
            .build(100);
        assert_eq!(prompt, "P");
    }
}
