//! Token estimation from character counts.

use serde::Serialize;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Estimates the token cost of text and structured payloads.
///
/// Estimates round up, so any non-empty text costs at least one token.
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl TokenEstimator {
    /// Create an estimator with a calibrated chars-per-token ratio. Pass
    /// `None` (or a non-positive ratio) to use the default.
    pub fn with_calibration(calibrated_cpt: Option<f64>) -> Self {
        let chars_per_token = calibrated_cpt
            .filter(|c| c.is_finite() && *c > 0.0)
            .unwrap_or(DEFAULT_CHARS_PER_TOKEN);
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Estimated tokens for a piece of text.
    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.len() as f64 / self.chars_per_token).ceil() as usize
    }

    /// Estimated tokens for any serializable value, measured on its compact
    /// JSON encoding. Values that fail to serialize cost nothing.
    pub fn estimate_json<T: Serialize + ?Sized>(&self, value: &T) -> usize {
        serde_json::to_string(value).map_or(0, |s| self.estimate(&s))
    }

    /// Approximate number of bytes that fit in `tokens`.
    pub fn chars_for(&self, tokens: usize) -> usize {
        (tokens as f64 * self.chars_per_token).floor() as usize
    }

    /// Truncate `text` to at most `tokens`, cutting on a char boundary and
    /// preferring the last line break inside the budget.
    pub fn truncate_to(&self, text: &str, tokens: usize) -> String {
        if self.estimate(text) <= tokens {
            return text.to_string();
        }
        let mut cut = self.chars_for(tokens).min(text.len());
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        let head = text.get(..cut).unwrap_or_default();
        match head.rfind('\n') {
            Some(nl) if nl > cut / 2 => head.get(..nl).unwrap_or(head).to_string(),
            _ => head.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_free() {
        assert_eq!(TokenEstimator::default().estimate(""), 0);
    }

    #[test]
    fn estimate_rounds_up() {
        let est = TokenEstimator::default();
        assert_eq!(est.estimate("a"), 1);
        assert_eq!(est.estimate(&"a".repeat(35)), 10);
        assert_eq!(est.estimate(&"a".repeat(36)), 11);
    }

    #[test]
    fn calibration_changes_ratio() {
        let default = TokenEstimator::default();
        let calibrated = TokenEstimator::with_calibration(Some(4.0));
        let text = "a".repeat(4000);
        assert!(calibrated.estimate(&text) < default.estimate(&text));
    }

    #[test]
    fn invalid_calibration_falls_back() {
        let est = TokenEstimator::with_calibration(Some(0.0));
        assert_eq!(est.chars_per_token(), DEFAULT_CHARS_PER_TOKEN);
    }

    #[test]
    fn json_estimate_uses_compact_encoding() {
        let est = TokenEstimator::default();
        let value = serde_json::json!({"path": "src/main.rs", "lines": 120});
        let compact = serde_json::to_string(&value).unwrap();
        assert_eq!(est.estimate_json(&value), est.estimate(&compact));
    }

    #[test]
    fn truncate_respects_budget_and_char_boundaries() {
        let est = TokenEstimator::default();
        let text = "héllo wörld ".repeat(200);
        let cut = est.truncate_to(&text, 20);
        assert!(est.estimate(&cut) <= 20);
        assert!(text.starts_with(&cut));
    }

    #[test]
    fn truncate_prefers_line_breaks() {
        let est = TokenEstimator::default();
        let text = format!("{}\n{}", "a".repeat(60), "b".repeat(60));
        let cut = est.truncate_to(&text, 20);
        assert_eq!(cut, "a".repeat(60));
    }
}
