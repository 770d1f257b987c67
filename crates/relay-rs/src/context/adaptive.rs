//! Optimization profiles selected from the context window size.
//!
//! Small windows need frequent checkpoints and early summarization; huge
//! windows can run for hours between checkpoints. [`AdaptiveOptimizer`]
//! maps a window size to one of five presets, unless the operator pinned a
//! profile by name.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileName {
    UltraAggressive,
    Aggressive,
    Balanced,
    Relaxed,
    Minimal,
}

impl ProfileName {
    pub const ALL: [ProfileName; 5] = [
        ProfileName::UltraAggressive,
        ProfileName::Aggressive,
        ProfileName::Balanced,
        ProfileName::Relaxed,
        ProfileName::Minimal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileName::UltraAggressive => "ultra-aggressive",
            ProfileName::Aggressive => "aggressive",
            ProfileName::Balanced => "balanced",
            ProfileName::Relaxed => "relaxed",
            ProfileName::Minimal => "minimal",
        }
    }
}

impl std::fmt::Display for ProfileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        ProfileName::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| format!("unknown optimization profile '{s}'"))
    }
}

/// Thresholds and cadence for one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationProfile {
    pub name: ProfileName,
    /// Phases smaller than this are not summarized.
    pub summarization_trigger_tokens: usize,
    /// Time between periodic checkpoints.
    pub checkpoint_interval: Duration,
    /// Operations between periodic checkpoints.
    pub checkpoint_op_threshold: u64,
    /// Reduction requested from each optimization pass.
    pub target_reduction: f64,
}

impl OptimizationProfile {
    pub fn preset(name: ProfileName) -> Self {
        let (trigger, minutes, ops, reduction) = match name {
            ProfileName::UltraAggressive => (100, 30, 50, 0.5),
            ProfileName::Aggressive => (250, 60, 100, 0.4),
            ProfileName::Balanced => (500, 120, 200, 0.3),
            ProfileName::Relaxed => (750, 240, 400, 0.3),
            ProfileName::Minimal => (1_000, 480, 800, 0.3),
        };
        Self {
            name,
            summarization_trigger_tokens: trigger,
            checkpoint_interval: Duration::from_secs(minutes * 60),
            checkpoint_op_threshold: ops,
            target_reduction: reduction,
        }
    }
}

/// Picks an [`OptimizationProfile`] for a context window.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveOptimizer {
    override_name: Option<String>,
}

impl AdaptiveOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a profile by name. Invalid names are reported at selection time.
    pub fn with_override(mut self, name: Option<impl Into<String>>) -> Self {
        self.override_name = name.map(Into::into);
        self
    }

    /// Profile bracket for a window size, ignoring any override.
    pub fn auto_profile(max_tokens: usize) -> ProfileName {
        match max_tokens {
            0..=8_192 => ProfileName::UltraAggressive,
            8_193..=32_768 => ProfileName::Aggressive,
            32_769..=131_072 => ProfileName::Balanced,
            131_073..=524_287 => ProfileName::Relaxed,
            _ => ProfileName::Minimal,
        }
    }

    /// Select the profile for `max_tokens`. A valid override always wins;
    /// an invalid one logs a warning and falls back to auto-selection.
    pub fn select_profile(&self, max_tokens: usize) -> OptimizationProfile {
        if let Some(ref raw) = self.override_name {
            match raw.parse::<ProfileName>() {
                Ok(name) => return OptimizationProfile::preset(name),
                Err(e) => warn!("{e}; falling back to automatic profile selection"),
            }
        }
        OptimizationProfile::preset(Self::auto_profile(max_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brackets_select_expected_profiles() {
        let opt = AdaptiveOptimizer::new();
        assert_eq!(opt.select_profile(4_096).name, ProfileName::UltraAggressive);
        assert_eq!(opt.select_profile(8_192).name, ProfileName::UltraAggressive);
        assert_eq!(opt.select_profile(32_000).name, ProfileName::Aggressive);
        assert_eq!(opt.select_profile(128_000).name, ProfileName::Balanced);
        assert_eq!(opt.select_profile(200_000).name, ProfileName::Relaxed);
        assert_eq!(opt.select_profile(524_288).name, ProfileName::Minimal);
        assert_eq!(opt.select_profile(1_000_000).name, ProfileName::Minimal);
    }

    #[test]
    fn extreme_profiles_match_cadence() {
        let small = OptimizationProfile::preset(ProfileName::UltraAggressive);
        assert_eq!(small.checkpoint_interval, Duration::from_secs(30 * 60));
        assert_eq!(small.summarization_trigger_tokens, 100);

        let large = OptimizationProfile::preset(ProfileName::Minimal);
        assert_eq!(large.checkpoint_interval, Duration::from_secs(8 * 3_600));
        assert_eq!(large.summarization_trigger_tokens, 1_000);
    }

    #[test]
    fn override_takes_precedence() {
        let opt = AdaptiveOptimizer::new().with_override(Some("minimal"));
        assert_eq!(opt.select_profile(4_096).name, ProfileName::Minimal);
    }

    #[test]
    fn invalid_override_falls_back() {
        let opt = AdaptiveOptimizer::new().with_override(Some("turbo"));
        assert_eq!(opt.select_profile(4_096).name, ProfileName::UltraAggressive);
    }

    #[test]
    fn names_parse_leniently() {
        assert_eq!(
            "Ultra_Aggressive".parse::<ProfileName>().unwrap(),
            ProfileName::UltraAggressive
        );
        assert!("".parse::<ProfileName>().is_err());
    }
}
