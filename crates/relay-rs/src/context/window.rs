//! Context window tracking with percentage-based zones.
//!
//! [`ContextWindowManager`] accumulates token usage against an effective
//! maximum (`max_tokens * utilization_limit`) and classifies the current
//! utilization into a [`Zone`]. Zone boundaries are percentages, so a 4K
//! model and a 1M model hit yellow at the same relative fill; the absolute
//! token thresholds are recomputed whenever the window is reconfigured.
//!
//! All state sits behind one mutex. Readers receive copies, so a
//! [`WindowSnapshot`] is always internally consistent.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Utilization band over the effective window.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Green,
    Yellow,
    Orange,
    Red,
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Zone::Green => write!(f, "green"),
            Zone::Yellow => write!(f, "yellow"),
            Zone::Orange => write!(f, "orange"),
            Zone::Red => write!(f, "red"),
        }
    }
}

/// What the caller should do at the current utilization.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Proceed,
    Monitor,
    Optimize,
    CheckpointNow,
}

/// Zone boundaries as fractions of the effective window.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct ZoneThresholds {
    /// Start monitoring (still green). Default: 0.50.
    pub monitor: f64,
    /// Enter yellow. Default: 0.70.
    pub yellow: f64,
    /// Enter orange. Default: 0.85.
    pub orange: f64,
    /// Enter red. Default: 0.95.
    pub red: f64,
}

impl Default for ZoneThresholds {
    fn default() -> Self {
        Self {
            monitor: 0.50,
            yellow: 0.70,
            orange: 0.85,
            red: 0.95,
        }
    }
}

impl ZoneThresholds {
    /// Thresholds must be strictly increasing within `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        let ordered = [self.monitor, self.yellow, self.orange, self.red];
        let in_range = ordered.iter().all(|t| *t > 0.0 && *t <= 1.0);
        let increasing = ordered.windows(2).all(|w| w[0] < w[1]);
        if in_range && increasing {
            Ok(())
        } else {
            Err(RelayError::Config(format!(
                "zone thresholds must be increasing within (0, 1]: {ordered:?}"
            )))
        }
    }

    /// Zone for a usage fraction of the effective window.
    pub fn zone_for(&self, usage_pct: f64) -> Zone {
        if usage_pct >= self.red {
            Zone::Red
        } else if usage_pct >= self.orange {
            Zone::Orange
        } else if usage_pct >= self.yellow {
            Zone::Yellow
        } else {
            Zone::Green
        }
    }

    /// Recommended action for a usage fraction of the effective window.
    pub fn action_for(&self, usage_pct: f64) -> RecommendedAction {
        match self.zone_for(usage_pct) {
            Zone::Orange | Zone::Red => RecommendedAction::CheckpointNow,
            Zone::Yellow => RecommendedAction::Optimize,
            Zone::Green if usage_pct >= self.monitor => RecommendedAction::Monitor,
            Zone::Green => RecommendedAction::Proceed,
        }
    }

    /// Absolute token boundaries for an effective window.
    pub fn to_limits(&self, effective_max: usize) -> ZoneLimits {
        let at = |pct: f64| (effective_max as f64 * pct).ceil() as usize;
        ZoneLimits {
            monitor: at(self.monitor),
            yellow: at(self.yellow),
            orange: at(self.orange),
            red: at(self.red),
        }
    }
}

/// Zone boundaries expressed in tokens for a particular window.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneLimits {
    pub monitor: usize,
    pub yellow: usize,
    pub orange: usize,
    pub red: usize,
}

impl ZoneLimits {
    fn zone(&self, used: usize) -> Zone {
        if used >= self.red {
            Zone::Red
        } else if used >= self.orange {
            Zone::Orange
        } else if used >= self.yellow {
            Zone::Yellow
        } else {
            Zone::Green
        }
    }

    fn action(&self, used: usize) -> RecommendedAction {
        match self.zone(used) {
            Zone::Orange | Zone::Red => RecommendedAction::CheckpointNow,
            Zone::Yellow => RecommendedAction::Optimize,
            Zone::Green if used >= self.monitor => RecommendedAction::Monitor,
            Zone::Green => RecommendedAction::Proceed,
        }
    }
}

/// Result of [`ContextWindowManager::add_usage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageUpdate {
    pub zone: Zone,
    /// Whether the addition was clamped at the effective max. The caller must
    /// run an optimization pass before continuing.
    pub overflow: bool,
    pub used_tokens: usize,
    /// Tokens that did not fit and were dropped from the tally.
    pub clamped_tokens: usize,
}

/// Point-in-time copy of the window state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WindowSnapshot {
    pub max_tokens: usize,
    pub utilization_limit: f64,
    pub used_tokens: usize,
    pub effective_max: usize,
    pub usage_pct: f64,
    pub zone: Zone,
    pub limits: ZoneLimits,
    /// Set once any addition has been clamped since the last reset.
    pub overflowed: bool,
}

impl WindowSnapshot {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: {} / {} tokens ({:.0}%, {})",
            self.used_tokens,
            self.effective_max,
            self.usage_pct * 100.0,
            self.zone,
        )
    }
}

#[derive(Debug)]
struct WindowState {
    max_tokens: usize,
    utilization_limit: f64,
    used_tokens: usize,
    effective_max: usize,
    limits: ZoneLimits,
    overflowed: bool,
}

impl WindowState {
    fn usage_pct(&self) -> f64 {
        if self.effective_max > 0 {
            self.used_tokens as f64 / self.effective_max as f64
        } else {
            1.0
        }
    }
}

/// Tracks cumulative usage against the configured context window.
///
/// # Example
///
/// ```
/// use relay_rs::context::window::{ContextWindowManager, Zone};
///
/// let window = ContextWindowManager::new(4_096, 1.0).unwrap();
/// let update = window.add_usage(3_000);
/// assert_eq!(update.zone, Zone::Yellow);
/// assert!(!update.overflow);
/// ```
#[derive(Debug)]
pub struct ContextWindowManager {
    thresholds: ZoneThresholds,
    state: Mutex<WindowState>,
}

impl ContextWindowManager {
    /// Create a manager with the default zone thresholds.
    pub fn new(max_tokens: usize, utilization_limit: f64) -> Result<Self> {
        Self::with_thresholds(max_tokens, utilization_limit, ZoneThresholds::default())
    }

    pub fn with_thresholds(
        max_tokens: usize,
        utilization_limit: f64,
        thresholds: ZoneThresholds,
    ) -> Result<Self> {
        thresholds.validate()?;
        let (effective_max, limits) = Self::derive(max_tokens, utilization_limit, &thresholds)?;
        Ok(Self {
            thresholds,
            state: Mutex::new(WindowState {
                max_tokens,
                utilization_limit,
                used_tokens: 0,
                effective_max,
                limits,
                overflowed: false,
            }),
        })
    }

    fn derive(
        max_tokens: usize,
        utilization_limit: f64,
        thresholds: &ZoneThresholds,
    ) -> Result<(usize, ZoneLimits)> {
        if max_tokens == 0 {
            return Err(RelayError::Config("max_tokens must be positive".into()));
        }
        if !(utilization_limit > 0.0 && utilization_limit <= 1.0) {
            return Err(RelayError::Config(format!(
                "utilization_limit must be within (0, 1], got {utilization_limit}"
            )));
        }
        let effective_max = ((max_tokens as f64 * utilization_limit).floor() as usize).max(1);
        Ok((effective_max, thresholds.to_limits(effective_max)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reconfigure the window. Absolute zone limits are recomputed and the
    /// current usage is clamped to the new effective max.
    pub fn configure(&self, max_tokens: usize, utilization_limit: f64) -> Result<()> {
        let (effective_max, limits) =
            Self::derive(max_tokens, utilization_limit, &self.thresholds)?;
        let mut state = self.lock();
        state.max_tokens = max_tokens;
        state.utilization_limit = utilization_limit;
        state.effective_max = effective_max;
        state.limits = limits;
        if state.used_tokens > effective_max {
            state.used_tokens = effective_max;
            state.overflowed = true;
        }
        debug!(
            "Context window configured: {max_tokens} tokens x {utilization_limit} = {effective_max} effective"
        );
        Ok(())
    }

    /// Add consumed tokens. Never lets usage exceed the effective max: the
    /// excess is clamped and reported through [`UsageUpdate::overflow`].
    pub fn add_usage(&self, tokens: usize) -> UsageUpdate {
        let mut state = self.lock();
        let wanted = state.used_tokens.saturating_add(tokens);
        let (used, clamped) = if wanted > state.effective_max {
            (state.effective_max, wanted - state.effective_max)
        } else {
            (wanted, 0)
        };
        state.used_tokens = used;
        let overflow = clamped > 0;
        if overflow {
            state.overflowed = true;
            warn!(
                "Context usage clamped at {} tokens ({clamped} token(s) over the effective max)",
                state.effective_max
            );
        }
        UsageUpdate {
            zone: state.limits.zone(used),
            overflow,
            used_tokens: used,
            clamped_tokens: clamped,
        }
    }

    pub fn zone(&self) -> Zone {
        let state = self.lock();
        state.limits.zone(state.used_tokens)
    }

    pub fn usage_pct(&self) -> f64 {
        self.lock().usage_pct()
    }

    pub fn recommended_action(&self) -> RecommendedAction {
        let state = self.lock();
        state.limits.action(state.used_tokens)
    }

    pub fn thresholds(&self) -> &ZoneThresholds {
        &self.thresholds
    }

    /// Clear usage. Called at self-handoff and resume boundaries.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.used_tokens = 0;
        state.overflowed = false;
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        let state = self.lock();
        WindowSnapshot {
            max_tokens: state.max_tokens,
            utilization_limit: state.utilization_limit,
            used_tokens: state.used_tokens,
            effective_max: state.effective_max,
            usage_pct: state.usage_pct(),
            zone: state.limits.zone(state.used_tokens),
            limits: state.limits,
            overflowed: state.overflowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zones_follow_percentages() {
        let window = ContextWindowManager::new(10_000, 1.0).unwrap();
        assert_eq!(window.add_usage(4_999).zone, Zone::Green);
        assert_eq!(window.recommended_action(), RecommendedAction::Proceed);
        window.add_usage(1);
        assert_eq!(window.recommended_action(), RecommendedAction::Monitor);
        assert_eq!(window.add_usage(2_000).zone, Zone::Yellow);
        assert_eq!(window.recommended_action(), RecommendedAction::Optimize);
        assert_eq!(window.add_usage(1_500).zone, Zone::Orange);
        assert_eq!(window.recommended_action(), RecommendedAction::CheckpointNow);
        assert_eq!(window.add_usage(1_000).zone, Zone::Red);
        assert_eq!(window.recommended_action(), RecommendedAction::CheckpointNow);
    }

    #[test]
    fn zone_boundaries_independent_of_window_size() {
        for max in [4_096usize, 16_384, 128_000, 1_000_000] {
            let probe = ContextWindowManager::new(max, 0.9).unwrap();
            let limits = probe.snapshot().limits;
            for (boundary, zone) in [
                (limits.yellow, Zone::Yellow),
                (limits.orange, Zone::Orange),
                (limits.red, Zone::Red),
            ] {
                let below = ContextWindowManager::new(max, 0.9).unwrap();
                assert!(below.add_usage(boundary - 1).zone < zone, "max={max}");
                let at = ContextWindowManager::new(max, 0.9).unwrap();
                assert_eq!(at.add_usage(boundary).zone, zone, "max={max}");
            }
        }
    }

    #[test]
    fn add_usage_clamps_and_flags_overflow() {
        let window = ContextWindowManager::new(1_000, 0.8).unwrap();
        let update = window.add_usage(900);
        assert!(update.overflow);
        assert_eq!(update.used_tokens, 800);
        assert_eq!(update.clamped_tokens, 100);
        assert_eq!(update.zone, Zone::Red);

        let snap = window.snapshot();
        assert_eq!(snap.used_tokens, snap.effective_max);
        assert!(snap.overflowed);
    }

    #[test]
    fn reset_clears_usage_and_overflow() {
        let window = ContextWindowManager::new(1_000, 1.0).unwrap();
        window.add_usage(2_000);
        window.reset();
        let snap = window.snapshot();
        assert_eq!(snap.used_tokens, 0);
        assert!(!snap.overflowed);
        assert_eq!(snap.zone, Zone::Green);
    }

    #[test]
    fn configure_recomputes_limits_and_clamps() {
        let window = ContextWindowManager::new(100_000, 1.0).unwrap();
        window.add_usage(10_000);
        assert_eq!(window.zone(), Zone::Green);

        window.configure(10_000, 1.0).unwrap();
        let snap = window.snapshot();
        assert_eq!(snap.limits.yellow, 7_000);
        assert_eq!(snap.used_tokens, 10_000);
        assert_eq!(snap.zone, Zone::Red);

        window.configure(5_000, 1.0).unwrap();
        assert_eq!(window.snapshot().used_tokens, 5_000);
    }

    #[test]
    fn invalid_configuration_rejected() {
        assert!(ContextWindowManager::new(0, 1.0).is_err());
        assert!(ContextWindowManager::new(1_000, 0.0).is_err());
        assert!(ContextWindowManager::new(1_000, 1.5).is_err());
        let bad = ZoneThresholds {
            yellow: 0.9,
            orange: 0.8,
            ..Default::default()
        };
        assert!(ContextWindowManager::with_thresholds(1_000, 1.0, bad).is_err());
    }

    #[test]
    fn log_string_mentions_zone() {
        let window = ContextWindowManager::new(1_000, 1.0).unwrap();
        window.add_usage(960);
        assert!(window.snapshot().to_log_string().contains("red"));
    }
}
