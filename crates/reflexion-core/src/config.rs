use serde::Deserialize;
use std::time::Duration;

/// Tuning knobs for a single review loop. Everything here has a sensible
/// default; `reflexion.toml` and CLI flags override fields individually.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    /// Hard cap on attempts before the task escalates
    pub max_attempts: u32,

    /// How many consecutive equivalent critiques count as a deadlock
    pub deadlock_window: usize,

    /// Retries per external call before the failure counts as
    /// infrastructure
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Wall-clock budget for one worker or reviewer call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// How long a challenge stays open before it escalates on timeout
    #[serde(with = "humantime_serde")]
    pub response_window: Duration,

    /// How often the controller re-checks a pending challenge
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Half-life for recency-weighted pattern frequency
    #[serde(with = "humantime_serde")]
    pub pattern_half_life: Duration,

    /// How far back pattern queries look
    #[serde(with = "humantime_serde")]
    pub pattern_window: Duration,

    /// Minimum analogous resolutions before a pattern may settle a dispute
    pub min_pattern_support: usize,

    /// Majority share required for a pattern to settle a dispute
    pub consistency_threshold: f64,

    /// How many mined patterns feed into revised instructions
    pub pattern_top_k: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            deadlock_window: 3,
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            call_timeout: Duration::from_secs(600),
            response_window: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
            pattern_half_life: Duration::from_secs(7 * 24 * 3600),
            pattern_window: Duration::from_secs(30 * 24 * 3600),
            min_pattern_support: 3,
            consistency_threshold: 0.8,
            pattern_top_k: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = LoopConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.deadlock_window, 3);
        assert_eq!(config.min_pattern_support, 3);
        assert!((config.consistency_threshold - 0.8).abs() < 1e-9);
    }

    #[test]
    fn partial_toml_overrides_keep_remaining_defaults() {
        let config: LoopConfig =
            toml::from_str("max_attempts = 2\nresponse_window = \"30s\"").unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.response_window, Duration::from_secs(30));
        assert_eq!(config.deadlock_window, 3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<LoopConfig, _> = toml::from_str("max_iterations = 2");
        assert!(result.is_err());
    }
}
