//! Engine tuning.
//!
//! Every threshold the engine consults lives in one immutable [`EngineConfig`]
//! so the decision functions stay pure. Sections deserialize with defaults, so
//! a TOML file only needs to mention the knobs it changes. The fingerprint is
//! emitted at startup so diagnostics can be tied to the tuning in effect.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Error produced when configuration parameters fail validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{field} ({value}) must not be below {floor_field} ({floor})")]
    BelowFloor {
        field: &'static str,
        value: f64,
        floor_field: &'static str,
        floor: f64,
    },
    #[error("stall confirm window for exhausted buffers must not exceed the normal window")]
    ExhaustedConfirmTooLong,
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Periodic evaluation and stall confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Interval between watchdog samples of a candidate.
    pub tick_interval_ms: u64,
    /// No-progress duration before a candidate with buffer ahead is STALLED.
    pub stall_confirm_ms: u64,
    /// No-progress duration before a candidate with an exhausted buffer is STALLED.
    pub exhausted_confirm_ms: u64,
    /// A pause observed this soon after a stall is attributed to the stall.
    pub pause_after_stall_window_ms: u64,
    /// A HEALING candidate that has not advanced this long after its heal ended is STALLED again.
    pub heal_verify_ms: u64,
    /// Minimum spacing between stall log lines for the same candidate.
    pub stall_log_interval_ms: u64,
    /// Buffer ahead of the playhead below which the buffer counts as exhausted.
    pub exhausted_ahead_s: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            stall_confirm_ms: 2_500,
            exhausted_confirm_ms: 1_200,
            pause_after_stall_window_ms: 3_000,
            heal_verify_ms: 2_000,
            stall_log_interval_ms: 5_000,
            exhausted_ahead_s: 0.1,
        }
    }
}

/// Progress streak and trust tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Consecutive progress needed before a candidate is progress-eligible.
    pub min_progress_ms: u64,
    /// Smallest playhead advance that counts as progress.
    pub epsilon_s: f64,
    /// A forward jump larger than wall time plus this tolerance is a discontinuity.
    pub jump_tolerance_s: f64,
    /// A gap without progress longer than this breaks the streak.
    pub streak_break_ms: u64,
    /// Progress must have been seen within this window for a candidate to be trusted.
    pub trust_window_ms: u64,
    /// Window after a regression during which the scorer penalizes the candidate.
    pub regression_window_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_progress_ms: 5_000,
            epsilon_s: 0.01,
            jump_tolerance_s: 2.0,
            streak_break_ms: 1_500,
            trust_window_ms: 10_000,
            regression_window_ms: 5_000,
        }
    }
}

/// Buffer gap finder thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// Offset of a nudge target ahead of the playhead.
    pub nudge_offset_s: f64,
    /// Offset into the next range when jumping a real gap.
    pub gap_landing_offset_s: f64,
    /// Buffered headroom required for a heal point.
    pub min_headroom_s: f64,
    /// Relaxed headroom floor used for real gaps or exhausted buffers.
    pub relaxed_headroom_s: f64,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            nudge_offset_s: 0.5,
            gap_landing_offset_s: 0.1,
            min_headroom_s: 1.0,
            relaxed_headroom_s: 0.25,
        }
    }
}

/// Weights for the candidate scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub base: i32,
    pub fallback_src_penalty: i32,
    pub detached_penalty: i32,
    pub paused_penalty: i32,
    pub short_streak_penalty: i32,
    pub regression_penalty: i32,
    pub ended_or_error_penalty: i32,
    pub recent_progress_bonus: i32,
    pub ready_state_bonus: i32,
    /// Progress within this window earns the recent-progress bonus.
    pub recent_progress_window_ms: u64,
    /// Sources starting with one of these prefixes are placeholders.
    pub placeholder_src_prefixes: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base: 10,
            fallback_src_penalty: 8,
            detached_penalty: 20,
            paused_penalty: 4,
            short_streak_penalty: 3,
            regression_penalty: 3,
            ended_or_error_penalty: 10,
            recent_progress_bonus: 5,
            ready_state_bonus: 2,
            recent_progress_window_ms: 3_000,
            placeholder_src_prefixes: vec!["about:".to_string(), "data:".to_string()],
        }
    }
}

/// Candidate selection and switching hysteresis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Minimum score advantage before a normal switch happens.
    pub switch_delta: i32,
    /// No-heal-point count that makes a HEALING active candidate "stuck".
    pub fast_switch_no_heal_points: u32,
    /// Stall duration that makes a HEALING active candidate "stuck".
    pub fast_switch_stall_ms: u64,
    /// Streak the preferred candidate needs for a fast switch.
    pub fast_switch_min_streak_ms: u64,
    /// Duration of a probation window.
    pub probation_window_ms: u64,
    /// Minimum spacing between probation windows.
    pub probation_cooldown_ms: u64,
    /// Streak a preferred candidate needs to be accepted under probation.
    pub probation_min_streak_ms: u64,
    /// How long a dead candidate stays ineligible as preferred.
    pub dead_candidate_ms: u64,
    /// Number of candidates tracked before the lowest scorer is pruned.
    pub max_candidates: usize,
    /// Minimum spacing between aggregated suppression reports.
    pub suppression_log_interval_ms: u64,
    /// Interval of the background selection pass.
    pub evaluate_interval_ms: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            switch_delta: 3,
            fast_switch_no_heal_points: 2,
            fast_switch_stall_ms: 8_000,
            fast_switch_min_streak_ms: 5_000,
            probation_window_ms: 15_000,
            probation_cooldown_ms: 30_000,
            probation_min_streak_ms: 1_500,
            dead_candidate_ms: 20_000,
            max_candidates: 6,
            suppression_log_interval_ms: 10_000,
            evaluate_interval_ms: 2_000,
        }
    }
}

/// Heal pipeline timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    /// Upper bound on the POLL phase.
    pub poll_timeout_ms: u64,
    /// Sleep between POLL iterations.
    pub poll_interval_ms: u64,
    /// Headroom below which a found point is deferred rather than used.
    pub defer_headroom_s: f64,
    /// Ceiling on total deferral before a thin point counts as no point.
    pub max_defer_ms: u64,
    /// Delay before the single retry after an abort-class seek/play error.
    pub abort_retry_delay_ms: u64,
    /// Seeks to the same heal point before the attempt counts as a play failure.
    pub repeat_failover_count: u32,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 15_000,
            poll_interval_ms: 250,
            defer_headroom_s: 2.0,
            max_defer_ms: 3_000,
            abort_retry_delay_ms: 200,
            repeat_failover_count: 3,
        }
    }
}

/// Post-heal catch-up towards the live edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatchUpConfig {
    pub enabled: bool,
    pub delay_ms: u64,
    pub min_stable_ms: u64,
    pub max_lag_s: f64,
    pub target_lag_s: f64,
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 6_000,
            min_stable_ms: 4_000,
            max_lag_s: 8.0,
            target_lag_s: 3.0,
        }
    }
}

/// Linear-capped backoff curves (`min(base * count, max)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub no_heal_base_ms: u64,
    pub no_heal_max_ms: u64,
    pub play_error_base_ms: u64,
    pub play_error_max_ms: u64,
    pub abort_base_ms: u64,
    pub abort_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            no_heal_base_ms: 2_000,
            no_heal_max_ms: 20_000,
            play_error_base_ms: 2_500,
            play_error_max_ms: 15_000,
            abort_base_ms: 1_000,
            abort_max_ms: 5_000,
        }
    }
}

/// Escalation ladder thresholds and cooldowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub quiet_after_no_heal: u32,
    pub quiet_window_ms: u64,
    pub quiet_cooldown_ms: u64,
    pub refresh_window_ms: u64,
    /// Buffered headroom below which a ready candidate opens the refresh window.
    pub refresh_low_headroom_s: f64,
    pub probation_after_no_heal: u32,
    pub probation_after_play_errors: u32,
    pub failover_after_no_heal: u32,
    pub failover_after_stall_ms: u64,
    pub failover_after_play_errors: u32,
    pub emergency_after_no_heal: u32,
    pub emergency_cooldown_ms: u64,
    pub relax_readiness_after_no_heal: u32,
    pub refresh_after_no_heal: u32,
    pub single_candidate_refresh_after_stuck: u32,
    pub refresh_cooldown_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            quiet_after_no_heal: 8,
            quiet_window_ms: 60_000,
            quiet_cooldown_ms: 120_000,
            refresh_window_ms: 90_000,
            refresh_low_headroom_s: 1.0,
            probation_after_no_heal: 3,
            probation_after_play_errors: 3,
            failover_after_no_heal: 4,
            failover_after_stall_ms: 20_000,
            failover_after_play_errors: 3,
            emergency_after_no_heal: 6,
            emergency_cooldown_ms: 15_000,
            relax_readiness_after_no_heal: 8,
            refresh_after_no_heal: 10,
            single_candidate_refresh_after_stuck: 3,
            refresh_cooldown_ms: 300_000,
        }
    }
}

/// Failover protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Time the target gets to prove progress before the switch is reverted.
    pub progress_timeout_ms: u64,
    pub cooldown_ms: u64,
    /// How long a target that failed verification is excluded.
    pub exclusion_ms: u64,
    pub probe_cooldown_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            progress_timeout_ms: 8_000,
            cooldown_ms: 10_000,
            exclusion_ms: 60_000,
            probe_cooldown_ms: 30_000,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub watchdog: WatchdogConfig,
    pub progress: ProgressConfig,
    pub gap: GapConfig,
    pub scoring: ScoringConfig,
    pub selection: SelectionConfig,
    pub heal: HealConfig,
    pub catch_up: CatchUpConfig,
    pub backoff: BackoffConfig,
    pub escalation: EscalationConfig,
    pub failover: FailoverConfig,
}

impl EngineConfig {
    /// Parses a (possibly partial) TOML document and validates the result.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the relations between knobs that the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("watchdog.tick_interval_ms", self.watchdog.tick_interval_ms),
            ("watchdog.stall_confirm_ms", self.watchdog.stall_confirm_ms),
            ("progress.min_progress_ms", self.progress.min_progress_ms),
            ("heal.poll_interval_ms", self.heal.poll_interval_ms),
            ("heal.poll_timeout_ms", self.heal.poll_timeout_ms),
            ("failover.progress_timeout_ms", self.failover.progress_timeout_ms),
            ("backoff.no_heal_base_ms", self.backoff.no_heal_base_ms),
            ("backoff.play_error_base_ms", self.backoff.play_error_base_ms),
            ("backoff.abort_base_ms", self.backoff.abort_base_ms),
            ("selection.evaluate_interval_ms", self.selection.evaluate_interval_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.selection.max_candidates == 0 {
            return Err(ConfigError::Zero("selection.max_candidates"));
        }
        if self.heal.repeat_failover_count == 0 {
            return Err(ConfigError::Zero("heal.repeat_failover_count"));
        }

        let floors = [
            (
                "backoff.no_heal_max_ms",
                self.backoff.no_heal_max_ms as f64,
                "backoff.no_heal_base_ms",
                self.backoff.no_heal_base_ms as f64,
            ),
            (
                "backoff.play_error_max_ms",
                self.backoff.play_error_max_ms as f64,
                "backoff.play_error_base_ms",
                self.backoff.play_error_base_ms as f64,
            ),
            (
                "backoff.abort_max_ms",
                self.backoff.abort_max_ms as f64,
                "backoff.abort_base_ms",
                self.backoff.abort_base_ms as f64,
            ),
            (
                "gap.min_headroom_s",
                self.gap.min_headroom_s,
                "gap.relaxed_headroom_s",
                self.gap.relaxed_headroom_s,
            ),
            (
                "heal.defer_headroom_s",
                self.heal.defer_headroom_s,
                "gap.min_headroom_s",
                self.gap.min_headroom_s,
            ),
            (
                "catch_up.max_lag_s",
                self.catch_up.max_lag_s,
                "catch_up.target_lag_s",
                self.catch_up.target_lag_s,
            ),
        ];
        for (field, value, floor_field, floor) in floors {
            if value < floor {
                return Err(ConfigError::BelowFloor {
                    field,
                    value,
                    floor_field,
                    floor,
                });
            }
        }

        if self.watchdog.exhausted_confirm_ms > self.watchdog.stall_confirm_ms {
            return Err(ConfigError::ExhaustedConfirmTooLong);
        }
        Ok(())
    }

    /// Stable hex digest of the normalized configuration.
    pub fn fingerprint(&self) -> String {
        let normalized = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&normalized);
        digest.iter().map(|byte| format!("{:02x}", byte)).collect()
    }
}
