use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Pacing interval used by the reference sender.
pub const DEFAULT_PACING_INTERVAL: Duration = Duration::from_millis(10);
/// A frame is spread over at most this many bursts.
pub const DEFAULT_MAX_BURSTS_PER_FRAME: usize = 3;
/// Span of send history kept for retransmission dedup.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(500);
/// Queue depth, in seconds of maximum-rate traffic, that indicates an upstream bug.
pub const DEFAULT_HUGE_QUEUE_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(String),
    #[error("pacing interval must be non-zero")]
    ZeroPacingInterval,
    #[error("target burst size must be non-zero")]
    ZeroTargetBurst,
    #[error("max burst size {max} is below target burst size {target}")]
    MaxBelowTarget { target: usize, max: usize },
    #[error("max bursts per frame must be non-zero")]
    ZeroBurstsPerFrame,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PacingConfigInput {
    pub pacing_interval_ms: Option<u64>,
    pub target_burst_size: Option<usize>,
    pub max_burst_size: Option<usize>,
    pub max_bursts_per_frame: Option<usize>,
    pub dedup_window_ms: Option<u64>,
    pub huge_queue_secs: Option<u64>,
}

/// Pacer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingConfig {
    /// Length of one burst interval.
    pub pacing_interval: Duration,
    /// Preferred packets per interval.
    pub target_burst_size: usize,
    /// Hard cap on packets per interval.
    pub max_burst_size: usize,
    pub max_bursts_per_frame: usize,
    pub dedup_window: Duration,
    pub huge_queue_duration: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            pacing_interval: DEFAULT_PACING_INTERVAL,
            target_burst_size: 10,
            max_burst_size: 20,
            max_bursts_per_frame: DEFAULT_MAX_BURSTS_PER_FRAME,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            huge_queue_duration: DEFAULT_HUGE_QUEUE_DURATION,
        }
    }
}

impl PacingConfigInput {
    pub fn resolve(self) -> Result<PacingConfig, ConfigError> {
        let defaults = PacingConfig::default();
        let config = PacingConfig {
            pacing_interval: self
                .pacing_interval_ms
                .map_or(defaults.pacing_interval, Duration::from_millis),
            target_burst_size: self.target_burst_size.unwrap_or(defaults.target_burst_size),
            max_burst_size: self.max_burst_size.unwrap_or(defaults.max_burst_size),
            max_bursts_per_frame: self
                .max_bursts_per_frame
                .unwrap_or(defaults.max_bursts_per_frame),
            dedup_window: self
                .dedup_window_ms
                .map_or(defaults.dedup_window, Duration::from_millis),
            huge_queue_duration: self
                .huge_queue_secs
                .map_or(defaults.huge_queue_duration, Duration::from_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

impl PacingConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(PacingConfig::default());
        }
        let parsed: PacingConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Toml(e.to_string()))?;
        parsed.resolve()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pacing_interval.is_zero() {
            return Err(ConfigError::ZeroPacingInterval);
        }
        if self.target_burst_size == 0 {
            return Err(ConfigError::ZeroTargetBurst);
        }
        if self.max_burst_size < self.target_burst_size {
            return Err(ConfigError::MaxBelowTarget {
                target: self.target_burst_size,
                max: self.max_burst_size,
            });
        }
        if self.max_bursts_per_frame == 0 {
            return Err(ConfigError::ZeroBurstsPerFrame);
        }
        Ok(())
    }

    /// Whole pacing intervals that fit in `span`, clamped to `usize`.
    fn intervals_in(&self, span: Duration) -> usize {
        let intervals = span.as_nanos() / self.pacing_interval.as_nanos().max(1);
        usize::try_from(intervals).unwrap_or(usize::MAX)
    }

    /// Rollover size of the send history: one dedup window at full burst rate.
    pub fn history_capacity(&self) -> usize {
        self.max_burst_size
            .saturating_mul(self.intervals_in(self.dedup_window))
            .max(1)
    }

    /// Queue depth beyond which the pacer reports an upstream bug: everything
    /// that could leave in `huge_queue_duration` at the maximum burst rate.
    pub fn huge_queue_threshold(&self) -> usize {
        self.max_burst_size
            .saturating_mul(self.intervals_in(self.huge_queue_duration).max(1))
    }
}
