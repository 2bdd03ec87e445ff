//! Configuration for the handoff evaluator
//!
//! Every policy knob lives here: thresholds and their adaptation bounds,
//! rate-limit budgets, lock timing, and the circular-prevention window.

use crate::candidate::{AgentRole, Direction};
use crate::error::{HandoffError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level evaluator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Confidence thresholds and adaptation bounds
    pub thresholds: ThresholdConfig,

    /// Per-conversation handoff budgets
    pub rate_limits: RateLimitConfig,

    /// Conversation lock timing
    pub lock: LockConfig,

    /// Circular-prevention window
    pub circular: CircularGuardConfig,

    /// Audit write retry policy
    pub audit: AuditConfig,
}

/// Confidence threshold configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Starting threshold for any direction without an override
    pub default_threshold: f64,

    /// Lowest value adaptation may reach
    pub floor: f64,

    /// Highest value adaptation may reach
    pub ceiling: f64,

    /// Largest move a single adaptation update may make
    pub max_step: f64,

    /// Outcomes required before adaptation starts moving the threshold
    pub min_samples: u64,

    /// Per-direction starting thresholds
    pub direction_overrides: Vec<DirectionOverride>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.70,
            floor: 0.5,
            ceiling: 0.95,
            max_step: 0.02,
            min_samples: 10,
            // Cross-specialist referrals arrive pre-qualified, so they
            // start with a lower bar.
            direction_overrides: vec![DirectionOverride {
                source: AgentRole::SellerSpecialist,
                target: AgentRole::BuyerSpecialist,
                threshold: 0.6,
            }],
        }
    }
}

impl ThresholdConfig {
    /// Starting threshold for a direction, override first.
    pub fn starting_threshold(&self, direction: Direction) -> f64 {
        self.direction_overrides
            .iter()
            .find(|o| o.source == direction.source && o.target == direction.target)
            .map(|o| o.threshold)
            .unwrap_or(self.default_threshold)
    }

    /// Reject configurations that adaptation could never satisfy.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.floor) || !(0.0..=1.0).contains(&self.ceiling) {
            return Err(HandoffError::Config(
                "threshold floor and ceiling must lie in [0.0, 1.0]".to_string(),
            ));
        }
        if self.floor > self.ceiling {
            return Err(HandoffError::Config(format!(
                "threshold floor {} exceeds ceiling {}",
                self.floor, self.ceiling
            )));
        }
        if self.max_step <= 0.0 {
            return Err(HandoffError::Config(
                "threshold max_step must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A per-direction starting threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionOverride {
    pub source: AgentRole,
    pub target: AgentRole,
    pub threshold: f64,
}

/// Per-conversation handoff budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Executed handoffs allowed per rolling hour
    pub hourly_limit: u32,

    /// Executed handoffs allowed per rolling day
    pub daily_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_limit: 3,
            daily_limit: 10,
        }
    }
}

/// Conversation lock timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease duration; the lock self-expires after this
    pub ttl: Duration,

    /// Acquisition attempts before giving up
    pub max_attempts: usize,

    /// First retry delay; doubles per attempt
    pub backoff_base: Duration,

    /// Retry delay cap
    pub backoff_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(200),
        }
    }
}

/// Circular-prevention window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircularGuardConfig {
    /// How long a same-direction repeat stays blocked after an executed
    /// handoff
    pub window: Duration,
}

impl Default for CircularGuardConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 60),
        }
    }
}

/// Audit write retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Background retries per failed write before the record is dropped
    pub max_retries: usize,

    /// First retry delay; doubles per attempt
    pub backoff_base: Duration,

    /// Retry delay cap
    pub backoff_max: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(1),
        }
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: HandoffConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HandoffConfig::default(),
        }
    }

    pub fn default_threshold(mut self, threshold: f64) -> Self {
        self.config.thresholds.default_threshold = threshold;
        self
    }

    pub fn threshold_bounds(mut self, floor: f64, ceiling: f64) -> Self {
        self.config.thresholds.floor = floor;
        self.config.thresholds.ceiling = ceiling;
        self
    }

    pub fn direction_override(
        mut self,
        source: AgentRole,
        target: AgentRole,
        threshold: f64,
    ) -> Self {
        self.config
            .thresholds
            .direction_overrides
            .retain(|o| !(o.source == source && o.target == target));
        self.config.thresholds.direction_overrides.push(DirectionOverride {
            source,
            target,
            threshold,
        });
        self
    }

    pub fn min_samples(mut self, samples: u64) -> Self {
        self.config.thresholds.min_samples = samples;
        self
    }

    pub fn hourly_limit(mut self, limit: u32) -> Self {
        self.config.rate_limits.hourly_limit = limit;
        self
    }

    pub fn daily_limit(mut self, limit: u32) -> Self {
        self.config.rate_limits.daily_limit = limit;
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.config.lock.ttl = ttl;
        self
    }

    pub fn lock_attempts(mut self, attempts: usize) -> Self {
        self.config.lock.max_attempts = attempts;
        self
    }

    pub fn circular_window(mut self, window: Duration) -> Self {
        self.config.circular.window = window;
        self
    }

    pub fn audit_retries(mut self, retries: usize) -> Self {
        self.config.audit.max_retries = retries;
        self
    }

    pub fn build(self) -> HandoffConfig {
        self.config
    }
}

/// Load configuration from environment variables
pub fn from_env() -> HandoffConfig {
    let mut config = HandoffConfig::default();

    if let Ok(threshold) = std::env::var("HANDOFF_DEFAULT_THRESHOLD") {
        if let Ok(t) = threshold.parse::<f64>() {
            config.thresholds.default_threshold = t;
        }
    }

    if let Ok(limit) = std::env::var("HANDOFF_HOURLY_LIMIT") {
        if let Ok(n) = limit.parse::<u32>() {
            config.rate_limits.hourly_limit = n;
        }
    }

    if let Ok(limit) = std::env::var("HANDOFF_DAILY_LIMIT") {
        if let Ok(n) = limit.parse::<u32>() {
            config.rate_limits.daily_limit = n;
        }
    }

    if let Ok(ttl) = std::env::var("HANDOFF_LOCK_TTL_MS") {
        if let Ok(ms) = ttl.parse::<u64>() {
            config.lock.ttl = Duration::from_millis(ms);
        }
    }

    if let Ok(window) = std::env::var("HANDOFF_CIRCULAR_WINDOW_MINUTES") {
        if let Ok(minutes) = window.parse::<u64>() {
            config.circular.window = Duration::from_secs(minutes * 60);
        }
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<HandoffConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: HandoffConfig =
        toml::from_str(&contents).map_err(|e| HandoffError::Config(e.to_string()))?;
    config.thresholds.validate()?;
    Ok(config)
}
