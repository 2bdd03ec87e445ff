//! Adaptive confidence thresholds
//!
//! Each direction carries its own threshold. It starts at a configured
//! value and, once enough outcomes have been reported, drifts toward the
//! observed failure rate in bounded steps: directions that keep failing
//! get harder to trigger, directions that keep succeeding get easier.
//! The adapter is an explicit injectable component, not ambient state, so
//! tests can build deterministic instances.
//!
//! Outcomes are reported by an external collaborator once real-world
//! signal is known. Nothing here measures success; it only records what
//! it is told.

use crate::candidate::{Direction, HandoffOutcome};
use crate::config::ThresholdConfig;
use crate::error::Result;
use crate::store::HandoffStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// A threshold value together with the sample count it was computed
/// from.
///
/// The count makes reads versioned: two reads with equal `samples` saw
/// the same adaptation state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdReading {
    pub value: f64,
    pub samples: u64,
}

/// Adaptation state for one direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdProfile {
    pub direction: Direction,
    pub current_threshold: f64,
    pub sample_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl ThresholdProfile {
    pub fn new(direction: Direction, starting_threshold: f64) -> Self {
        Self {
            direction,
            current_threshold: starting_threshold,
            sample_count: 0,
            success_count: 0,
            failure_count: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.sample_count as f64
        }
    }

    /// Count one outcome and, once enough samples exist, nudge the
    /// threshold toward the observed failure rate.
    ///
    /// Each update moves at most `max_step` and the result stays inside
    /// `[floor, ceiling]`, so no burst of outcomes can swing the
    /// threshold to an extreme.
    pub fn record(&mut self, success: bool, config: &ThresholdConfig) {
        self.sample_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }

        if self.sample_count < config.min_samples {
            return;
        }

        let target = 1.0 - self.success_rate();
        let delta = (target - self.current_threshold).clamp(-config.max_step, config.max_step);
        self.current_threshold =
            (self.current_threshold + delta).clamp(config.floor, config.ceiling);
    }

    pub fn reading(&self) -> ThresholdReading {
        ThresholdReading {
            value: self.current_threshold,
            samples: self.sample_count,
        }
    }
}

/// Holds per-direction adaptation state and optionally persists it.
pub struct ThresholdAdapter {
    config: ThresholdConfig,
    profiles: RwLock<HashMap<Direction, ThresholdProfile>>,
    store: Option<Arc<dyn HandoffStore>>,
}

impl ThresholdAdapter {
    /// Adapter with purely in-memory state
    pub fn new(config: ThresholdConfig) -> Self {
        Self {
            config,
            profiles: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Adapter that writes every profile change through to the store
    pub fn with_store(config: ThresholdConfig, store: Arc<dyn HandoffStore>) -> Self {
        Self {
            config,
            profiles: RwLock::new(HashMap::new()),
            store: Some(store),
        }
    }

    /// Load persisted profiles, replacing any in-memory state for the
    /// directions found. Returns how many profiles were loaded.
    pub async fn hydrate(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let persisted = store.profiles().await?;
        let count = persisted.len();
        let mut profiles = self.profiles.write().unwrap();
        for profile in persisted {
            profiles.insert(profile.direction, profile);
        }
        if count > 0 {
            info!(profiles = count, "threshold profiles hydrated from store");
        }
        Ok(count)
    }

    /// Current threshold for a direction, with its sample count.
    pub fn read(&self, direction: Direction) -> ThresholdReading {
        let profiles = self.profiles.read().unwrap();
        match profiles.get(&direction) {
            Some(profile) => profile.reading(),
            None => ThresholdReading {
                value: self.config.starting_threshold(direction),
                samples: 0,
            },
        }
    }

    /// Record one reported outcome and persist the updated profile.
    pub async fn record_outcome(
        &self,
        direction: Direction,
        success: bool,
    ) -> Result<ThresholdReading> {
        let profile = {
            let mut profiles = self.profiles.write().unwrap();
            let profile = profiles.entry(direction).or_insert_with(|| {
                ThresholdProfile::new(direction, self.config.starting_threshold(direction))
            });
            profile.record(success, &self.config);
            profile.clone()
        };

        debug!(
            direction = %direction,
            success,
            samples = profile.sample_count,
            threshold = profile.current_threshold,
            "handoff outcome recorded"
        );

        if let Some(store) = &self.store {
            store.save_profile(&profile).await?;
        }
        Ok(profile.reading())
    }

    /// Replay a batch of historical outcomes, oldest first.
    pub async fn absorb(&self, outcomes: &[HandoffOutcome]) -> Result<()> {
        for outcome in outcomes {
            self.record_outcome(outcome.direction, outcome.success).await?;
        }
        Ok(())
    }

    /// Snapshot of every direction currently tracked
    pub fn snapshot(&self) -> Vec<ThresholdProfile> {
        let profiles = self.profiles.read().unwrap();
        profiles.values().cloned().collect()
    }
}
