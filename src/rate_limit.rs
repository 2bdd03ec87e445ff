//! Per-conversation handoff budgets
//!
//! Caps how often ownership can move for a single conversation: a small
//! hourly budget catches ping-pong loops the circular guard cannot see
//! (for example A->B->C->A), and a daily budget caps total churn. Only
//! executed handoffs consume budget; blocked attempts are free.

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::store::HandoffStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

fn hourly_window() -> Duration {
    Duration::hours(1)
}

fn daily_window() -> Duration {
    Duration::hours(24)
}

/// Budget consumption for one conversation.
///
/// Each window is anchored at its first counted handoff and resets once
/// more than the full span has elapsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateCounters {
    pub hourly_count: u32,
    pub hourly_window_start: DateTime<Utc>,
    pub daily_count: u32,
    pub daily_window_start: DateTime<Utc>,
}

impl RateCounters {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            hourly_count: 0,
            hourly_window_start: now,
            daily_count: 0,
            daily_window_start: now,
        }
    }

    /// Reset any window whose start is more than its span in the past.
    /// A window exactly its span old is still live.
    pub fn rolled(mut self, now: DateTime<Utc>) -> Self {
        if now - self.hourly_window_start > hourly_window() {
            self.hourly_count = 0;
            self.hourly_window_start = now;
        }
        if now - self.daily_window_start > daily_window() {
            self.daily_count = 0;
            self.daily_window_start = now;
        }
        self
    }

    /// Roll windows, then count one executed handoff in both.
    pub fn incremented(self, now: DateTime<Utc>) -> Self {
        let mut counters = self.rolled(now);
        counters.hourly_count += 1;
        counters.daily_count += 1;
        counters
    }
}

/// Enforces the hourly and daily handoff budgets
pub struct RateLimiter {
    store: Arc<dyn HandoffStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn HandoffStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Whether the next handoff would exceed either budget.
    ///
    /// Read-only; rolled windows are not written back here.
    pub async fn is_blocked(&self, conversation_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let counters = match self.store.counters(conversation_id).await? {
            Some(c) => c.rolled(now),
            None => return Ok(false),
        };
        let blocked = counters.hourly_count >= self.config.hourly_limit
            || counters.daily_count >= self.config.daily_limit;
        if blocked {
            debug!(
                conversation_id,
                hourly = counters.hourly_count,
                daily = counters.daily_count,
                "handoff budget exhausted"
            );
        }
        Ok(blocked)
    }

    /// Count one executed handoff against both budgets.
    pub async fn increment(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateCounters> {
        let counters = self
            .store
            .counters(conversation_id)
            .await?
            .unwrap_or_else(|| RateCounters::fresh(now))
            .incremented(now);
        self.store.save_counters(conversation_id, &counters).await?;
        Ok(counters)
    }
}
