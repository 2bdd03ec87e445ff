//! Circular handoff prevention

use crate::candidate::Direction;
use crate::config::CircularGuardConfig;
use crate::error::Result;
use crate::store::HandoffStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

/// Blocks a handoff when the identical direction already executed
/// recently for the same conversation.
///
/// Only the exact ordered pair is blocked. The reverse direction and
/// transfers to a third role stay eligible, so a conversation can still
/// be re-routed; it just cannot replay the same edge until the window
/// has passed.
pub struct CircularGuard {
    store: Arc<dyn HandoffStore>,
    window: Duration,
}

impl CircularGuard {
    pub fn new(store: Arc<dyn HandoffStore>, config: &CircularGuardConfig) -> Self {
        Self {
            store,
            window: Duration::milliseconds(config.window.as_millis() as i64),
        }
    }

    pub async fn is_blocked(
        &self,
        conversation_id: &str,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let since = now - self.window;
        let executed = self.store.executed_since(conversation_id, since).await?;
        let blocked = executed.iter().any(|a| a.direction() == direction);
        if blocked {
            debug!(
                conversation_id,
                direction = %direction,
                "direction already executed inside the circular window"
            );
        }
        Ok(blocked)
    }
}
