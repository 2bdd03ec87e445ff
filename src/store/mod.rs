//! Storage for handoff state
//!
//! The [`HandoffStore`] trait covers everything the evaluator persists:
//! the audit trail of attempts, conversation ownership, rate counters, and
//! adaptive threshold profiles. [`InMemoryHandoffStore`] is the
//! single-process implementation; [`sqlite::SqliteHandoffStore`] persists
//! across restarts and can be shared between processes.

pub mod sqlite;

use crate::candidate::{AgentRole, AttemptDecision, HandoffAttempt};
use crate::error::Result;
use crate::rate_limit::RateCounters;
use crate::threshold::ThresholdProfile;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Persistence interface for handoff state
#[async_trait]
pub trait HandoffStore: Send + Sync {
    /// Append one attempt to the audit trail
    async fn append_attempt(&self, attempt: &HandoffAttempt) -> Result<()>;

    /// Full recorded history for a conversation, oldest first
    async fn attempts(&self, conversation_id: &str) -> Result<Vec<HandoffAttempt>>;

    /// Executed attempts strictly after `since`, oldest first.
    /// An attempt exactly at `since` has aged out.
    async fn executed_since(
        &self,
        conversation_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HandoffAttempt>>;

    /// Current conversation owner, if one was ever recorded
    async fn current_owner(&self, conversation_id: &str) -> Result<Option<AgentRole>>;

    /// Record a new conversation owner
    async fn set_owner(&self, conversation_id: &str, owner: AgentRole) -> Result<()>;

    /// Rate counters for a conversation, if any handoff was ever counted
    async fn counters(&self, conversation_id: &str) -> Result<Option<RateCounters>>;

    /// Persist updated rate counters
    async fn save_counters(&self, conversation_id: &str, counters: &RateCounters) -> Result<()>;

    /// All persisted threshold profiles
    async fn profiles(&self) -> Result<Vec<ThresholdProfile>>;

    /// Persist one threshold profile
    async fn save_profile(&self, profile: &ThresholdProfile) -> Result<()>;
}

#[derive(Debug, Default)]
struct ConversationState {
    owner: Option<AgentRole>,
    attempts: Vec<HandoffAttempt>,
    counters: Option<RateCounters>,
}

/// In-process store backed by per-conversation append logs.
///
/// Attempt logs are pruned on every append: entries older than the
/// retention horizon are dropped from the front of the log, so a
/// long-lived conversation cannot grow without bound. Appends are assumed
/// to arrive in chronological order, which holds for everything the
/// evaluator writes.
pub struct InMemoryHandoffStore {
    conversations: Mutex<HashMap<String, ConversationState>>,
    profiles: Mutex<HashMap<String, ThresholdProfile>>,
    retention: Duration,
}

impl InMemoryHandoffStore {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
            profiles: Mutex::new(HashMap::new()),
            retention: Duration::hours(24),
        }
    }

    /// Override the attempt retention horizon.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Number of retained attempts for a conversation. Test hook.
    pub fn retained_attempts(&self, conversation_id: &str) -> usize {
        let conversations = self.conversations.lock().unwrap();
        conversations
            .get(conversation_id)
            .map(|s| s.attempts.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryHandoffStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HandoffStore for InMemoryHandoffStore {
    async fn append_attempt(&self, attempt: &HandoffAttempt) -> Result<()> {
        let mut conversations = self.conversations.lock().unwrap();
        let state = conversations
            .entry(attempt.conversation_id.clone())
            .or_default();

        // Drop the aged prefix before appending. The log stays sorted by
        // arrival, so one partition point bounds the stale region.
        let cutoff = attempt.created_at - self.retention;
        let keep_from = state
            .attempts
            .partition_point(|a| a.created_at < cutoff);
        if keep_from > 0 {
            state.attempts.drain(..keep_from);
        }

        state.attempts.push(attempt.clone());
        Ok(())
    }

    async fn attempts(&self, conversation_id: &str) -> Result<Vec<HandoffAttempt>> {
        let conversations = self.conversations.lock().unwrap();
        Ok(conversations
            .get(conversation_id)
            .map(|s| s.attempts.clone())
            .unwrap_or_default())
    }

    async fn executed_since(
        &self,
        conversation_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HandoffAttempt>> {
        let conversations = self.conversations.lock().unwrap();
        Ok(conversations
            .get(conversation_id)
            .map(|s| {
                s.attempts
                    .iter()
                    .filter(|a| {
                        a.decision == AttemptDecision::Executed && a.created_at > since
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn current_owner(&self, conversation_id: &str) -> Result<Option<AgentRole>> {
        let conversations = self.conversations.lock().unwrap();
        Ok(conversations
            .get(conversation_id)
            .and_then(|s| s.owner))
    }

    async fn set_owner(&self, conversation_id: &str, owner: AgentRole) -> Result<()> {
        let mut conversations = self.conversations.lock().unwrap();
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .owner = Some(owner);
        Ok(())
    }

    async fn counters(&self, conversation_id: &str) -> Result<Option<RateCounters>> {
        let conversations = self.conversations.lock().unwrap();
        Ok(conversations
            .get(conversation_id)
            .and_then(|s| s.counters.clone()))
    }

    async fn save_counters(&self, conversation_id: &str, counters: &RateCounters) -> Result<()> {
        let mut conversations = self.conversations.lock().unwrap();
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .counters = Some(counters.clone());
        Ok(())
    }

    async fn profiles(&self) -> Result<Vec<ThresholdProfile>> {
        let profiles = self.profiles.lock().unwrap();
        Ok(profiles.values().cloned().collect())
    }

    async fn save_profile(&self, profile: &ThresholdProfile) -> Result<()> {
        let mut profiles = self.profiles.lock().unwrap();
        profiles.insert(profile.direction.to_string(), profile.clone());
        Ok(())
    }
}
