//! Conversation locking
//!
//! A handoff commit mutates ownership, counters, and the audit trail, so
//! the evaluator serializes commits per conversation behind a leased lock.
//! [`LockStore`] is the acquisition interface: the SQLite store arbitrates
//! between processes, while [`InProcessLockStore`] only serializes tasks in
//! one process. [`LockManager`] prefers the shared store and degrades to
//! the in-process one when the shared store is unreachable.
//!
//! Leases expire on their own. A crashed holder never wedges a
//! conversation for longer than the TTL.

use crate::config::LockConfig;
use crate::error::{HandoffError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay schedule for retry loops
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f32,
    pub max: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            factor: 1.0,
            max: delay,
        }
    }

    pub fn exponential(initial: Duration, factor: f32, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mult = self.factor.powi(attempt as i32);
        let d = self.initial.mul_f32(mult);
        if d > self.max {
            self.max
        } else {
            d
        }
    }
}

/// Leased, token-fenced lock acquisition.
///
/// All operations are compare-and-set on the holder token, so a stale
/// holder can never release or renew a lease it already lost.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lock if it is free or its lease has expired. Returns true
    /// when `token` holds the lock afterwards.
    async fn try_acquire(
        &self,
        conversation_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Extend the lease. Returns false if `token` no longer holds the lock.
    async fn renew(
        &self,
        conversation_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the lease. Returns false if `token` no longer holds the lock.
    async fn release(&self, conversation_id: &str, token: &str) -> Result<bool>;

    /// Whether this store arbitrates between processes
    fn is_shared(&self) -> bool;
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Process-local lock table.
///
/// Serializes tasks inside one process only. Multiple orchestrator
/// instances using this store can still race each other, which is why the
/// manager logs loudly whenever it has to fall back here.
#[derive(Default)]
pub struct InProcessLockStore {
    leases: Mutex<HashMap<String, LeaseEntry>>,
}

impl InProcessLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InProcessLockStore {
    async fn try_acquire(
        &self,
        conversation_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(conversation_id) {
            Some(entry) if entry.expires_at > now && entry.token != token => Ok(false),
            _ => {
                leases.insert(
                    conversation_id.to_string(),
                    LeaseEntry {
                        token: token.to_string(),
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(
        &self,
        conversation_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get_mut(conversation_id) {
            Some(entry) if entry.token == token => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, conversation_id: &str, token: &str) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(conversation_id) {
            Some(entry) if entry.token == token => {
                leases.remove(conversation_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_shared(&self) -> bool {
        false
    }
}

/// A held lease, returned by [`LockManager::acquire`].
///
/// Release is explicit; an unreleased guard simply expires with its TTL.
#[derive(Debug)]
pub struct LockGuard {
    pub conversation_id: String,
    token: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    via_fallback: bool,
}

impl LockGuard {
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True when the lease lives in the in-process fallback store
    pub fn is_fallback(&self) -> bool {
        self.via_fallback
    }
}

/// Acquires and tracks conversation leases across a preferred shared
/// store and the in-process fallback.
pub struct LockManager {
    primary: Option<Arc<dyn LockStore>>,
    fallback: Arc<InProcessLockStore>,
    config: LockConfig,
    degraded: AtomicBool,
}

impl LockManager {
    pub fn new(primary: Option<Arc<dyn LockStore>>, config: LockConfig) -> Self {
        Self {
            primary,
            fallback: Arc::new(InProcessLockStore::new()),
            config,
            degraded: AtomicBool::new(false),
        }
    }

    /// Manager with no shared store at all. Single-instance deployments.
    pub fn in_process(config: LockConfig) -> Self {
        Self::new(None, config)
    }

    /// Whether the preferred store coordinates across processes
    pub fn is_distributed(&self) -> bool {
        self.primary.as_ref().map(|p| p.is_shared()).unwrap_or(false)
    }

    /// True after the most recent acquisition had to use the fallback
    /// because the shared store was unreachable
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.config.ttl.as_millis() as i64)
    }

    /// Acquire the lease for a conversation, retrying with exponential
    /// backoff. Fails with [`HandoffError::LockUnavailable`] once the
    /// attempt budget is spent.
    pub async fn acquire(&self, conversation_id: &str) -> Result<LockGuard> {
        let token = Uuid::new_v4().to_string();
        let backoff = Backoff::exponential(
            self.config.backoff_base,
            2.0,
            self.config.backoff_max,
        );

        for attempt in 0..self.config.max_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(backoff.delay_for_attempt(attempt - 1)).await;
            }
            match self.try_once(conversation_id, &token).await {
                Ok(Some(guard)) => {
                    debug!(
                        conversation_id,
                        attempt,
                        fallback = guard.via_fallback,
                        "conversation lock acquired"
                    );
                    return Ok(guard);
                }
                Ok(None) => {
                    debug!(conversation_id, attempt, "conversation lock contended");
                }
                Err(e) => return Err(e),
            }
        }

        Err(HandoffError::LockUnavailable {
            conversation_id: conversation_id.to_string(),
            attempts: self.config.max_attempts.max(1),
        })
    }

    /// One acquisition pass: shared store first, fallback on store errors.
    async fn try_once(&self, conversation_id: &str, token: &str) -> Result<Option<LockGuard>> {
        let now = Utc::now();
        let expires_at = now + self.lease_duration();

        if let Some(primary) = &self.primary {
            match primary.try_acquire(conversation_id, token, expires_at, now).await {
                Ok(acquired) => {
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        info!("shared lock store reachable again");
                    }
                    return Ok(acquired.then(|| LockGuard {
                        conversation_id: conversation_id.to_string(),
                        token: token.to_string(),
                        acquired_at: now,
                        expires_at,
                        via_fallback: false,
                    }));
                }
                Err(e) => {
                    if !self.degraded.swap(true, Ordering::Relaxed) {
                        warn!(
                            error = %e,
                            "shared lock store unreachable, degrading to in-process locking; \
                             cross-instance handoff races are possible until it recovers"
                        );
                    }
                }
            }
        }

        let acquired = self
            .fallback
            .try_acquire(conversation_id, token, expires_at, now)
            .await?;
        Ok(acquired.then(|| LockGuard {
            conversation_id: conversation_id.to_string(),
            token: token.to_string(),
            acquired_at: now,
            expires_at,
            via_fallback: true,
        }))
    }

    /// Renew the lease once more than half the TTL has elapsed.
    ///
    /// Returns true if the lease is still healthy afterwards (renewed or
    /// not yet stale). A lost lease is logged and reported as false; the
    /// caller's ownership re-check is what actually protects the commit.
    pub async fn renew_if_stale(&self, guard: &mut LockGuard) -> Result<bool> {
        let now = Utc::now();
        let half_ttl = self.lease_duration() / 2;
        if now - guard.acquired_at < half_ttl {
            return Ok(true);
        }

        let expires_at = now + self.lease_duration();
        let renewed = self
            .store_for(guard)
            .renew(&guard.conversation_id, &guard.token, expires_at)
            .await?;
        if renewed {
            guard.expires_at = expires_at;
            debug!(conversation_id = %guard.conversation_id, "conversation lease renewed");
        } else {
            warn!(
                conversation_id = %guard.conversation_id,
                "conversation lease lost before renewal"
            );
        }
        Ok(renewed)
    }

    /// Drop the lease. Failures are logged, never surfaced; an unreleased
    /// lease expires with its TTL anyway.
    pub async fn release(&self, guard: LockGuard) {
        let store = self.store_for(&guard);
        match store.release(&guard.conversation_id, &guard.token).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    conversation_id = %guard.conversation_id,
                    "conversation lease already expired at release"
                );
            }
            Err(e) => {
                warn!(
                    conversation_id = %guard.conversation_id,
                    error = %e,
                    "failed to release conversation lease; it will expire on its own"
                );
            }
        }
    }

    fn store_for(&self, guard: &LockGuard) -> Arc<dyn LockStore> {
        if guard.via_fallback {
            self.fallback.clone() as Arc<dyn LockStore>
        } else {
            self.primary
                .clone()
                .unwrap_or_else(|| self.fallback.clone() as Arc<dyn LockStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fast_config() -> LockConfig {
        LockConfig {
            ttl: Duration::from_millis(200),
            max_attempts: 2,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        }
    }

    /// Lock store that always fails, standing in for an unreachable
    /// shared backend.
    struct UnreachableLockStore;

    #[async_trait]
    impl LockStore for UnreachableLockStore {
        async fn try_acquire(
            &self,
            _conversation_id: &str,
            _token: &str,
            _expires_at: DateTime<Utc>,
            _now: DateTime<Utc>,
        ) -> Result<bool> {
            Err(HandoffError::Backend("connection refused".to_string()))
        }

        async fn renew(
            &self,
            _conversation_id: &str,
            _token: &str,
            _expires_at: DateTime<Utc>,
        ) -> Result<bool> {
            Err(HandoffError::Backend("connection refused".to_string()))
        }

        async fn release(&self, _conversation_id: &str, _token: &str) -> Result<bool> {
            Err(HandoffError::Backend("connection refused".to_string()))
        }

        fn is_shared(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_backoff_delays_double_and_cap() {
        let backoff = Backoff::exponential(
            Duration::from_millis(20),
            2.0,
            Duration::from_millis(50),
        );
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(20));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(40));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(50));

        let fixed = Backoff::fixed(Duration::from_millis(10));
        assert_eq!(fixed.delay_for_attempt(5), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_acquire_and_release_round_trip() {
        let manager = LockManager::in_process(fast_config());
        let guard = manager.acquire("conv-1").await.unwrap();
        assert!(guard.is_fallback());
        manager.release(guard).await;

        // Released lease can be taken again immediately.
        let guard = manager.acquire("conv-1").await.unwrap();
        manager.release(guard).await;
    }

    #[tokio::test]
    async fn test_contended_lock_exhausts_attempts() {
        let manager = LockManager::in_process(fast_config());
        let held = manager.acquire("conv-1").await.unwrap();

        let err = manager.acquire("conv-1").await.unwrap_err();
        match err {
            HandoffError::LockUnavailable {
                conversation_id,
                attempts,
            } => {
                assert_eq!(conversation_id, "conv-1");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        manager.release(held).await;
    }

    #[tokio::test]
    async fn test_locks_are_per_conversation() {
        let manager = LockManager::in_process(fast_config());
        let a = manager.acquire("conv-a").await.unwrap();
        let b = manager.acquire("conv-b").await.unwrap();
        manager.release(a).await;
        manager.release(b).await;
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = InProcessLockStore::new();
        let now = Utc::now();
        let past = now - chrono::Duration::seconds(1);

        assert!(store
            .try_acquire("conv-1", "holder-a", past, now - chrono::Duration::seconds(2))
            .await
            .unwrap());
        // holder-a's lease expired one second ago
        assert!(store
            .try_acquire("conv-1", "holder-b", now + chrono::Duration::seconds(5), now)
            .await
            .unwrap());
        assert!(!store.release("conv-1", "holder-a").await.unwrap());
        assert!(store.release("conv-1", "holder-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_primary_degrades_to_fallback() {
        let manager = LockManager::new(Some(Arc::new(UnreachableLockStore)), fast_config());
        assert!(manager.is_distributed());
        assert!(!manager.is_degraded());

        let guard = manager.acquire("conv-1").await.unwrap();
        assert!(guard.is_fallback());
        assert!(manager.is_degraded());

        // Fallback still serializes within the process.
        assert!(manager.acquire("conv-1").await.is_err());
        manager.release(guard).await;
    }

    #[tokio::test]
    async fn test_renew_extends_only_after_half_ttl() {
        let config = LockConfig {
            ttl: Duration::from_millis(60),
            ..fast_config()
        };
        let manager = LockManager::in_process(config);
        let mut guard = manager.acquire("conv-1").await.unwrap();
        let original_expiry = guard.expires_at();

        // Fresh lease: renewal is a no-op.
        assert!(manager.renew_if_stale(&mut guard).await.unwrap());
        assert_eq!(guard.expires_at(), original_expiry);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(manager.renew_if_stale(&mut guard).await.unwrap());
        assert!(guard.expires_at() > original_expiry);

        manager.release(guard).await;
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_is_rejected() {
        let store = InProcessLockStore::new();
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(5);

        assert!(store.try_acquire("conv-1", "holder-a", expires, now).await.unwrap());
        assert!(!store.release("conv-1", "imposter").await.unwrap());
        assert!(!store.renew("conv-1", "imposter", expires).await.unwrap());
        assert!(store.release("conv-1", "holder-a").await.unwrap());
    }
}
