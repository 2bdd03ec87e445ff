//! Handoff evaluation pipeline
//!
//! [`HandoffEvaluator`] answers one question: should this conversation
//! change hands right now? Checks run cheapest-first and stop at the
//! first failure:
//!
//! 1. structural validation (the only path that returns an error)
//! 2. confidence against the direction's current threshold
//! 3. circular window: has this exact direction executed recently?
//! 4. rate budgets: hourly and daily caps for the conversation
//! 5. conversation lock acquisition with bounded retries
//! 6. ownership re-check under the lock, so a stale evaluation cannot
//!    clobber a transfer that raced ahead of it
//! 7. commit: new owner, audit record, budget consumption, release
//!
//! Every outcome, executed or blocked, writes exactly one audit record.
//! Store failures inside the gates degrade to warnings rather than
//! propagating; the conversation always gets an answer about who owns
//! it next.
//!
//! The evaluator is also a [`tower::Service`] over
//! [`HandoffCandidate`], so tracing, metrics, and timeout layers stack
//! on top of it like on any other service.

use crate::audit::AuditLogger;
use crate::candidate::{
    BlockReason, Direction, HandoffAttempt, HandoffCandidate, HandoffDecision,
};
use crate::config::HandoffConfig;
use crate::error::Result;
use crate::events::HandoffEvent;
use crate::guard::CircularGuard;
use crate::lock::{LockManager, LockStore};
use crate::rate_limit::RateLimiter;
use crate::store::HandoffStore;
use crate::threshold::{ThresholdAdapter, ThresholdReading};
use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::{BoxError, Service};
use tracing::{debug, info, instrument, warn};

/// Decides whether and when conversation ownership transfers between
/// agents. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct HandoffEvaluator {
    store: Arc<dyn HandoffStore>,
    thresholds: Arc<ThresholdAdapter>,
    guard: Arc<CircularGuard>,
    limiter: Arc<RateLimiter>,
    locks: Arc<LockManager>,
    audit: AuditLogger,
    event_sink: Option<mpsc::UnboundedSender<HandoffEvent>>,
}

impl HandoffEvaluator {
    pub fn builder(store: Arc<dyn HandoffStore>) -> EvaluatorBuilder {
        EvaluatorBuilder::new(store)
    }

    /// Evaluate one candidate.
    ///
    /// Errors only on a malformed candidate; every other condition
    /// resolves to a well-formed decision.
    pub async fn evaluate(&self, candidate: HandoffCandidate) -> Result<HandoffDecision> {
        candidate.validate()?;

        let direction = candidate.direction();
        let now = Utc::now();
        info!(
            "🚀 Evaluating handoff: {} for conversation {} (confidence {:.2})",
            direction, candidate.conversation_id, candidate.confidence
        );

        let reading = self.thresholds.read(direction);
        if candidate.confidence < reading.value {
            info!(
                "❌ Below threshold: {:.2} < {:.2} ({} samples)",
                candidate.confidence, reading.value, reading.samples
            );
            return Ok(self
                .finish_blocked(&candidate, reading, BlockReason::BelowThreshold)
                .await);
        }

        match self
            .guard
            .is_blocked(&candidate.conversation_id, direction, now)
            .await
        {
            Ok(true) => {
                info!("🔄 Circular window: {} executed too recently", direction);
                return Ok(self
                    .finish_blocked(&candidate, reading, BlockReason::CircularWindow)
                    .await);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "history read failed, circular check skipped");
            }
        }

        match self
            .limiter
            .is_blocked(&candidate.conversation_id, now)
            .await
        {
            Ok(true) => {
                info!(
                    "🚦 Rate limited: conversation {} is out of handoff budget",
                    candidate.conversation_id
                );
                return Ok(self
                    .finish_blocked(&candidate, reading, BlockReason::RateLimited)
                    .await);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "counter read failed, rate check skipped");
            }
        }

        let mut lock = match self.locks.acquire(&candidate.conversation_id).await {
            Ok(lock) => lock,
            Err(e) => {
                info!("🔗 Lock unavailable: {}", e);
                return Ok(self
                    .finish_blocked(&candidate, reading, BlockReason::LockUnavailable)
                    .await);
            }
        };

        // Under the lock from here on. Re-check ownership: a concurrent
        // evaluation may have committed while this one waited.
        let owner = match self.store.current_owner(&candidate.conversation_id).await {
            Ok(owner) => owner,
            Err(e) => {
                warn!(error = %e, "owner read failed, treating conversation as fresh");
                None
            }
        };
        match owner {
            Some(current) if current != candidate.source_role => {
                info!(
                    "📍 Stale ownership: {} owns conversation {}, candidate came from {}",
                    current, candidate.conversation_id, candidate.source_role
                );
                let decision = self
                    .finish_blocked(&candidate, reading, BlockReason::StaleOwnership)
                    .await;
                self.locks.release(lock).await;
                return Ok(decision);
            }
            Some(_) => {}
            None => {
                debug!(
                    "no recorded owner for conversation {}, adopting {}",
                    candidate.conversation_id, candidate.source_role
                );
            }
        }

        // Commit. Renew the lease first if the gates consumed too much
        // of it.
        if let Err(e) = self.locks.renew_if_stale(&mut lock).await {
            warn!(error = %e, "lease renewal failed before commit");
        }

        if let Err(e) = self
            .store
            .set_owner(&candidate.conversation_id, candidate.target_role)
            .await
        {
            // The transfer did not happen. Infrastructure failures inside
            // the critical section surface like a failed lock, keeping
            // policy reasons unambiguous.
            warn!(error = %e, "ownership write failed, handoff aborted");
            let decision = self
                .finish_blocked(&candidate, reading, BlockReason::LockUnavailable)
                .await;
            self.locks.release(lock).await;
            return Ok(decision);
        }

        self.audit
            .record(HandoffAttempt::executed(&candidate, reading.value))
            .await;
        if let Err(e) = self
            .limiter
            .increment(&candidate.conversation_id, now)
            .await
        {
            warn!(error = %e, "budget increment failed after commit");
        }
        self.locks.release(lock).await;

        let decision = HandoffDecision::executed(&candidate, reading.value);
        self.emit_event(&candidate, &decision);
        info!(
            "✅ Handoff executed: {} now owns conversation {}",
            candidate.target_role, candidate.conversation_id
        );
        Ok(decision)
    }

    /// Report a settled outcome for an executed transfer; feeds
    /// threshold adaptation.
    pub async fn record_outcome(
        &self,
        direction: Direction,
        success: bool,
    ) -> Result<ThresholdReading> {
        self.thresholds.record_outcome(direction, success).await
    }

    /// Current threshold for a direction, with its sample count
    pub fn threshold(&self, direction: Direction) -> ThresholdReading {
        self.thresholds.read(direction)
    }

    /// Recorded audit trail for a conversation, oldest first
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<HandoffAttempt>> {
        self.store.attempts(conversation_id).await
    }

    async fn finish_blocked(
        &self,
        candidate: &HandoffCandidate,
        reading: ThresholdReading,
        reason: BlockReason,
    ) -> HandoffDecision {
        self.audit
            .record(HandoffAttempt::blocked(candidate, reading.value, reason))
            .await;
        HandoffDecision::blocked(candidate, reading.value, reason)
    }

    fn emit_event(&self, candidate: &HandoffCandidate, decision: &HandoffDecision) {
        let Some(sink) = &self.event_sink else {
            return;
        };
        if let Some(event) = HandoffEvent::for_transfer(candidate, decision) {
            match event.payload() {
                Ok(payload) => debug!(%payload, "transfer event queued"),
                Err(err) => warn!(error = %err, "transfer event payload not encodable"),
            }
            if sink.send(event).is_err() {
                debug!("event consumer dropped, transfer event discarded");
            }
        }
    }
}

impl Service<HandoffCandidate> for HandoffEvaluator {
    type Response = HandoffDecision;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    #[instrument(skip_all, fields(evaluation_id = %uuid::Uuid::new_v4()))]
    fn call(&mut self, candidate: HandoffCandidate) -> Self::Future {
        let evaluator = self.clone();
        Box::pin(async move { evaluator.evaluate(candidate).await.map_err(Into::into) })
    }
}

/// Assembles a [`HandoffEvaluator`] from a store, optional shared lock
/// store, and configuration.
pub struct EvaluatorBuilder {
    store: Arc<dyn HandoffStore>,
    lock_store: Option<Arc<dyn LockStore>>,
    config: HandoffConfig,
    event_sink: Option<mpsc::UnboundedSender<HandoffEvent>>,
}

impl EvaluatorBuilder {
    pub fn new(store: Arc<dyn HandoffStore>) -> Self {
        Self {
            store,
            lock_store: None,
            config: HandoffConfig::default(),
            event_sink: None,
        }
    }

    pub fn config(mut self, config: HandoffConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared lock store for multi-instance deployments. Without one,
    /// locking is in-process only.
    pub fn lock_store(mut self, lock_store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(lock_store);
        self
    }

    /// Receiver for executed-transfer events (CRM tagging, notifications)
    pub fn event_sink(mut self, sink: mpsc::UnboundedSender<HandoffEvent>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Validate configuration, hydrate persisted threshold profiles, and
    /// assemble the evaluator.
    pub async fn build(self) -> Result<HandoffEvaluator> {
        self.config.thresholds.validate()?;

        let thresholds = Arc::new(ThresholdAdapter::with_store(
            self.config.thresholds.clone(),
            self.store.clone(),
        ));
        thresholds.hydrate().await?;

        let locks = Arc::new(LockManager::new(self.lock_store, self.config.lock.clone()));
        info!(
            distributed_locking = locks.is_distributed(),
            "handoff evaluator ready"
        );

        Ok(HandoffEvaluator {
            guard: Arc::new(CircularGuard::new(self.store.clone(), &self.config.circular)),
            limiter: Arc::new(RateLimiter::new(
                self.store.clone(),
                self.config.rate_limits.clone(),
            )),
            locks,
            audit: AuditLogger::new(self.store.clone(), self.config.audit.clone()),
            thresholds,
            event_sink: self.event_sink,
            store: self.store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{AgentRole, AttemptDecision};
    use crate::store::InMemoryHandoffStore;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    async fn evaluator() -> (HandoffEvaluator, Arc<InMemoryHandoffStore>) {
        let store = Arc::new(InMemoryHandoffStore::new());
        let evaluator = HandoffEvaluator::builder(store.clone())
            .build()
            .await
            .unwrap();
        (evaluator, store)
    }

    fn intake_to_buyer(confidence: f64) -> HandoffCandidate {
        HandoffCandidate::new(
            "conv-1",
            AgentRole::Intake,
            AgentRole::BuyerSpecialist,
            confidence,
        )
    }

    #[tokio::test]
    async fn test_confident_candidate_executes_and_transfers_ownership() {
        let (evaluator, store) = evaluator().await;

        let decision = evaluator.evaluate(intake_to_buyer(0.82)).await.unwrap();
        assert!(decision.executed);
        assert_eq!(decision.new_owner, Some(AgentRole::BuyerSpecialist));
        assert_eq!(decision.reason(), "executed");
        assert_eq!(decision.threshold_used, 0.70);
        assert_eq!(
            store.current_owner("conv-1").await.unwrap(),
            Some(AgentRole::BuyerSpecialist)
        );

        let history = evaluator.history("conv-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision, AttemptDecision::Executed);
    }

    #[tokio::test]
    async fn test_below_threshold_blocks_without_touching_ownership() {
        let (evaluator, store) = evaluator().await;

        let decision = evaluator.evaluate(intake_to_buyer(0.69)).await.unwrap();
        assert!(!decision.executed);
        assert_eq!(decision.reason(), "below_threshold");
        assert_eq!(decision.new_owner, None);
        assert_eq!(store.current_owner("conv-1").await.unwrap(), None);

        // Blocked branches still leave exactly one audit record.
        let history = evaluator.history("conv-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].block_reason, Some(BlockReason::BelowThreshold));
    }

    #[tokio::test]
    async fn test_reverse_direction_is_a_different_edge() {
        let (evaluator, _) = evaluator().await;

        let first = evaluator.evaluate(intake_to_buyer(0.82)).await.unwrap();
        assert!(first.executed);

        // Five minutes later in spirit: the reverse pair is not the same
        // direction, so the circular guard lets it through.
        let back = HandoffCandidate::new(
            "conv-1",
            AgentRole::BuyerSpecialist,
            AgentRole::Intake,
            0.75,
        );
        let second = evaluator.evaluate(back).await.unwrap();
        assert!(second.executed);
        assert_eq!(second.new_owner, Some(AgentRole::Intake));
    }

    #[tokio::test]
    async fn test_repeat_direction_blocked_by_circular_window() {
        let (evaluator, _) = evaluator().await;

        assert!(evaluator.evaluate(intake_to_buyer(0.82)).await.unwrap().executed);

        // Ownership moved to the buyer specialist, so replaying the same
        // edge is both stale and circular; the circular gate fires first.
        let repeat = evaluator.evaluate(intake_to_buyer(0.9)).await.unwrap();
        assert!(!repeat.executed);
        assert_eq!(repeat.reason(), "circular_window");
    }

    #[tokio::test]
    async fn test_stale_source_is_blocked_under_lock() {
        let (evaluator, store) = evaluator().await;
        store
            .set_owner("conv-1", AgentRole::SellerSpecialist)
            .await
            .unwrap();

        let decision = evaluator.evaluate(intake_to_buyer(0.9)).await.unwrap();
        assert!(!decision.executed);
        assert_eq!(decision.reason(), "stale_ownership");
    }

    #[tokio::test]
    async fn test_malformed_candidate_is_the_only_error_path() {
        let (evaluator, _) = evaluator().await;

        let bad = HandoffCandidate::new("conv-1", AgentRole::Intake, AgentRole::Intake, 0.9);
        assert!(evaluator.evaluate(bad).await.is_err());

        // Nothing was recorded for the rejected candidate.
        assert_eq!(evaluator.history("conv-1").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_event_sink_sees_executed_transfers_only() {
        let store = Arc::new(InMemoryHandoffStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let evaluator = HandoffEvaluator::builder(store)
            .event_sink(tx)
            .build()
            .await
            .unwrap();

        evaluator.evaluate(intake_to_buyer(0.5)).await.unwrap();
        evaluator.evaluate(intake_to_buyer(0.82)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.conversation_id, "conv-1");
        assert_eq!(event.target_role, AgentRole::BuyerSpecialist);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_evaluator_composes_as_a_tower_service() {
        let (evaluator, _) = evaluator().await;

        let decision = evaluator
            .clone()
            .oneshot(intake_to_buyer(0.82))
            .await
            .unwrap();
        assert!(decision.executed);

        let err = evaluator
            .oneshot(HandoffCandidate::new(
                "",
                AgentRole::Intake,
                AgentRole::BuyerSpecialist,
                0.9,
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid candidate"));
    }
}
