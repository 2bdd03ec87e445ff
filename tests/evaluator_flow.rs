//! # Integration Tests for the Handoff Evaluator
//!
//! These tests drive full evaluations through the public API, exercising the
//! threshold gate, the circular-prevention guard, the rate limiter, ownership
//! commits, and audit persistence together. Both the in-memory store and the
//! SQLite store are covered so that behavior stays identical across backends.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use tower_handoff::candidate::{
    AgentRole, AttemptDecision, BlockReason, Direction, HandoffCandidate,
};
use tower_handoff::config::ConfigBuilder;
use tower_handoff::evaluator::EvaluatorBuilder;
use tower_handoff::observability::{InMemoryCollector, MetricsLayer, TracingLayer};
use tower_handoff::rate_limit::RateCounters;
use tower_handoff::store::sqlite::SqliteHandoffStore;
use tower_handoff::store::{HandoffStore, InMemoryHandoffStore};
use tower_handoff::{Layer, Service, ServiceExt};

fn candidate(
    conversation: &str,
    source: AgentRole,
    target: AgentRole,
    confidence: f64,
) -> HandoffCandidate {
    HandoffCandidate::new(conversation, source, target, confidence)
}

#[tokio::test]
async fn test_full_lifecycle_over_sqlite() {
    let store = Arc::new(
        SqliteHandoffStore::new_in_memory()
            .await
            .expect("in-memory sqlite should open"),
    );

    let evaluator = EvaluatorBuilder::new(store.clone() as Arc<dyn HandoffStore>)
        .lock_store(store.clone())
        .build()
        .await
        .expect("evaluator should build");

    // Qualified lead moves from intake to the buyer specialist.
    let decision = evaluator
        .evaluate(candidate("conv-1", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.82))
        .await
        .expect("evaluation should succeed");
    assert!(decision.executed);
    assert_eq!(decision.new_owner, Some(AgentRole::BuyerSpecialist));
    assert_eq!(
        store.current_owner("conv-1").await.expect("owner read"),
        Some(AgentRole::BuyerSpecialist)
    );

    // The buyer specialist can send the conversation back: the reverse
    // direction is a different edge, so the circular guard stays quiet.
    let back = evaluator
        .evaluate(candidate("conv-1", AgentRole::BuyerSpecialist, AgentRole::Intake, 0.9))
        .await
        .expect("evaluation should succeed");
    assert!(back.executed);
    assert_eq!(back.new_owner, Some(AgentRole::Intake));

    // Re-running the original direction inside the window is circular.
    let repeat = evaluator
        .evaluate(candidate("conv-1", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.9))
        .await
        .expect("evaluation should succeed");
    assert!(!repeat.executed);
    assert_eq!(repeat.block_reason, Some(BlockReason::CircularWindow));
    assert_eq!(repeat.new_owner, None);

    // Ownership is untouched by the blocked attempt.
    assert_eq!(
        store.current_owner("conv-1").await.expect("owner read"),
        Some(AgentRole::Intake)
    );

    // Every evaluation past validation left exactly one audit record.
    let attempts = store.attempts("conv-1").await.expect("attempts read");
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].decision, AttemptDecision::Executed);
    assert_eq!(attempts[1].decision, AttemptDecision::Executed);
    assert_eq!(attempts[2].decision, AttemptDecision::Blocked);
    assert_eq!(attempts[2].block_reason, Some(BlockReason::CircularWindow));
}

#[tokio::test]
async fn test_same_direction_becomes_eligible_after_window() {
    let config = ConfigBuilder::new()
        .circular_window(Duration::from_millis(100))
        .build();
    let store = Arc::new(InMemoryHandoffStore::new());
    let evaluator = EvaluatorBuilder::new(store.clone() as Arc<dyn HandoffStore>)
        .config(config)
        .build()
        .await
        .expect("evaluator should build");

    let first = evaluator
        .evaluate(candidate("conv-window", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.8))
        .await
        .expect("evaluation should succeed");
    assert!(first.executed);

    // Bounce back so ownership allows a second intake-sourced attempt.
    let back = evaluator
        .evaluate(candidate("conv-window", AgentRole::BuyerSpecialist, AgentRole::Intake, 0.8))
        .await
        .expect("evaluation should succeed");
    assert!(back.executed);

    let blocked = evaluator
        .evaluate(candidate("conv-window", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.8))
        .await
        .expect("evaluation should succeed");
    assert_eq!(blocked.block_reason, Some(BlockReason::CircularWindow));

    tokio::time::sleep(Duration::from_millis(150)).await;

    let retried = evaluator
        .evaluate(candidate("conv-window", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.8))
        .await
        .expect("evaluation should succeed");
    assert!(retried.executed, "expired window should clear the guard");
}

#[tokio::test]
async fn test_fourth_transfer_in_an_hour_is_rate_limited() {
    let store = Arc::new(InMemoryHandoffStore::new());
    let evaluator = EvaluatorBuilder::new(store.clone() as Arc<dyn HandoffStore>)
        .build()
        .await
        .expect("evaluator should build");

    // Three distinct edges so neither the circular guard nor ownership
    // interferes: intake -> buyer -> intake -> seller.
    let hops = [
        (AgentRole::Intake, AgentRole::BuyerSpecialist),
        (AgentRole::BuyerSpecialist, AgentRole::Intake),
        (AgentRole::Intake, AgentRole::SellerSpecialist),
    ];
    for (source, target) in hops {
        let decision = evaluator
            .evaluate(candidate("conv-busy", source, target, 0.9))
            .await
            .expect("evaluation should succeed");
        assert!(decision.executed, "{source} -> {target} should execute");
    }

    let fourth = evaluator
        .evaluate(candidate(
            "conv-busy",
            AgentRole::SellerSpecialist,
            AgentRole::BuyerSpecialist,
            0.9,
        ))
        .await
        .expect("evaluation should succeed");
    assert!(!fourth.executed);
    assert_eq!(fourth.block_reason, Some(BlockReason::RateLimited));

    let attempts = store.attempts("conv-busy").await.expect("attempts read");
    assert_eq!(attempts.len(), 4);
}

#[tokio::test]
async fn test_daily_budget_blocks_even_when_hourly_is_clear() {
    let store = Arc::new(
        SqliteHandoffStore::new_in_memory()
            .await
            .expect("in-memory sqlite should open"),
    );

    // Seed a conversation that spent its daily budget hours ago. The hourly
    // window has long since rolled over, so only the daily counter bites.
    let now = Utc::now();
    let counters = RateCounters {
        hourly_count: 3,
        hourly_window_start: now - chrono::Duration::hours(2),
        daily_count: 10,
        daily_window_start: now - chrono::Duration::hours(2),
    };
    store
        .save_counters("conv-heavy", &counters)
        .await
        .expect("counters write");

    let evaluator = EvaluatorBuilder::new(store.clone() as Arc<dyn HandoffStore>)
        .lock_store(store.clone())
        .build()
        .await
        .expect("evaluator should build");

    let decision = evaluator
        .evaluate(candidate("conv-heavy", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.95))
        .await
        .expect("evaluation should succeed");
    assert!(!decision.executed);
    assert_eq!(decision.block_reason, Some(BlockReason::RateLimited));

    // A fresh conversation is unaffected.
    let other = evaluator
        .evaluate(candidate("conv-light", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.95))
        .await
        .expect("evaluation should succeed");
    assert!(other.executed);
}

#[tokio::test]
async fn test_adapted_threshold_survives_a_restart() {
    let store = Arc::new(
        SqliteHandoffStore::new_in_memory()
            .await
            .expect("in-memory sqlite should open"),
    );
    let direction = Direction::new(AgentRole::Intake, AgentRole::BuyerSpecialist);

    {
        let evaluator = EvaluatorBuilder::new(store.clone() as Arc<dyn HandoffStore>)
            .lock_store(store.clone())
            .build()
            .await
            .expect("evaluator should build");

        // Ten failed outcomes push intake -> buyer up by one bounded step.
        for _ in 0..10 {
            evaluator
                .record_outcome(direction, false)
                .await
                .expect("outcome should record");
        }
        let raised = evaluator.threshold(direction).value;
        assert!(
            (raised - 0.72).abs() < 1e-9,
            "threshold should sit one step above the default, got {raised}"
        );

        // Confidence that cleared the default now falls short.
        let decision = evaluator
            .evaluate(candidate("conv-out", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.71))
            .await
            .expect("evaluation should succeed");
        assert!(!decision.executed);
        assert_eq!(decision.block_reason, Some(BlockReason::BelowThreshold));
        assert!((decision.threshold_used - raised).abs() < 1e-9);
    }

    // A rebuilt evaluator hydrates the adapted profile from storage.
    let reopened = EvaluatorBuilder::new(store.clone() as Arc<dyn HandoffStore>)
        .lock_store(store.clone())
        .build()
        .await
        .expect("evaluator should rebuild");
    let hydrated = reopened.threshold(direction).value;
    assert!(
        (hydrated - 0.72).abs() < 1e-9,
        "restart should keep the adapted threshold, got {hydrated}"
    );

    let decision = reopened
        .evaluate(candidate("conv-out-2", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.71))
        .await
        .expect("evaluation should succeed");
    assert_eq!(decision.block_reason, Some(BlockReason::BelowThreshold));
}

#[tokio::test]
async fn test_stale_source_is_blocked_over_sqlite() {
    let store = Arc::new(
        SqliteHandoffStore::new_in_memory()
            .await
            .expect("in-memory sqlite should open"),
    );
    store
        .set_owner("conv-claimed", AgentRole::SellerSpecialist)
        .await
        .expect("owner write");

    let evaluator = EvaluatorBuilder::new(store.clone() as Arc<dyn HandoffStore>)
        .lock_store(store.clone())
        .build()
        .await
        .expect("evaluator should build");

    let decision = evaluator
        .evaluate(candidate("conv-claimed", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.9))
        .await
        .expect("evaluation should succeed");
    assert!(!decision.executed);
    assert_eq!(decision.block_reason, Some(BlockReason::StaleOwnership));
    assert_eq!(
        store.current_owner("conv-claimed").await.expect("owner read"),
        Some(AgentRole::SellerSpecialist)
    );

    let attempts = store.attempts("conv-claimed").await.expect("attempts read");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].block_reason, Some(BlockReason::StaleOwnership));
}

#[tokio::test]
async fn test_layered_evaluator_reports_metrics() {
    let store = Arc::new(InMemoryHandoffStore::new());
    let evaluator = EvaluatorBuilder::new(store.clone() as Arc<dyn HandoffStore>)
        .build()
        .await
        .expect("evaluator should build");

    let collector = InMemoryCollector::new();
    let metered = MetricsLayer::new(collector.clone()).layer(evaluator);
    let mut service = TracingLayer::new().layer(metered);

    let executed = service
        .ready()
        .await
        .expect("service should be ready")
        .call(candidate("conv-m", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.9))
        .await
        .expect("call should succeed");
    assert!(executed.executed);

    let blocked = service
        .ready()
        .await
        .expect("service should be ready")
        .call(candidate("conv-m2", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.2))
        .await
        .expect("call should succeed");
    assert_eq!(blocked.block_reason, Some(BlockReason::BelowThreshold));

    assert_eq!(collector.counter("handoff_executed"), 1);
    assert_eq!(collector.counter("handoff_blocked_below_threshold"), 1);
    assert_eq!(collector.histogram("handoff_evaluation_ms").len(), 2);
}

#[tokio::test]
async fn test_validation_errors_surface_through_the_service_trait() {
    let store = Arc::new(InMemoryHandoffStore::new());
    let evaluator = EvaluatorBuilder::new(store.clone() as Arc<dyn HandoffStore>)
        .build()
        .await
        .expect("evaluator should build");

    let err = evaluator
        .clone()
        .oneshot(candidate("", AgentRole::Intake, AgentRole::BuyerSpecialist, 0.9))
        .await
        .expect_err("empty conversation id should be rejected");
    assert!(err.to_string().contains("Invalid candidate"));

    // Nothing reached the audit log.
    let attempts = store.attempts("").await.expect("attempts read");
    assert!(attempts.is_empty());
}
