//! End-to-end tour of the handoff evaluation pipeline.
//!
//! Routes one conversation through the common decision branches over the
//! in-memory backend, then prints the audit trail and the CRM events a
//! consumer would apply. Evaluator debug logs are enabled so each gate's
//! verdict is visible alongside the printed decisions.
//!
//! Run with: cargo run --example evaluator_demo

use std::sync::Arc;

use tokio::sync::mpsc;
use tower_handoff::candidate::{AgentRole, Direction, HandoffCandidate, HandoffDecision};
use tower_handoff::events::TagAction;
use tower_handoff::evaluator::HandoffEvaluator;
use tower_handoff::store::InMemoryHandoffStore;

fn outcome_line(decision: &HandoffDecision) -> String {
    if decision.executed {
        format!(
            "✅ executed, owner is now {}",
            decision.new_owner.map(|r| r.label()).unwrap_or("?")
        )
    } else {
        format!("❌ blocked ({})", decision.reason())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter("tower_handoff=debug")
        .init();

    println!("=== Handoff Evaluation Demo ===\n");

    let store = Arc::new(InMemoryHandoffStore::new());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let evaluator = HandoffEvaluator::builder(store)
        .event_sink(events_tx)
        .build()
        .await?;

    println!("--- Part 1: Decision gates ---\n");

    println!("Scenario 1: low confidence stays with intake");
    let timid = HandoffCandidate::new(
        "conv-42",
        AgentRole::Intake,
        AgentRole::BuyerSpecialist,
        0.55,
    );
    println!("  {}\n", outcome_line(&evaluator.evaluate(timid).await?));

    println!("Scenario 2: confident candidate moves to the buyer specialist");
    let confident = HandoffCandidate::new(
        "conv-42",
        AgentRole::Intake,
        AgentRole::BuyerSpecialist,
        0.88,
    );
    println!("  {}\n", outcome_line(&evaluator.evaluate(confident).await?));

    println!("Scenario 3: the same direction inside the window is refused");
    let repeat = HandoffCandidate::new(
        "conv-42",
        AgentRole::Intake,
        AgentRole::BuyerSpecialist,
        0.90,
    );
    println!("  {}\n", outcome_line(&evaluator.evaluate(repeat).await?));

    println!("Scenario 4: the hourly budget caps churn at three transfers");
    let hops = [
        (AgentRole::BuyerSpecialist, AgentRole::Intake, 0.90),
        (AgentRole::Intake, AgentRole::SellerSpecialist, 0.86),
        (AgentRole::SellerSpecialist, AgentRole::BuyerSpecialist, 0.90),
    ];
    for (source, target, confidence) in hops {
        let hop = HandoffCandidate::new("conv-42", source, target, confidence);
        println!("  {}", outcome_line(&evaluator.evaluate(hop).await?));
    }

    println!("\n--- Part 2: Threshold adaptation ---\n");

    let direction = Direction::new(AgentRole::Intake, AgentRole::BuyerSpecialist);
    let before = evaluator.threshold(direction);
    for _ in 0..10 {
        evaluator.record_outcome(direction, false).await?;
    }
    let after = evaluator.threshold(direction);
    println!(
        "Ten failed transfers reported for {direction}: threshold {:.2} -> {:.2} ({} samples)",
        before.value, after.value, after.samples
    );

    let borderline = HandoffCandidate::new(
        "conv-77",
        AgentRole::Intake,
        AgentRole::BuyerSpecialist,
        0.71,
    );
    println!(
        "A 0.71 candidate that cleared the old bar now gets: {}\n",
        outcome_line(&evaluator.evaluate(borderline).await?)
    );

    println!("--- Part 3: Audit trail for conv-42 ---\n");
    for attempt in evaluator.history("conv-42").await? {
        println!(
            "  [{}] {} -> {}  {:<8}  {}",
            attempt.created_at.format("%H:%M:%S"),
            attempt.source_role.label(),
            attempt.target_role.label(),
            attempt.decision.as_str(),
            attempt.block_reason.map(|r| r.as_str()).unwrap_or("-"),
        );
    }

    println!("\n--- Part 4: CRM events ---\n");
    while let Ok(event) = events_rx.try_recv() {
        println!("📤 {}", event.summary);
        for tag in &event.tags {
            match tag {
                TagAction::Add(t) => println!("     + {t}"),
                TagAction::Remove(t) => println!("     - {t}"),
            }
        }
        println!("     wire: {}", event.payload()?);
    }

    println!("\n📝 The debug logs above show each gate's reads: threshold");
    println!("   lookups, window checks, budget counts, and lock activity.");

    Ok(())
}
