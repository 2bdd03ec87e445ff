//! # Tower Handoff
//!
//! A Tower-based orchestration core that decides whether and when
//! conversation ownership transfers between a set of cooperating agents
//! (an intake agent and per-topic specialists). Upstream signal
//! extraction proposes a transfer with a confidence score; this crate
//! answers with a definitive decision and keeps the bookkeeping honest.
//!
//! ## Core Concepts
//!
//! - **Evaluator**: a Tower service over [`HandoffCandidate`] that runs
//!   the gate sequence (threshold, circular window, rate budget, lock,
//!   ownership re-check) and commits or blocks
//! - **Stores**: all state behind the [`HandoffStore`] and
//!   [`lock::LockStore`] traits, with in-memory and SQLite backends
//! - **Layers**: Tower middleware for tracing and metrics around
//!   evaluations
//! - **Static DI**: stores, adapters, and sinks are injected at
//!   construction time - no runtime lookups
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tower_handoff::{AgentRole, HandoffCandidate, HandoffEvaluator, InMemoryHandoffStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let store = Arc::new(InMemoryHandoffStore::new());
//! let evaluator = HandoffEvaluator::builder(store).build().await?;
//!
//! let candidate = HandoffCandidate::new(
//!     "conv-42",
//!     AgentRole::Intake,
//!     AgentRole::BuyerSpecialist,
//!     0.82,
//! );
//! let decision = evaluator.evaluate(candidate).await?;
//!
//! if decision.executed {
//!     println!("conversation now owned by {:?}", decision.new_owner);
//! } else {
//!     println!("handoff blocked: {}", decision.reason());
//! }
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod candidate;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod guard;
pub mod lock;
pub mod observability;
pub mod rate_limit;
pub mod store;
pub mod threshold;

// Public re-exports for convenience
pub use audit::AuditLogger;
pub use candidate::{
    AgentRole, AttemptDecision, BlockReason, Direction, HandoffAttempt, HandoffCandidate,
    HandoffDecision, HandoffOutcome,
};
pub use config::{ConfigBuilder, HandoffConfig};
pub use error::{HandoffError, Result};
pub use evaluator::{EvaluatorBuilder, HandoffEvaluator};
pub use events::{HandoffEvent, TagAction};
pub use guard::CircularGuard;
pub use lock::{InProcessLockStore, LockGuard, LockManager, LockStore};
pub use observability::{
    InMemoryCollector, MetricRecord, MetricsCollector, MetricsLayer, TracingLayer,
};
pub use rate_limit::{RateCounters, RateLimiter};
pub use store::sqlite::SqliteHandoffStore;
pub use store::{HandoffStore, InMemoryHandoffStore};
pub use threshold::{ThresholdAdapter, ThresholdProfile, ThresholdReading};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
