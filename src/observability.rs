//! Observability: tracing and metrics around evaluations
//!
//! Both layers wrap any `Service<HandoffCandidate, Response =
//! HandoffDecision>`, so they stack directly on the evaluator:
//!
//! `ServiceBuilder::new().layer(TracingLayer::new()).layer(MetricsLayer::new(collector)).service(evaluator)`
//!
//! [`TracingLayer`] opens a span per evaluation with the conversation and
//! direction as fields. [`MetricsLayer`] turns every decision into
//! counter updates through an injected [`MetricsCollector`], which is any
//! `Service<MetricRecord, Response = ()>`; [`InMemoryCollector`] is the
//! bundled implementation for tests and local decision analytics.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{info, info_span, Instrument};

use crate::candidate::{BlockReason, HandoffCandidate, HandoffDecision};

#[derive(Debug, Clone)]
pub enum MetricRecord {
    Counter { name: &'static str, value: u64 },
    Histogram { name: &'static str, value: u64 },
}

pub trait MetricsCollector: Service<MetricRecord, Response = (), Error = BoxError> {}
impl<T> MetricsCollector for T where T: Service<MetricRecord, Response = (), Error = BoxError> {}

/// Counter name for one decision outcome
fn decision_counter(decision: &HandoffDecision) -> &'static str {
    match decision.block_reason {
        None => "handoff_executed",
        Some(BlockReason::BelowThreshold) => "handoff_blocked_below_threshold",
        Some(BlockReason::CircularWindow) => "handoff_blocked_circular_window",
        Some(BlockReason::RateLimited) => "handoff_blocked_rate_limited",
        Some(BlockReason::LockUnavailable) => "handoff_blocked_lock_unavailable",
        Some(BlockReason::StaleOwnership) => "handoff_blocked_stale_ownership",
    }
}

/// Layer that adds a span and a decision log line per evaluation.
pub struct TracingLayer;
impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TracingLayer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Tracing<S> {
    inner: S,
}

impl<S> Layer<S> for TracingLayer {
    type Service = Tracing<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Tracing { inner }
    }
}

impl<S> Service<HandoffCandidate> for Tracing<S>
where
    S: Service<HandoffCandidate, Response = HandoffDecision, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = HandoffDecision;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, candidate: HandoffCandidate) -> Self::Future {
        let span = info_span!(
            "handoff_evaluation",
            conversation_id = %candidate.conversation_id,
            direction = %candidate.direction(),
        );
        let fut = self.inner.call(candidate).instrument(span);
        Box::pin(async move {
            let decision = fut.await?;
            info!(
                executed = decision.executed,
                reason = decision.reason(),
                threshold = decision.threshold_used,
                confidence = decision.confidence_used,
                "handoff decision"
            );
            Ok(decision)
        })
    }
}

/// Layer that translates decisions into metric updates via an injected
/// collector.
pub struct MetricsLayer<C> {
    collector: C,
}
impl<C> MetricsLayer<C> {
    pub fn new(collector: C) -> Self {
        Self { collector }
    }
}

pub struct Metrics<S, C> {
    inner: S,
    collector: C,
}

impl<S, C> Layer<S> for MetricsLayer<C>
where
    C: Clone,
{
    type Service = Metrics<S, C>;
    fn layer(&self, inner: S) -> Self::Service {
        Metrics {
            inner,
            collector: self.collector.clone(),
        }
    }
}

impl<S, C> Service<HandoffCandidate> for Metrics<S, C>
where
    S: Service<HandoffCandidate, Response = HandoffDecision, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    C: MetricsCollector + Clone + Send + 'static,
    C::Future: Send + 'static,
{
    type Response = HandoffDecision;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, candidate: HandoffCandidate) -> Self::Future {
        let mut collector = self.collector.clone();
        let fut = self.inner.call(candidate);
        Box::pin(async move {
            let started = Instant::now();
            let decision = fut.await?;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            // Metrics are best-effort; a broken collector never costs the
            // caller its decision.
            let _ = emit(
                &mut collector,
                MetricRecord::Counter {
                    name: decision_counter(&decision),
                    value: 1,
                },
            )
            .await;
            let _ = emit(
                &mut collector,
                MetricRecord::Histogram {
                    name: "handoff_evaluation_ms",
                    value: elapsed_ms,
                },
            )
            .await;
            Ok(decision)
        })
    }
}

async fn emit<C>(collector: &mut C, record: MetricRecord) -> Result<(), BoxError>
where
    C: Service<MetricRecord, Response = (), Error = BoxError>,
{
    ServiceExt::ready(collector).await?.call(record).await
}

#[derive(Default)]
struct CollectorState {
    counters: HashMap<&'static str, u64>,
    histograms: HashMap<&'static str, Vec<u64>>,
}

/// Collector that aggregates records in memory.
///
/// Doubles as a small decision-analytics surface: counter snapshots give
/// executed/blocked totals per reason without a metrics backend.
#[derive(Clone, Default)]
pub struct InMemoryCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl InMemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state.counters.get(name).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> HashMap<&'static str, u64> {
        let state = self.state.lock().unwrap();
        state.counters.clone()
    }

    pub fn histogram(&self, name: &str) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state.histograms.get(name).cloned().unwrap_or_default()
    }
}

impl Service<MetricRecord> for InMemoryCollector {
    type Response = ();
    type Error = BoxError;
    type Future = std::future::Ready<Result<(), BoxError>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: MetricRecord) -> Self::Future {
        let mut state = self.state.lock().unwrap();
        match record {
            MetricRecord::Counter { name, value } => {
                *state.counters.entry(name).or_insert(0) += value;
            }
            MetricRecord::Histogram { name, value } => {
                state.histograms.entry(name).or_default().push(value);
            }
        }
        std::future::ready(Ok(()))
    }
}
