//! Audit trail writes
//!
//! Every evaluation, executed or blocked, leaves one [`HandoffAttempt`]
//! in the store. Writes are best-effort durable: the logger tries the
//! store once inline, and on failure hands the record to a background
//! worker that retries with backoff. The decision path never waits on a
//! retry and never sees a write error; a record that exhausts its
//! retries is logged and dropped.

use crate::candidate::HandoffAttempt;
use crate::config::AuditConfig;
use crate::lock::Backoff;
use crate::store::HandoffStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Append-only writer for the handoff audit trail
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn HandoffStore>,
    retry_queue: mpsc::UnboundedSender<HandoffAttempt>,
}

impl AuditLogger {
    /// Build the logger and spawn its retry worker.
    ///
    /// The worker runs until every `AuditLogger` clone is dropped.
    pub fn new(store: Arc<dyn HandoffStore>, config: AuditConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(retry_worker(store.clone(), rx, config));
        Self {
            store,
            retry_queue: tx,
        }
    }

    /// Record one attempt.
    ///
    /// One inline write; on failure the record moves to the retry queue.
    /// Infallible by contract so callers never branch on audit health.
    pub async fn record(&self, attempt: HandoffAttempt) {
        match self.store.append_attempt(&attempt).await {
            Ok(()) => {
                debug!(
                    conversation_id = %attempt.conversation_id,
                    decision = attempt.decision.as_str(),
                    "handoff attempt recorded"
                );
            }
            Err(e) => {
                warn!(
                    conversation_id = %attempt.conversation_id,
                    error = %e,
                    "audit write failed, queued for retry"
                );
                if self.retry_queue.send(attempt).is_err() {
                    error!("audit retry worker is gone, record dropped");
                }
            }
        }
    }
}

async fn retry_worker(
    store: Arc<dyn HandoffStore>,
    mut rx: mpsc::UnboundedReceiver<HandoffAttempt>,
    config: AuditConfig,
) {
    let backoff = Backoff::exponential(config.backoff_base, 2.0, config.backoff_max);

    while let Some(attempt) = rx.recv().await {
        let mut written = false;
        for retry in 0..config.max_retries.max(1) {
            tokio::time::sleep(backoff.delay_for_attempt(retry)).await;
            match store.append_attempt(&attempt).await {
                Ok(()) => {
                    debug!(
                        conversation_id = %attempt.conversation_id,
                        retry,
                        "audit write succeeded on retry"
                    );
                    written = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        conversation_id = %attempt.conversation_id,
                        retry,
                        error = %e,
                        "audit retry failed"
                    );
                }
            }
        }
        if !written {
            error!(
                conversation_id = %attempt.conversation_id,
                retries = config.max_retries,
                "audit record dropped after exhausting retries"
            );
        }
    }
}
