//! Route-aware rate limiter.
//!
//! Every route signature gets its own fair async queue, so callers on one
//! route are released in FIFO order while unrelated routes proceed in
//! parallel. Budget is checked against the shared [`BucketTable`] only once
//! a caller reaches the head of its queue; a caller dropped while queued
//! gives up its slot without touching the budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::sync::Mutex as QueueLock;
use tokio::time::Instant;
use tracing::debug;

use crate::rest::bucket::{Admission, Bucket, BucketTable, RateLimitHeaders};
use crate::rest::executor::RestError;
use crate::rest::route::RouteSignature;

/// Gates outbound calls against per-route and global budgets.
#[derive(Debug)]
pub struct RateLimiter {
    table: BucketTable,
    queues: Mutex<HashMap<RouteSignature, Arc<QueueLock<()>>>>,
    max_wait: Duration,
}

impl RateLimiter {
    /// `max_wait` bounds how long a caller may be parked before the limiter
    /// fails fast with [`RestError::RateLimited`].
    pub fn new(max_wait: Duration) -> Self {
        Self {
            table: BucketTable::new(),
            queues: Mutex::new(HashMap::new()),
            max_wait,
        }
    }

    /// Waits until `signature` may send one request and takes its budget.
    ///
    /// The first request to an unseen route is admitted immediately; its
    /// response establishes the bucket for later calls.
    pub async fn acquire(&self, signature: &RouteSignature) -> Result<(), RestError> {
        let queue = self.queue_for(signature);
        let _slot = queue.lock().await;

        loop {
            let now = Instant::now();
            match self.table.try_admit(signature, now) {
                Admission::Admitted => return Ok(()),
                Admission::Wait { until, global } => {
                    let wait = until.saturating_duration_since(now);
                    if wait > self.max_wait {
                        return Err(RestError::RateLimited {
                            retry_after: wait,
                            global,
                        });
                    }
                    debug!(
                        event = "rate_limit_wait",
                        route = %signature,
                        global,
                        wait_ms = wait.as_millis() as u64
                    );
                    tokio::time::sleep_until(until).await;
                }
            }
        }
    }

    /// Reconciles the table with the server's report for one response.
    pub fn record_response(
        &self,
        signature: &RouteSignature,
        headers: &HeaderMap,
    ) -> RateLimitHeaders {
        let parsed = RateLimitHeaders::from_headers(headers);
        self.record_parsed(signature, &parsed);
        parsed
    }

    pub(crate) fn record_parsed(&self, signature: &RouteSignature, headers: &RateLimitHeaders) {
        self.table.record_response(signature, headers, Instant::now());
    }

    pub fn lookup(&self, signature: &RouteSignature) -> Option<Bucket> {
        self.table.lookup(signature)
    }

    pub fn global(&self) -> Option<Bucket> {
        self.table.global()
    }

    fn queue_for(&self, signature: &RouteSignature) -> Arc<QueueLock<()>> {
        let mut queues = self.queues.lock();
        Arc::clone(
            queues
                .entry(signature.clone())
                .or_insert_with(|| Arc::new(QueueLock::new(()))),
        )
    }
}
