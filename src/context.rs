//! Per-request context: correlation id, deadline, cancellation
//!
//! A [`RequestContext`] is created by the RPC frontend for each inbound
//! request and passed by reference down the call chain (router, spoke,
//! aggregator). Every bounded wait races against it so that cancellation
//! and deadline expiry unwind promptly.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{Error, Result};

/// Context scoped to a single inbound RPC
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id, echoed in error data and logs
    correlation_id: String,
    /// Absolute deadline
    deadline: Instant,
    /// Cancellation signal, propagated downstream
    cancel: CancellationToken,
}

impl RequestContext {
    /// Create a context with a deadline `timeout` from now
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a context with an explicit correlation id (propagated from a peer)
    #[must_use]
    pub fn with_correlation_id(correlation_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Correlation id for this request
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Absolute deadline
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time remaining before the deadline; `None` once expired
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        (now < self.deadline).then(|| self.deadline - now)
    }

    /// Whether the caller has aborted
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Abort this request; all downstream waits unwind
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the caller aborts
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Run `fut` racing it against cancellation and the deadline.
    ///
    /// Returns `Cancelled` if the caller aborted first, `DeadlineExceeded`
    /// if the deadline elapsed first, otherwise the future's own result.
    pub async fn run<F, T>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Cancelled(format!(
                "{what} aborted (correlation {})",
                self.correlation_id
            ))),
            () = tokio::time::sleep_until(self.deadline) => Err(Error::DeadlineExceeded(format!(
                "{what} exceeded deadline (correlation {})",
                self.correlation_id
            ))),
            res = fut => res,
        }
    }

    /// Run `fut` against the earlier of the context deadline and `cap` from now.
    ///
    /// Used for per-call timeouts that must never extend past the request
    /// deadline.
    pub async fn run_capped<F, T>(&self, what: &str, cap: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let capped = Instant::now() + cap;
        let effective = self.deadline.min(capped);
        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::Cancelled(format!(
                "{what} aborted (correlation {})",
                self.correlation_id
            ))),
            () = tokio::time::sleep_until(effective) => {
                if effective == self.deadline {
                    Err(Error::DeadlineExceeded(format!(
                        "{what} exceeded deadline (correlation {})",
                        self.correlation_id
                    )))
                } else {
                    Err(Error::SpokeTimeout(format!(
                        "{what} exceeded per-call timeout (correlation {})",
                        self.correlation_id
                    )))
                }
            }
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_future_result_before_deadline() {
        let ctx = RequestContext::new(Duration::from_secs(5));
        let out = ctx.run("noop", async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn run_times_out_at_deadline() {
        let ctx = RequestContext::new(Duration::from_millis(50));
        let res: Result<()> = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(Error::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn run_observes_cancellation() {
        let ctx = RequestContext::new(Duration::from_secs(5));
        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move {
            ctx2.run("forever", async {
                std::future::pending::<Result<()>>().await
            })
            .await
        });
        ctx.cancel();
        let res = handle.await.unwrap();
        assert!(matches!(res, Err(Error::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn run_capped_prefers_per_call_timeout_over_far_deadline() {
        let ctx = RequestContext::new(Duration::from_secs(60));
        let res: Result<()> = ctx
            .run_capped("spoke call", Duration::from_millis(100), async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        // Per-call cap fires first and is classified as a retryable timeout.
        assert!(matches!(res, Err(Error::SpokeTimeout(_))));
    }

    #[tokio::test]
    async fn remaining_shrinks_and_expires() {
        let ctx = RequestContext::new(Duration::from_millis(30));
        assert!(ctx.remaining().is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ctx.remaining().is_none());
    }
}
