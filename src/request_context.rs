//! Per-request cancellation and deadline propagation.
//!
//! Every call the core makes into a collaborator (vector store, embedding
//! provider, interaction store) goes through [`RequestContext::run`], which
//! races the call against the caller's cancellation token and deadline. A
//! losing call is dropped; nothing is written to shared state until a request
//! has fully succeeded.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{RecallError, RecallResult};

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    budget_ms: u64,
    cancel: Option<CancellationToken>,
}

impl RequestContext {
    /// A context with no deadline and no cancellation signal.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            budget_ms: timeout.as_millis() as u64,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
    }

    /// Fail fast if the request was cancelled or its deadline already passed.
    pub fn check(&self, operation: &str) -> RecallResult<()> {
        if self.is_cancelled() {
            return Err(RecallError::Cancelled {
                operation: operation.to_string(),
            });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(self.deadline_error(operation));
            }
        }
        Ok(())
    }

    /// Run `fut` unless the request is cancelled or times out first.
    pub async fn run<F, T>(&self, operation: &str, fut: F) -> RecallResult<T>
    where
        F: Future<Output = RecallResult<T>>,
    {
        self.check(operation)?;

        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(RecallError::Cancelled {
                operation: operation.to_string(),
            }),
            _ = expired => Err(self.deadline_error(operation)),
            result = fut => result,
        }
    }

    fn deadline_error(&self, operation: &str) -> RecallError {
        RecallError::DeadlineExceeded {
            operation: operation.to_string(),
            timeout_ms: self.budget_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_runs_to_completion() {
        let ctx = RequestContext::background();
        let value = ctx.run("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = RequestContext::background().with_cancellation(token);

        let result: RecallResult<()> = ctx.run("search", async { Ok(()) }).await;
        assert!(matches!(result, Err(RecallError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_mid_flight() {
        let token = CancellationToken::new();
        let ctx = RequestContext::background().with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let result: RecallResult<()> = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(RecallError::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));

        let result: RecallResult<()> = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(RecallError::DeadlineExceeded { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
            other => panic!("expected deadline error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_after_deadline() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(10));
        assert!(ctx.check("op").is_ok());
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(ctx.check("op").is_err());
    }
}
