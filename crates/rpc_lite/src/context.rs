use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::error::RpcError;

/// Request metadata carried next to the payload (header-like key/value pairs).
pub type Metadata = HashMap<String, String>;

/// Request-scoped state for a single call.
///
/// A context is never mutated in place. Every `with_*` method returns a
/// derived copy, so an interceptor can hand a narrower context to `next`
/// without affecting what outer layers observe.
#[derive(Debug, Clone)]
pub struct CallContext {
    call_id: u64,
    method: Arc<str>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    span: Span,
    caller: Option<Arc<str>>,
    metadata: Arc<Metadata>,
}

impl CallContext {
    pub fn new(call_id: u64, method: impl Into<Arc<str>>) -> Self {
        Self {
            call_id,
            method: method.into(),
            deadline: None,
            cancel: CancellationToken::new(),
            span: Span::none(),
            caller: None,
            metadata: Arc::new(Metadata::new()),
        }
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Identity of the caller, once an authentication layer has set it.
    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn with_metadata(&self, metadata: Metadata) -> Self {
        Self {
            metadata: Arc::new(metadata),
            ..self.clone()
        }
    }

    /// Replace the cancellation signal, e.g. with a child of the server
    /// shutdown token.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Derive a context whose cancellation can be triggered without
    /// cancelling the parent. Parent cancellation still propagates.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Derive a context with the given deadline. An earlier existing
    /// deadline wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_caller(&self, caller: impl Into<Arc<str>>) -> Self {
        Self {
            caller: Some(caller.into()),
            ..self.clone()
        }
    }

    pub fn with_span(&self, span: Span) -> Self {
        Self {
            span,
            ..self.clone()
        }
    }

    /// Fail fast if the call is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), RpcError> {
        if self.cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(RpcError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Drive `fut` until it completes, the call is cancelled, or the deadline
    /// passes, whichever happens first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        self.check()?;

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(RpcError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(RpcError::DeadlineExceeded),
                    result = fut => result,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(RpcError::Cancelled),
                    result = fut => result,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_leaves_parent_untouched() {
        let parent = CallContext::new(1, "user.User/Ping");
        let child = parent.with_caller("alice").with_timeout(Duration::from_secs(1));

        assert_eq!(child.caller(), Some("alice"));
        assert!(child.deadline().is_some());
        assert_eq!(parent.caller(), None);
        assert!(parent.deadline().is_none());
    }

    #[tokio::test]
    async fn test_earlier_deadline_wins() {
        let ctx = CallContext::new(1, "m").with_timeout(Duration::from_millis(10));
        let first = ctx.deadline().unwrap();
        let later = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(later.deadline(), Some(first));
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = CallContext::new(1, "m");
        let child = parent.child();
        child.cancellation().cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancellation().cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_reports_cancellation() {
        let ctx = CallContext::new(1, "m");
        let token = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            token.cancel();
        });

        let result: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_reports_deadline() {
        let ctx = CallContext::new(1, "m").with_timeout(Duration::from_millis(5));
        let result: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RpcError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_check_expired() {
        let ctx = CallContext::new(1, "m").with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(RpcError::DeadlineExceeded)));
    }
}
