//! Cancellation and deadlines for forward and tunnel operations
//!
//! Every request runs inside an [`OperationScope`]. The server hands out scopes
//! whose token is a child of its shutdown token; the forwarder and the tunnel
//! narrow them further with their own deadlines.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TrailError};

/// Why a scope ended before the work inside it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeEnd {
    Cancelled,
    DeadlineExceeded,
}

impl From<ScopeEnd> for TrailError {
    fn from(end: ScopeEnd) -> Self {
        match end {
            ScopeEnd::Cancelled => TrailError::Cancelled,
            ScopeEnd::DeadlineExceeded => TrailError::Timeout,
        }
    }
}

/// A cancellation token plus an optional deadline
#[derive(Debug, Clone)]
pub struct OperationScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OperationScope {
    /// Scope with no deadline, ended only through `token`
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Scope that never ends on its own
    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Derive a scope that ends with this one, or earlier when `timeout` elapses first
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };

        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves when the scope is cancelled or its deadline passes
    pub async fn ended(&self) -> ScopeEnd {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = self.token.cancelled() => ScopeEnd::Cancelled,
            _ = deadline => ScopeEnd::DeadlineExceeded,
        }
    }

    /// Run `fut` inside the scope; the future is dropped if the scope ends first
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            end = self.ended() => Err(end.into()),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_returns_future_result() {
        let scope = OperationScope::unbounded();
        let value = scope.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_scope_stops_work() {
        let scope = OperationScope::unbounded();
        scope.cancel();

        let result: Result<()> = scope.run(std::future::pending()).await;
        assert!(matches!(result, Err(TrailError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let scope = OperationScope::unbounded().child(Some(Duration::from_millis(20)));

        let result: Result<()> = scope.run(std::future::pending()).await;
        assert!(matches!(result, Err(TrailError::Timeout)));
    }

    #[tokio::test]
    async fn test_child_keeps_earlier_deadline() {
        let parent = OperationScope::unbounded().child(Some(Duration::from_secs(1)));
        let child = parent.child(Some(Duration::from_secs(60)));
        assert_eq!(child.deadline(), parent.deadline());

        let unbounded_child = parent.child(None);
        assert_eq!(unbounded_child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = OperationScope::unbounded();
        let child = parent.child(None);

        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.ended().await, ScopeEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = OperationScope::unbounded();
        let child = parent.child(None);

        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
