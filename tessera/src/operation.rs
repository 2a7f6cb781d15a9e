//! Shared handles to sign-in and validation operations
//!
//! Each operation settles exactly once. Abandoning an operation before it
//! settles rejects it.

use std::future::IntoFuture;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::Rejection;

/// The outcome of a sign-in or validation operation
///
/// On success, carries the payload returned by the server, if the
/// operation contacted it.
pub type OperationResult = Result<Option<Value>, Rejection>;

/// A handle to a pending or settled sign-in or validation
///
/// Handles are cheap to clone. Every clone observes the same single
/// outcome, including clones taken after the operation settled.
/// Awaiting a handle never cancels the operation; it runs to completion
/// even if every handle is dropped.
#[derive(Clone, Debug)]
pub struct Operation {
    id: u64,
    outcome: watch::Receiver<Option<OperationResult>>,
}

impl Operation {
    pub(crate) fn new(id: u64) -> (Self, Resolver) {
        let (tx, rx) = watch::channel(None);
        (
            Self { id, outcome: rx },
            Resolver {
                id,
                tx,
                settled: false,
            },
        )
    }

    /// An identifier shared by every handle to the same operation
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The outcome, if the operation has settled
    pub fn outcome(&self) -> Option<OperationResult> {
        self.outcome.borrow().clone()
    }

    /// Whether the operation has settled
    pub fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Waits for the operation to settle
    pub async fn wait(mut self) -> OperationResult {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone().unwrap_or_else(|| Err(Rejection::abandoned())),
            Err(_) => Err(Rejection::abandoned()),
        }
    }
}

impl IntoFuture for Operation {
    type Output = OperationResult;
    type IntoFuture = BoxFuture<'static, OperationResult>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

/// The settling side of an [`Operation`]
///
/// Dropping a resolver without settling it rejects the operation so that
/// waiters never hang.
#[derive(Debug)]
pub(crate) struct Resolver {
    id: u64,
    tx: watch::Sender<Option<OperationResult>>,
    settled: bool,
}

impl Resolver {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn settle(mut self, outcome: OperationResult) {
        self.settled = true;
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(operation = self.id, "operation dropped before settling");
            self.tx.send_replace(Some(Err(Rejection::abandoned())));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn every_handle_sees_the_same_outcome() {
        let (operation, resolver) = Operation::new(7);
        let early = operation.clone();
        let waiter = tokio::spawn(early.wait());

        resolver.settle(Ok(Some(json!({ "id": 1 }))));

        assert_eq!(waiter.await.unwrap(), Ok(Some(json!({ "id": 1 }))));
        assert_eq!(operation.clone().await, Ok(Some(json!({ "id": 1 }))));
        assert_eq!(operation.id(), 7);
    }

    #[tokio::test]
    async fn late_handles_observe_a_settled_rejection() {
        let (operation, resolver) = Operation::new(1);
        assert!(!operation.is_settled());

        resolver.settle(Err(Rejection::no_credentials()));

        assert!(operation.is_settled());
        assert_eq!(operation.outcome(), Some(Err(Rejection::no_credentials())));
        assert_eq!(operation.await, Err(Rejection::no_credentials()));
    }

    #[tokio::test]
    async fn dropped_resolvers_reject() {
        let (operation, resolver) = Operation::new(1);
        drop(resolver);

        assert_eq!(operation.await, Err(Rejection::abandoned()));
    }
}
