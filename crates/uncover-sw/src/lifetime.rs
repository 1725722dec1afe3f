//! Event lifetime extension.
//!
//! The host may tear a worker down as soon as a handler returns. Work a
//! handler starts but does not finish itself (store writes, deletes, sync
//! posts) must be handed to [`ExtendableEvent::wait_until`]; the dispatcher
//! calls [`ExtendableEvent::settle`] before it reports the event as done.

use std::future::Future;
use std::sync::Mutex;

use futures::future::{join_all, BoxFuture};
use tracing::{debug, warn};

use crate::{Result, ServiceWorkerError};

type Pending = BoxFuture<'static, Result<()>>;

/// Lifetime handle passed to every event handler.
pub struct ExtendableEvent {
    kind: &'static str,
    pending: Mutex<Vec<Pending>>,
}

impl ExtendableEvent {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Event name, e.g. "install" or "fetch".
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Keep the event alive until `operation` completes.
    ///
    /// An error from `operation` fails the event. Best-effort work should
    /// log and return `Ok(())` instead.
    pub fn wait_until<F>(&self, operation: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.lock().push(Box::pin(operation));
    }

    /// Number of registered operations not yet settled.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Drive every registered operation to completion.
    ///
    /// All operations run to the end even if one fails; the first failure
    /// (in registration order) is returned.
    pub async fn settle(self) -> Result<()> {
        let pending = self
            .pending
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());

        if pending.is_empty() {
            return Ok(());
        }

        debug!(event = self.kind, count = pending.len(), "Settling event");
        let results = join_all(pending).await;

        let mut first_error: Option<ServiceWorkerError> = None;
        for result in results {
            if let Err(e) = result {
                warn!(event = self.kind, error = %e, "Extended operation failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ExtendableEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendableEvent")
            .field("kind", &self.kind)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_settle_waits_for_all() {
        let done = Arc::new(AtomicUsize::new(0));
        let event = ExtendableEvent::new("install");

        for delay in [5u64, 1, 3] {
            let done = done.clone();
            event.wait_until(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(event.pending(), 3);
        event.settle().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_siblings() {
        let done = Arc::new(AtomicUsize::new(0));
        let event = ExtendableEvent::new("install");

        event.wait_until(async { Err(ServiceWorkerError::InstallFailed("first".into())) });
        let counter = done.clone();
        event.wait_until(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        event.wait_until(async { Err(ServiceWorkerError::InstallFailed("second".into())) });

        let err = event.settle().await.unwrap_err();
        assert_eq!(err, ServiceWorkerError::InstallFailed("first".into()));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_event_settles() {
        let event = ExtendableEvent::new("message");
        assert_eq!(event.kind(), "message");
        assert!(event.settle().await.is_ok());
    }
}
