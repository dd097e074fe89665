//! Registry of in-flight operations
//!
//! Every public operation gets a [`Completion`] (kept by whoever does the
//! work) and a [`Pending`] (returned to the caller). The completion is
//! registered with an [`OperationTracker`] until it resolves, so that a
//! connection loss can fail everything still outstanding in one sweep.

use crate::{ClientError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Identifier of one public operation
pub type OperationId = Uuid;

type Registry = Mutex<HashMap<OperationId, Arc<dyn Failable>>>;

/// Type-erased view of a registered completion
trait Failable: Send + Sync {
    /// Fail the operation unless it already resolved
    fn fail(&self, error: ClientError) -> bool;
}

/// Tracks unresolved completions
#[derive(Clone, Default)]
pub struct OperationTracker {
    /// Unresolved operations by id
    pending: Arc<Registry>,
}

impl OperationTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation
    ///
    /// The completion removes itself from the tracker the moment it
    /// resolves, whichever way it resolves.
    pub fn track<T: Send + 'static>(&self) -> (Completion<T>, Pending<T>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        let slot = Arc::new(Slot {
            id,
            sender: Mutex::new(Some(tx)),
            registry: Arc::downgrade(&self.pending),
        });

        lock(&self.pending).insert(id, slot.clone() as Arc<dyn Failable>);
        debug!("Tracking operation {}", id);

        (Completion { slot }, Pending { id, rx })
    }

    /// Fail every operation registered at the time of the call
    ///
    /// Returns how many operations this call actually failed.
    pub fn fail_all(&self, reason: &ClientError) -> usize {
        let snapshot: Vec<Arc<dyn Failable>> = lock(&self.pending).values().cloned().collect();

        let failed = snapshot
            .into_iter()
            .filter(|operation| operation.fail(reason.clone()))
            .count();

        if failed > 0 {
            debug!("Failed {} pending operations: {}", failed, reason);
        }
        failed
    }

    /// Number of unresolved operations
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    /// Whether the operation is still registered
    pub fn contains(&self, id: &OperationId) -> bool {
        lock(&self.pending).contains_key(id)
    }
}

/// Shared state of one operation
struct Slot<T> {
    /// Operation id
    id: OperationId,
    /// Taken by whichever side resolves first
    sender: Mutex<Option<oneshot::Sender<Result<T>>>>,
    /// Registry to remove ourselves from
    registry: Weak<Registry>,
}

impl<T: Send> Slot<T> {
    fn resolve(&self, result: Result<T>) -> bool {
        let sender = lock(&self.sender).take();
        let resolved = match sender {
            Some(tx) => {
                // The caller may have stopped waiting; the operation still counts as resolved.
                let _ = tx.send(result);
                true
            }
            None => false,
        };
        self.cleanup();
        resolved
    }

    fn is_resolved(&self) -> bool {
        lock(&self.sender).is_none()
    }

    fn cleanup(&self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.id);
        }
    }
}

impl<T: Send> Failable for Slot<T> {
    fn fail(&self, error: ClientError) -> bool {
        self.resolve(Err(error))
    }
}

/// Producer side of an operation: resolves it exactly once
///
/// Dropping an unresolved completion fails the operation with
/// [`ClientError::Cancelled`].
pub struct Completion<T: Send + 'static> {
    slot: Arc<Slot<T>>,
}

impl<T: Send + 'static> Completion<T> {
    /// Operation id
    pub fn id(&self) -> OperationId {
        self.slot.id
    }

    /// Resolve with a result; `false` if already resolved
    pub fn complete(&self, result: Result<T>) -> bool {
        self.slot.resolve(result)
    }

    /// Resolve successfully
    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Resolve with an error
    pub fn fail(&self, error: ClientError) -> bool {
        self.complete(Err(error))
    }

    /// Whether the operation has resolved
    pub fn is_resolved(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Remove the operation from its tracker; safe to call repeatedly
    pub fn cleanup(&self) {
        self.slot.cleanup();
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if !self.slot.is_resolved() {
            self.slot.resolve(Err(ClientError::Cancelled(
                "operation dropped before completion".to_string(),
            )));
        }
    }
}

/// Caller side of an operation, resolving to its result
#[must_use = "operations report their outcome through the returned future"]
pub struct Pending<T> {
    id: OperationId,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Operation id
    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Cancelled(
                "operation abandoned".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests;
