//! Externally settled promise shared by every caller of one load

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Create a linked deferred/promise pair
pub fn deferred<T: Clone>() -> (Deferred<T>, Promise<T>) {
    let (tx, rx) = watch::channel(None);
    (Deferred { tx }, Promise { rx: Arc::new(rx) })
}

/// Settling half of a pending value
///
/// `settle` consumes the deferred, so a value is published at most once.
/// Dropping it unsettled leaves every waiter with `None`.
pub struct Deferred<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> Deferred<T> {
    /// Publish the value to every waiter
    pub fn settle(self, value: T) {
        self.tx.send_replace(Some(value));
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

/// Awaiting half of a pending value. Clones are the same promise.
pub struct Promise<T> {
    rx: Arc<watch::Receiver<Option<T>>>,
}

impl<T: Clone> Promise<T> {
    /// Build a promise that is already settled
    pub fn resolved(value: T) -> Self {
        let (_tx, rx) = watch::channel(Some(value));
        Self { rx: Arc::new(rx) }
    }

    /// Wait for the value
    ///
    /// Returns `None` if the deferred was dropped without settling.
    pub async fn wait(&self) -> Option<T> {
        let mut rx = (*self.rx).clone();
        let settled = rx.wait_for(|value| value.is_some()).await;
        match settled {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }

    /// Current value without waiting
    pub fn peek(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    /// Whether a value has been published
    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

impl<T> Promise<T> {
    /// Whether both handles refer to the same promise
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.rx.borrow().is_some())
            .finish()
    }
}
