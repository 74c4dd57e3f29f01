use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::Notify;

#[derive(Clone, Default)]
/// A cancellation signal for waiting operations
///
/// An `Interrupt` cancels only the *waiter*: in-flight rule executions are
/// never aborted mid-execution, they run to completion in the background so
/// that no property is left half-mutated. After a wait observes the
/// interrupt, the node is marked invalid; a subsequent full rule run clears
/// the marker.
///
/// # Examples
///
/// ```rust
/// use trellis::sync::Interrupt;
///
/// let interrupt = Interrupt::new();
/// let waiter = interrupt.clone();
///
/// interrupt.trigger();
/// assert!(waiter.is_set());
/// ```
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes every task waiting on this interrupt.
    ///
    /// Once triggered, the interrupt stays triggered.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Checks whether the interrupt has been triggered
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Waits asynchronously until the interrupt is triggered
    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }

        let notified = self.notify.notified();
        tokio::pin!(notified);
        // register before re-checking the flag, closing the race between a
        // trigger and the arrival of this waiter
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let interrupt = Interrupt::new();
        interrupt.trigger();
        interrupt.wait().await;
    }

    #[tokio::test]
    async fn wait_wakes_on_trigger() {
        let interrupt = Interrupt::new();
        let waiter = interrupt.clone();

        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });

        interrupt.trigger();
        handle.await.unwrap();
    }
}
