//! Credit-based flow control.
//!
//! A [`Window`] holds the number of batches a source may still emit. The host
//! grants credit with additive acks; the source loop spends one credit per
//! batch and parks when it runs out.

use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Returned by [`Window::acquire`] when the wait ended because of cancellation
/// rather than because credit became available.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("credit wait cancelled")]
pub struct Cancelled;

#[derive(Debug, Default)]
pub struct Window {
    credit: Mutex<u64>,
    notify: Notify,
}

impl Window {
    pub fn new(initial: u64) -> Self {
        Self { credit: Mutex::new(initial), notify: Notify::new() }
    }

    /// Current credit. Only a snapshot; it may change right after it is read.
    pub fn available(&self) -> u64 {
        *self.lock()
    }

    /// Adds `n` credits and wakes every parked acquirer.
    ///
    /// Releases are additive so concurrent or reordered acks always converge on
    /// the same total. There is no upper bound; the counter saturates.
    pub fn release(&self, n: u64) {
        if n == 0 {
            return;
        }
        let total = {
            let mut credit = self.lock();
            *credit = credit.saturating_add(n);
            *credit
        };
        trace!(released = n, credit = total, "window released");
        self.notify.notify_waiters();
    }

    /// Takes one credit if any is available, without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut credit = self.lock();
        if *credit > 0 {
            *credit -= 1;
            true
        } else {
            false
        }
    }

    /// Waits until credit is positive, then takes one.
    ///
    /// Parks on a notification rather than polling. Returns `Err(Cancelled)` as
    /// soon as `cancel` fires; in that case no credit is consumed. Dropping the
    /// returned future is also safe at any point.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            // Register for wake-ups before checking, so a release landing between
            // the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if self.try_acquire() {
                return Ok(());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(Cancelled),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        self.credit.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn acquire_consumes_initial_credit() {
        let window = Window::new(2);
        let cancel = CancellationToken::new();
        window.acquire(&cancel).await.unwrap();
        window.acquire(&cancel).await.unwrap();
        assert_eq!(window.available(), 0);
        assert!(!window.try_acquire());
    }

    #[tokio::test]
    async fn acquire_at_zero_waits_for_release() {
        let window = Arc::new(Window::new(0));
        let cancel = CancellationToken::new();

        let waiter = {
            let window = window.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { window.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "acquire returned without credit");

        window.release(1);
        let res = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(res, Ok(()));
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn cancellation_wakes_parked_acquirer() {
        let window = Arc::new(Window::new(0));
        let cancel = CancellationToken::new();

        let waiter = {
            let window = window.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { window.acquire(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(res, Err(Cancelled));
        window.release(1);
        assert_eq!(window.available(), 1, "cancelled acquire must not consume credit");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn grants_never_exceed_credit() {
        let window = Arc::new(Window::new(5));
        let cancel = CancellationToken::new();
        let granted = Arc::new(AtomicU64::new(0));

        let mut waiters = Vec::new();
        for _ in 0..1_000 {
            let window = window.clone();
            let cancel = cancel.clone();
            let granted = granted.clone();
            waiters.push(tokio::spawn(async move {
                if window.acquire(&cancel).await.is_ok() {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        let mut released = 5;
        for n in [10, 0, 3, 200, 7] {
            window.release(n);
            released += n;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(granted.load(Ordering::SeqCst), released);
        assert_eq!(window.available(), 0);

        cancel.cancel();
        for w in waiters {
            w.await.unwrap();
        }
        assert_eq!(granted.load(Ordering::SeqCst), released);
    }

    #[test]
    fn release_saturates() {
        let window = Window::new(u64::MAX - 1);
        window.release(10);
        assert_eq!(window.available(), u64::MAX);
    }
}
