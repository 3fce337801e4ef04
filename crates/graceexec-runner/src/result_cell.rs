//! Single-slot completion cell: published once, collected once

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug)]
enum Slot<T> {
    Pending,
    Ready(T),
    Collected,
}

/// Holds the final result of a supervised process.
///
/// Exactly one [`publish`](ResultCell::publish) succeeds. Any number of tasks
/// may [`collect`](ResultCell::collect); the first one to run after
/// publication takes the value and every other caller gets `None`.
#[derive(Debug)]
pub struct ResultCell<T> {
    slot: Mutex<Slot<T>>,
    ready: Notify,
}

impl<T> ResultCell<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the result. Hands the value back if one was already published.
    pub fn publish(&self, value: T) -> Result<(), T> {
        {
            let mut slot = self.lock();
            if !matches!(*slot, Slot::Pending) {
                return Err(value);
            }
            *slot = Slot::Ready(value);
        }
        self.ready.notify_waiters();
        Ok(())
    }

    /// Whether a value has been published (collected or not).
    #[must_use]
    pub fn is_published(&self) -> bool {
        !matches!(*self.lock(), Slot::Pending)
    }

    /// Wait for the result. Returns `None` if another caller already took it.
    pub async fn collect(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();

            {
                let mut slot = self.lock();
                match std::mem::replace(&mut *slot, Slot::Collected) {
                    Slot::Ready(value) => return Some(value),
                    Slot::Collected => return None,
                    Slot::Pending => *slot = Slot::Pending,
                }
            }

            notified.await;
        }
    }
}

impl<T> Default for ResultCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
