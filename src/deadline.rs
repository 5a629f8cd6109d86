//! Resettable deadlines for blocking operations.

use tokio::{sync::watch, time::Instant};

/// A deadline which can be changed while operations are waiting on it.
///
/// A deadline of `None` means operations never time out. Changing the deadline wakes up all
/// current waiters, which then wait on the new deadline.
#[derive(Debug)]
pub struct Deadline {
    tx: watch::Sender<Option<Instant>>,
}

impl Deadline {
    /// Create a `Deadline` which never expires.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Set a new deadline, or clear it with `None`. A deadline in the past expires immediately.
    pub fn set(&self, deadline: Option<Instant>) {
        self.tx.send_replace(deadline);
    }

    /// Checks if the deadline is set and has passed.
    pub fn expired(&self) -> bool {
        matches!(*self.tx.borrow(), Some(d) if d <= Instant::now())
    }

    /// Resolves once the deadline passes. Never resolves while no deadline is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => return,
                        _ = rx.changed() => continue,
                    }
                }
                None => {
                    // The sender lives as long as self, so this only returns on a new deadline.
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}
