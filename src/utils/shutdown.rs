use tokio::sync::watch;

// ============================================================================
// Shutdown Signal
// ============================================================================
//
// A cloneable cancellation handle backed by a watch channel. Every component
// that may wait (local retry sleeps, the subscriber loop, health polling)
// selects on `cancelled()` so shutdown is observed promptly.
//
// ============================================================================

/// Sending half, held by whoever decides the process should stop.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace never fails, even with no receivers left
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered. Never resolves if the trigger
    /// is dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_resolves_after_trigger() {
        let (trigger, shutdown) = shutdown_channel();
        assert!(!shutdown.is_cancelled());

        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        });

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_cancels() {
        let (trigger, shutdown) = shutdown_channel();
        drop(trigger);

        let result = tokio::time::timeout(Duration::from_millis(50), shutdown.cancelled()).await;
        assert!(result.is_err());
        assert!(!shutdown.is_cancelled());
    }
}
