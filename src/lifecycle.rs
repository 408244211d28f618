//! Engine shutdown signal.
//!
//! Every flow checks it at its resumption points and channels race their wire round-trips
//! against it, so tearing an engine down resolves everything still waiting.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<bool>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn terminate(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_terminated(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn ensure_running(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::LifecycleTerminated);
        }
        Ok(())
    }

    /// Resolves once [`Lifecycle::terminate`] has been called.
    pub async fn terminated(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so this only errors if it was dropped
        let _ = rx.wait_for(|terminated| *terminated).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_terminate_wakes_waiters() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.ensure_running().is_ok());

        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.terminated().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        lifecycle.terminate();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            lifecycle.ensure_running(),
            Err(Error::LifecycleTerminated)
        ));
        // already terminated: resolves immediately
        lifecycle.terminated().await;
    }
}
