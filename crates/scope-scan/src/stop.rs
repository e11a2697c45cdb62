//! External stop requests.
//!
//! A [`StopHandle`] can be cloned freely and triggered from any task (a
//! Ctrl-C handler, a UI button). The run loop holds a [`StopSignal`], polls
//! it at every state boundary and races every blocking wait against it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// The stop request won the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stop requested")]
pub struct Stopped;

/// Cloneable trigger for stopping a running scan.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// New, untriggered handle.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request a stop. Idempotent.
    pub fn request_stop(&self) {
        self.tx.send_replace(true);
    }

    /// True once a stop has been requested and not yet cleared.
    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Reset the request.
    pub(crate) fn clear(&self) {
        self.tx.send_replace(false);
    }

    /// Listener side for the run loop.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener side of a [`StopHandle`].
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Poll the request without waiting.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Stopped)` when a stop has been requested.
    pub fn check(&self) -> Result<(), Stopped> {
        if self.is_stopped() {
            Err(Stopped)
        } else {
            Ok(())
        }
    }

    /// Resolve once a stop is requested. Never resolves if every handle is gone.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run `fut` unless a stop arrives first.
    pub async fn race<F: Future>(&mut self, fut: F) -> Result<F::Output, Stopped> {
        self.check()?;
        tokio::select! {
            biased;
            () = self.stopped() => Err(Stopped),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration` unless a stop arrives first.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), Stopped> {
        self.race(tokio::time::sleep(duration)).await
    }
}
