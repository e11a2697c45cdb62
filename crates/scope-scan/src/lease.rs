//! Host execution leases.
//!
//! Some hosts suspend long-running work unless it holds a background
//! execution grant. The orchestrator asks a [`LeaseProvider`] for one when a
//! run starts and the [`ExecutionLease`] guard hands it back on every exit
//! path, including early returns and panics.

use std::sync::Arc;

use tracing::debug;

/// Opaque grant identifier issued by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken(pub u64);

/// Platform collaborator that grants execution time.
pub trait LeaseProvider: Send + Sync {
    /// Start a grant for the task named `label`.
    fn begin(&self, label: &str) -> LeaseToken;

    /// End a grant previously returned by [`begin`](Self::begin).
    fn end(&self, token: LeaseToken);
}

/// Provider for hosts without background restrictions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLeaseProvider;

impl LeaseProvider for NoopLeaseProvider {
    fn begin(&self, _label: &str) -> LeaseToken {
        LeaseToken(0)
    }

    fn end(&self, _token: LeaseToken) {}
}

/// RAII guard: the grant ends when this is dropped.
pub struct ExecutionLease {
    provider: Arc<dyn LeaseProvider>,
    token: LeaseToken,
}

impl ExecutionLease {
    /// Acquire a grant from `provider`.
    pub fn acquire(provider: Arc<dyn LeaseProvider>, label: &str) -> Self {
        let token = provider.begin(label);
        debug!(label, token = token.0, "execution lease acquired");
        Self { provider, token }
    }

    /// Grant identifier.
    pub fn token(&self) -> LeaseToken {
        self.token
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        self.provider.end(self.token);
        debug!(token = self.token.0, "execution lease released");
    }
}

impl std::fmt::Debug for ExecutionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLease")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        next: Mutex<u64>,
        open: Mutex<Vec<u64>>,
    }

    impl LeaseProvider for Recorder {
        fn begin(&self, _label: &str) -> LeaseToken {
            let mut next = self.next.lock();
            *next += 1;
            self.open.lock().push(*next);
            LeaseToken(*next)
        }

        fn end(&self, token: LeaseToken) {
            self.open.lock().retain(|t| *t != token.0);
        }
    }

    #[test]
    fn lease_released_on_drop() {
        let recorder = Arc::new(Recorder::default());
        {
            let lease = ExecutionLease::acquire(recorder.clone(), "scan");
            assert_eq!(lease.token(), LeaseToken(1));
            assert_eq!(*recorder.open.lock(), vec![1]);
        }
        assert!(recorder.open.lock().is_empty());
    }

    #[test]
    fn lease_released_on_early_return() {
        fn fails(provider: Arc<dyn LeaseProvider>) -> Result<(), &'static str> {
            let _lease = ExecutionLease::acquire(provider, "scan");
            Err("setup failed")
        }

        let recorder = Arc::new(Recorder::default());
        assert!(fails(recorder.clone()).is_err());
        assert!(recorder.open.lock().is_empty());
    }
}
