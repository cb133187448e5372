//! Fail-fast shutdown for a worker pool: CancellationToken + first-error slot.
//! Once tripped, workers stop claiming jobs; jobs already running finish.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Records the first failure of a batch and cancels its token.
/// Later failures are dropped; the earliest one wins.
pub struct ShutdownLatch<E> {
    token: CancellationToken,
    first_error: Mutex<Option<(usize, E)>>,
}

impl<E> ShutdownLatch<E> {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            first_error: Mutex::new(None),
        }
    }

    /// Latch that also trips when `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            first_error: Mutex::new(None),
        }
    }

    /// Store `error` for job `position` unless an earlier one is held, then
    /// cancel. Returns true if this call recorded the error.
    pub fn trip(&self, position: usize, error: E) -> bool {
        let recorded = {
            let mut slot = self.first_error.lock();
            if slot.is_none() {
                *slot = Some((position, error));
                true
            } else {
                false
            }
        };
        self.token.cancel();
        recorded
    }

    /// Cancel without an error (worker panic, external stop).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[inline]
    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn take_error(&self) -> Option<(usize, E)> {
        self.first_error.lock().take()
    }
}

impl<E> Default for ShutdownLatch<E> {
    fn default() -> Self {
        Self::new()
    }
}
