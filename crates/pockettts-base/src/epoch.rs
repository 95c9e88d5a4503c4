use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// A shared epoch counter used as a cancellation token.
///
/// A caller hands the same `Epoch` to every stage of a generation. Calling
/// `advance()` invalidates every in-flight value stamped with an older
/// epoch; stages observe this cooperatively via `is_current()` at their
/// documented yield points instead of being interrupted.
#[derive(Clone, Debug)]
pub struct Epoch {
    value: Arc<AtomicU64>,
}

impl Epoch {
    pub fn new() -> Self {
        Self {
            value: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Get the current epoch value.
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Advance to the next epoch. Returns the new epoch value.
    pub fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Check if the given epoch is still current.
    pub fn is_current(&self, epoch: u64) -> bool {
        epoch == self.current()
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

/// A value stamped with the epoch it was produced in.
#[derive(Clone, Debug)]
pub struct Stamped<T> {
    pub epoch: u64,
    pub inner: T,
}
