//! The in-flight guard and the cooperative cancellation flag.

use crate::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Marks a session as busy for as long as it lives.
///
/// Acquired at the start of a round (or an analysis) and released on drop,
/// so early returns and errors always free the session.
#[derive(Debug)]
pub struct RoundGuard {
    flag: Arc<AtomicBool>,
}

impl RoundGuard {
    /// Take the session, or fail with [`Error::Busy`] if another operation
    /// holds it.
    pub fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::Busy)?;
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for RoundGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// A shared stop signal, checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear a previous cancellation before new work starts.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy_until_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = RoundGuard::acquire(&flag).unwrap();
        assert!(matches!(RoundGuard::acquire(&flag), Err(Error::Busy)));
        drop(guard);
        assert!(RoundGuard::acquire(&flag).is_ok());
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());
        other.cancel();
        assert!(matches!(flag.check(), Err(Error::Cancelled)));
        flag.reset();
        assert!(!other.is_cancelled());
    }
}
