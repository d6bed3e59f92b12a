//! Critical-section primitives shared by the kernels.
//!
//! The kernels keep every piece of scheduler state behind one [`Mutex`]. With
//! the `std` feature it is a `parking_lot::Mutex`; the `lock-free` feature
//! swaps in `spin::Mutex` for targets where parking is unavailable. Neither
//! variant poisons, so a fatal assertion raised while the lock is held leaves
//! the state reachable for post-mortem inspection.

use core::fmt;

pub use std::sync::Arc;

#[cfg(not(feature = "lock-free"))]
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;
#[cfg(feature = "lock-free")]
pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Platform-agnostic mutex wrapper.
pub struct Mutex<T> {
    #[cfg(not(feature = "lock-free"))]
    inner: parking_lot::Mutex<T>,
    #[cfg(feature = "lock-free")]
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex protecting the given value.
    pub fn new(value: T) -> Self {
        Self {
            #[cfg(not(feature = "lock-free"))]
            inner: parking_lot::Mutex::new(value),
            #[cfg(feature = "lock-free")]
            inner: spin::Mutex::new(value),
        }
    }

    /// Enters the critical section.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Enters the critical section only if nobody else holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => out.field("data", &&*guard),
            None => out.field("data", &format_args!("<locked>")),
        };
        out.finish()
    }
}
