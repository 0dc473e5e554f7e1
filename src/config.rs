//! [`Config`] defines tuning options for [`ReentrantLock`](crate::ReentrantLock).

use std::fmt;
#[cfg(not(feature = "loom"))]
use std::thread::yield_now;

#[cfg(feature = "loom")]
use loom::thread::yield_now;

/// [`Config`] defines tuning options for [`ReentrantLock`](crate::ReentrantLock).
pub trait Config: fmt::Debug + Default {
    /// Defines the number of extra uncontended acquisition attempts made before the calling thread
    /// enqueues itself.
    ///
    /// Spinning does not change the locking semantics: a spinning thread barges exactly like a
    /// thread making its first attempt.
    #[inline]
    #[must_use]
    fn spin_count() -> usize {
        0
    }

    /// Defines the backoff function to use between spin attempts.
    #[inline]
    fn backoff(spin_count: usize) {
        if spin_count % 64 == 63 {
            yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Default configuration: enqueue as soon as both fast paths fail.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConfig;

impl Config for DefaultConfig {}
