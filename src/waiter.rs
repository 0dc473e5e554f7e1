//! Waiter handles: thread identity, blocking, and targeted resumption.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
#[cfg(not(feature = "loom"))]
use std::thread::{Thread, current, park};

#[cfg(feature = "loom")]
use loom::thread::{Thread, current, park};

/// Source of waiter identities; `0` is reserved for "no owner".
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

#[cfg(not(feature = "loom"))]
thread_local! {
    static ID: NonZeroUsize = next_id();
}

#[cfg(feature = "loom")]
loom::thread_local! {
    static ID: NonZeroUsize = next_id();
}

/// Opaque handle to a thread that can be blocked and later resumed.
pub(crate) struct Waiter {
    /// Thread to unpark.
    thread: Thread,
    /// Identity of the thread.
    id: WaiterId,
}

/// Equality-comparable identity of a thread, used for the ownership check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct WaiterId(NonZeroUsize);

impl Waiter {
    /// Creates a [`Waiter`] for the calling thread.
    pub(crate) fn current() -> Self {
        Self {
            thread: current(),
            id: WaiterId::current(),
        }
    }

    /// Returns the identity of the thread.
    pub(crate) const fn id(&self) -> WaiterId {
        self.id
    }

    /// Resumes the thread if it is blocked, or lets its next [`block`] return immediately.
    pub(crate) fn wake(&self) {
        self.thread.unpark();
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter").field("id", &self.id).finish()
    }
}

impl WaiterId {
    /// Returns the identity of the calling thread.
    #[inline]
    pub(crate) fn current() -> Self {
        Self(ID.with(|id| *id))
    }

    /// Converts the identity into the raw value stored in the owner field.
    #[inline]
    pub(crate) const fn to_raw(self) -> usize {
        self.0.get()
    }
}

/// Blocks the calling thread until it is woken.
///
/// The thread may also return spuriously, so callers must re-check their condition.
#[inline]
pub(crate) fn block() {
    park();
}

/// Allocates a fresh identity.
fn next_id() -> NonZeroUsize {
    let id = NEXT_ID.fetch_add(1, Relaxed);
    NonZeroUsize::new(id).unwrap_or(NonZeroUsize::MIN)
}
