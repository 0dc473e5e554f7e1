//! [`ReentrantLock`] is a reentrant, non-fair mutual exclusion primitive.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::Ordering::{self, Acquire, Relaxed, Release, SeqCst};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicUsize, fence};

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicUsize, fence};

use crate::config::{Config, DefaultConfig};
#[cfg(test)]
use crate::wait_queue::Entry;
use crate::wait_queue::WaitQueue;
use crate::waiter::{self, Waiter, WaiterId};

/// [`ReentrantLock`] is a reentrant, non-fair mutual exclusion primitive.
///
/// The thread holding the lock may acquire it again without blocking, and has to release it as
/// many times as it acquired it before another thread can take over. Contending threads are
/// parked in a lock-free FIFO wait queue and resumed one at a time in arrival order, however, a
/// thread that has not been queued yet may acquire the lock ahead of queued threads.
///
/// [`ReentrantLock`] only provides low-level acquire and release methods; see
/// [`ReentrantMutex`](crate::ReentrantMutex) for a scoped, data-protecting wrapper.
pub struct ReentrantLock<C: Config = DefaultConfig> {
    /// Reentrancy depth; `0` when unlocked.
    state: AtomicUsize,
    /// Identity of the owner thread; `0` when unlocked.
    owner: AtomicUsize,
    /// Threads waiting for the lock.
    wait_queue: WaitQueue,
    _config: PhantomData<C>,
}

/// Errors that can occur when releasing a [`ReentrantLock`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The calling thread does not hold the lock.
    NotOwner,
}

impl ReentrantLock {
    /// Creates a new unlocked [`ReentrantLock`] with the default configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = ReentrantLock::new();
    /// assert!(!lock.is_locked(Relaxed));
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_config()
    }
}

impl<C: Config> ReentrantLock<C> {
    /// Creates a new unlocked [`ReentrantLock`] with the configuration `C`.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::{Config, ReentrantLock};
    ///
    /// #[derive(Debug, Default)]
    /// struct Spin;
    ///
    /// impl Config for Spin {
    ///     fn spin_count() -> usize {
    ///         128
    ///     }
    /// }
    ///
    /// let lock: ReentrantLock<Spin> = ReentrantLock::with_config();
    /// lock.acquire();
    /// lock.release();
    /// ```
    #[inline]
    #[must_use]
    pub fn with_config() -> Self {
        Self {
            state: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            wait_queue: WaitQueue::new(),
            _config: PhantomData,
        }
    }

    /// Returns `true` if the lock is currently held by any thread.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = ReentrantLock::new();
    /// assert!(!lock.is_locked(Relaxed));
    ///
    /// lock.acquire();
    /// assert!(lock.is_locked(Relaxed));
    /// ```
    #[inline]
    #[must_use]
    pub fn is_locked(&self, mo: Ordering) -> bool {
        self.state.load(mo) != 0
    }

    /// Returns `true` if the calling thread holds the lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantLock;
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// let lock = Arc::new(ReentrantLock::new());
    /// lock.acquire();
    /// assert!(lock.is_held_by_current_thread());
    ///
    /// let lock_clone = lock.clone();
    /// thread::spawn(move || assert!(!lock_clone.is_held_by_current_thread()))
    ///     .join()
    ///     .unwrap();
    /// ```
    #[inline]
    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Relaxed) == WaiterId::current().to_raw()
    }

    /// Returns the number of times the calling thread has acquired the lock without releasing
    /// it, or `0` if it does not hold the lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantLock;
    ///
    /// let lock = ReentrantLock::new();
    /// assert_eq!(lock.hold_count(), 0);
    ///
    /// lock.acquire();
    /// lock.acquire();
    /// assert_eq!(lock.hold_count(), 2);
    ///
    /// lock.release();
    /// assert_eq!(lock.hold_count(), 1);
    /// ```
    #[inline]
    #[must_use]
    pub fn hold_count(&self) -> usize {
        if self.is_held_by_current_thread() {
            self.state.load(Relaxed)
        } else {
            0
        }
    }

    /// Returns `true` if any thread is waiting in the queue.
    ///
    /// The result is only a hint, as threads may enqueue or dequeue concurrently.
    #[inline]
    #[must_use]
    pub fn has_queued_threads(&self) -> bool {
        self.wait_queue.has_queued_waiters()
    }

    /// Returns the number of threads waiting in the queue.
    ///
    /// The result is only a hint, as threads may enqueue or dequeue concurrently.
    #[inline]
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.wait_queue.len()
    }

    /// Acquires the lock, blocking the calling thread until it is available.
    ///
    /// Returns immediately if the calling thread already holds the lock.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the lock [`usize::MAX`] times.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantLock;
    ///
    /// let lock = ReentrantLock::new();
    ///
    /// lock.acquire();
    /// lock.acquire();
    /// assert_eq!(lock.hold_count(), 2);
    ///
    /// lock.release();
    /// lock.release();
    /// assert_eq!(lock.hold_count(), 0);
    /// ```
    #[inline]
    pub fn acquire(&self) {
        let id = WaiterId::current();
        if self.try_acquire_internal(id) {
            return;
        }
        for spin in 0..C::spin_count() {
            C::backoff(spin);
            if self.try_claim(id) {
                return;
            }
        }
        self.acquire_slow(id);
    }

    /// Tries to acquire the lock without blocking.
    ///
    /// Returns `false` if another thread holds the lock. The calling thread does not queue up,
    /// and may acquire the lock even though other threads are waiting for it.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the lock [`usize::MAX`] times.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantLock;
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// let lock = Arc::new(ReentrantLock::new());
    /// assert!(lock.try_acquire());
    /// assert!(lock.try_acquire());
    ///
    /// let lock_clone = lock.clone();
    /// thread::spawn(move || assert!(!lock_clone.try_acquire()))
    ///     .join()
    ///     .unwrap();
    /// ```
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_internal(WaiterId::current())
    }

    /// Releases the lock once.
    ///
    /// The lock becomes available to other threads when it has been released as many times as it
    /// was acquired, at which point the first queued thread, if any, is resumed.
    ///
    /// The calling thread must hold the lock: the depth is decremented without synchronizing with
    /// other releasers. Debug builds assert this; use [`try_release`](Self::try_release) for a
    /// checked release.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantLock;
    /// use std::sync::atomic::Ordering::Relaxed;
    ///
    /// let lock = ReentrantLock::new();
    ///
    /// lock.acquire();
    /// lock.acquire();
    ///
    /// lock.release();
    /// assert!(lock.is_locked(Relaxed));
    ///
    /// lock.release();
    /// assert!(!lock.is_locked(Relaxed));
    /// ```
    #[inline]
    pub fn release(&self) {
        debug_assert!(
            self.is_held_by_current_thread(),
            "the lock is released by a thread that does not hold it"
        );
        self.release_internal();
    }

    /// Releases the lock once if the calling thread holds it.
    ///
    /// Returns the remaining depth, or [`Error::NotOwner`] if the calling thread does not hold the
    /// lock, in which case nothing is changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOwner`] if the calling thread does not hold the lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::{Error, ReentrantLock};
    ///
    /// let lock = ReentrantLock::new();
    /// assert_eq!(lock.try_release(), Err(Error::NotOwner));
    ///
    /// lock.acquire();
    /// lock.acquire();
    /// assert_eq!(lock.try_release(), Ok(1));
    /// assert_eq!(lock.try_release(), Ok(0));
    /// assert_eq!(lock.try_release(), Err(Error::NotOwner));
    /// ```
    #[inline]
    pub fn try_release(&self) -> Result<usize, Error> {
        if !self.is_held_by_current_thread() {
            return Err(Error::NotOwner);
        }
        Ok(self.release_internal())
    }

    /// Tries the reentrant fast path followed by the uncontended fast path.
    fn try_acquire_internal(&self, id: WaiterId) -> bool {
        if self.owner.load(Relaxed) == id.to_raw() {
            // Only the owner writes its own identity, and only the owner modifies a non-zero
            // state, so the depth cannot change underneath.
            let depth = self.state.load(Relaxed);
            debug_assert_ne!(depth, 0);
            assert_ne!(depth, usize::MAX, "reentrancy depth overflow");
            self.state.store(depth + 1, Relaxed);
            return true;
        }
        self.try_claim(id)
    }

    /// Tries to move the state from `0` to `1`, and records the calling thread as the owner on
    /// success.
    fn try_claim(&self, id: WaiterId) -> bool {
        if self
            .state
            .compare_exchange(0, 1, Acquire, Relaxed)
            .is_ok()
        {
            self.owner.store(id.to_raw(), Relaxed);
            return true;
        }
        false
    }

    /// Enqueues the calling thread and blocks until it acquires the lock as the queue front.
    #[cold]
    fn acquire_slow(&self, id: WaiterId) {
        let entry = self.wait_queue.enqueue(Waiter::current());
        loop {
            if entry.is_front(&self.wait_queue) && self.try_claim(id) {
                // SAFETY: this thread enqueued `entry`, which is the front, and has just acquired
                // the lock.
                unsafe {
                    self.wait_queue.set_head(entry);
                }
                return;
            }
            waiter::block();
        }
    }

    /// Decrements the depth, and resumes the front waiter if the lock became free.
    ///
    /// Returns the remaining depth.
    fn release_internal(&self) -> usize {
        let depth = self.state.load(Relaxed);
        debug_assert_ne!(depth, 0, "the lock is not held");
        if depth > 1 {
            self.state.store(depth - 1, Relaxed);
            return depth - 1;
        }

        // The identity must be cleared before the lock becomes available, otherwise it could
        // overwrite the identity of the next owner.
        self.owner.store(0, Relaxed);

        // SAFETY: the calling thread still holds the lock.
        unsafe {
            self.wait_queue.reclaim();
        }

        // The guard has to be taken while holding the lock, so that the next owner cannot free
        // the nodes being inspected.
        let guard = self.wait_queue.read();
        self.state.store(0, Release);

        // Pairs with the fence in `WaitQueue::enqueue`.
        fence(SeqCst);
        guard.wake_head_successor();
        0
    }
}

#[cfg(test)]
impl<C: Config> ReentrantLock<C> {
    /// Enqueues the calling thread without blocking it.
    pub(crate) fn test_enqueue(&self) -> Entry<'_> {
        self.wait_queue.enqueue(Waiter::current())
    }

    /// Acquires the lock on behalf of an entry created by [`Self::test_enqueue`] if it is the
    /// front of the queue and the lock is free.
    pub(crate) fn test_acquire_as_front(&self, entry: Entry<'_>) -> bool {
        if entry.is_front(&self.wait_queue) && self.try_claim(WaiterId::current()) {
            unsafe {
                self.wait_queue.set_head(entry);
            }
            return true;
        }
        false
    }
}

impl<C: Config> Default for ReentrantLock<C> {
    #[inline]
    fn default() -> Self {
        Self::with_config()
    }
}

impl<C: Config> fmt::Debug for ReentrantLock<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Relaxed);
        let owner = self.owner.load(Relaxed);
        f.debug_struct("ReentrantLock")
            .field("state", &state)
            .field("owner", &owner)
            .field("has_queued_threads", &self.has_queued_threads())
            .field("config", &C::default())
            .finish()
    }
}
