//! [`ReentrantMutex`] protects data with a [`ReentrantLock`] and scoped guards.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

use crate::config::{Config, DefaultConfig};
use crate::reentrant_lock::ReentrantLock;

/// A reentrant mutual exclusion primitive protecting shared data of type `T`.
///
/// The same thread may hold several guards at once, therefore guards only give out shared
/// references; use interior mutability, e.g., [`Cell`](std::cell::Cell) or
/// [`RefCell`](std::cell::RefCell), to modify the data.
///
/// # Examples
///
/// ```
/// use relock::ReentrantMutex;
/// use std::cell::RefCell;
///
/// let mutex = ReentrantMutex::new(RefCell::new(Vec::new()));
///
/// let outer = mutex.lock();
/// outer.borrow_mut().push(1);
/// {
///     let inner = mutex.lock();
///     inner.borrow_mut().push(2);
/// }
/// assert_eq!(*outer.borrow(), vec![1, 2]);
/// ```
pub struct ReentrantMutex<T: ?Sized, C: Config = DefaultConfig> {
    /// The lock protecting `data`.
    lock: ReentrantLock<C>,
    /// The protected data.
    data: T,
}

/// An RAII implementation of a scoped reentrant lock.
///
/// The lock is released when the guard is dropped. The guard cannot be sent to another thread,
/// as only the owner thread may release the lock.
#[must_use = "if unused the ReentrantMutex will immediately unlock"]
pub struct ReentrantMutexGuard<'m, T: ?Sized, C: Config = DefaultConfig> {
    /// The locked mutex.
    mutex: &'m ReentrantMutex<T, C>,
    /// The guard must be dropped on the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl<T> ReentrantMutex<T> {
    /// Creates a new [`ReentrantMutex`] with the default configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantMutex;
    ///
    /// let mutex = ReentrantMutex::new(0);
    /// assert_eq!(*mutex.lock(), 0);
    /// ```
    #[inline]
    pub fn new(data: T) -> Self {
        Self::with_config(data)
    }
}

impl<T, C: Config> ReentrantMutex<T, C> {
    /// Creates a new [`ReentrantMutex`] with the configuration `C`.
    #[inline]
    pub fn with_config(data: T) -> Self {
        Self {
            lock: ReentrantLock::with_config(),
            data,
        }
    }

    /// Consumes the mutex, returning the protected data.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantMutex;
    ///
    /// let mutex = ReentrantMutex::new(String::from("data"));
    /// assert_eq!(mutex.into_inner(), "data");
    /// ```
    #[inline]
    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T: ?Sized, C: Config> ReentrantMutex<T, C> {
    /// Acquires the mutex, blocking the calling thread until it is available.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the lock [`usize::MAX`] times.
    #[inline]
    pub fn lock(&self) -> ReentrantMutexGuard<'_, T, C> {
        self.lock.acquire();
        ReentrantMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Tries to acquire the mutex without blocking.
    ///
    /// Returns `None` if another thread holds the mutex.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the lock [`usize::MAX`] times.
    ///
    /// # Examples
    ///
    /// ```
    /// use relock::ReentrantMutex;
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// let mutex = Arc::new(ReentrantMutex::new(0));
    /// let guard = mutex.try_lock().unwrap();
    ///
    /// let mutex_clone = mutex.clone();
    /// thread::spawn(move || assert!(mutex_clone.try_lock().is_none()))
    ///     .join()
    ///     .unwrap();
    ///
    /// drop(guard);
    /// ```
    #[inline]
    pub fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, T, C>> {
        self.lock.try_acquire().then(|| ReentrantMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Returns a mutable reference to the data.
    ///
    /// No locking is needed, since the mutable borrow guarantees exclusive access.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Returns a reference to the underlying [`ReentrantLock`].
    #[inline]
    pub fn raw(&self) -> &ReentrantLock<C> {
        &self.lock
    }
}

impl<T: Default, C: Config> Default for ReentrantMutex<T, C> {
    #[inline]
    fn default() -> Self {
        Self::with_config(T::default())
    }
}

impl<T: ?Sized + fmt::Debug, C: Config> fmt::Debug for ReentrantMutex<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ReentrantMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish_non_exhaustive()
    }
}

// Only the owner thread can observe the data at any time.
unsafe impl<T: ?Sized + Send, C: Config + Sync> Sync for ReentrantMutex<T, C> {}

impl<T: ?Sized, C: Config> Deref for ReentrantMutexGuard<'_, T, C> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.mutex.data
    }
}

impl<T: ?Sized, C: Config> Drop for ReentrantMutexGuard<'_, T, C> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}

impl<T: ?Sized + fmt::Debug, C: Config> fmt::Debug for ReentrantMutexGuard<'_, T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
