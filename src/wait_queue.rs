//! Wait queue implementation.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::{NonNull, null, null_mut};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, fence};
#[cfg(not(feature = "loom"))]
use std::thread::yield_now;

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, fence};
#[cfg(feature = "loom")]
use loom::thread::yield_now;

use log::trace;

use crate::waiter::{Waiter, WaiterId};

/// Lock-free FIFO queue of waiting threads.
///
/// Nodes are pushed at the tail by any number of threads, while the head is only ever advanced by
/// the thread that has just acquired the lock owning the queue. The head is a sentinel: the node
/// right after it is the front waiter.
///
/// Former head nodes are retired rather than freed on the spot, because a releasing thread may
/// still be reading them. Readers are counted, and retired nodes are freed by the lock holder once
/// the count drops to zero.
pub(crate) struct WaitQueue {
    /// Sentinel node; written only by the lock holder.
    head: AtomicPtr<Node>,
    /// Most recently enqueued node.
    tail: AtomicPtr<Node>,
    /// Number of threads currently traversing nodes reachable from the head.
    readers: AtomicUsize,
    /// Former head nodes; accessed only by the lock holder.
    retired: UnsafeCell<Vec<NonNull<Node>>>,
}

/// Wait queue node.
#[derive(Debug)]
pub(crate) struct Node {
    /// The node that was the tail when this node was enqueued.
    prev: *const Node,
    /// The node that was enqueued right after this node.
    next: AtomicPtr<Node>,
    /// The waiting thread; `None` for the initial sentinel.
    waiter: Option<Waiter>,
    /// Set once the waiting thread has acquired the lock; it must not be woken afterwards.
    acquired: AtomicBool,
    /// Number of releasing threads that are about to wake the waiting thread.
    wakers: AtomicUsize,
}

/// Position of the calling thread in the [`WaitQueue`].
///
/// An [`Entry`] is created by [`WaitQueue::enqueue`] and consumed by [`WaitQueue::set_head`].
#[derive(Debug)]
pub(crate) struct Entry<'q> {
    /// The enqueued node.
    node: NonNull<Node>,
    /// The [`Entry`] cannot outlive the queue, nor be sent to another thread.
    _phantom: PhantomData<(&'q WaitQueue, *const ())>,
}

/// Announces a reader of the [`WaitQueue`] for its lifetime.
///
/// Nodes reachable from the head cannot be freed while a [`ReadGuard`] exists.
pub(crate) struct ReadGuard<'q> {
    /// The queue being read.
    queue: &'q WaitQueue,
}

impl WaitQueue {
    /// Creates an empty [`WaitQueue`] holding only a sentinel node.
    pub(crate) fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(Node {
            prev: null(),
            next: AtomicPtr::new(null_mut()),
            waiter: None,
            acquired: AtomicBool::new(true),
            wakers: AtomicUsize::new(0),
        }));
        Self {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            readers: AtomicUsize::new(0),
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    /// Appends the supplied waiter to the queue.
    ///
    /// Every losing tail swap is retried against the freshly observed tail, so the call always
    /// succeeds exactly once.
    pub(crate) fn enqueue(&self, waiter: Waiter) -> Entry<'_> {
        let node = Box::into_raw(Box::new(Node {
            prev: null(),
            next: AtomicPtr::new(null_mut()),
            waiter: Some(waiter),
            acquired: AtomicBool::new(false),
            wakers: AtomicUsize::new(0),
        }));
        let mut tail = self.tail.load(Acquire);
        loop {
            // The node is not visible to other threads until the tail swap succeeds.
            unsafe {
                (*node).prev = tail.cast_const();
            }
            match self
                .tail
                .compare_exchange_weak(tail, node, AcqRel, Acquire)
            {
                Ok(prev) => {
                    // `prev` cannot be retired before `node` becomes the head, and only the
                    // calling thread can make that happen.
                    unsafe {
                        (*prev).next.store(node, Release);
                    }
                    // Pairs with the fence in `ReentrantLock::release`: either the releaser sees
                    // the new link, or the caller sees the lock released.
                    fence(SeqCst);
                    trace!("enqueued {:?} after {prev:p}", unsafe { &(*node).waiter });
                    return Entry {
                        node: unsafe { NonNull::new_unchecked(node) },
                        _phantom: PhantomData,
                    };
                }
                Err(actual) => tail = actual,
            }
        }
    }

    /// Promotes the node of `entry` to be the new sentinel head, and retires the former head.
    ///
    /// Returns only after every releasing thread that may still wake the caller is done with it,
    /// so that no wake-up is delivered once the caller has left the queue.
    ///
    /// # Safety
    ///
    /// The caller must be the thread that enqueued `entry`, the entry must be the front of the
    /// queue, and the caller must have just acquired the lock owning this queue, so that no other
    /// thread can call this method concurrently.
    pub(crate) unsafe fn set_head(&self, entry: Entry<'_>) {
        let old_head = self.head.load(Relaxed);
        let node = entry.node.as_ptr();
        debug_assert_eq!(unsafe { (*node).prev }, old_head.cast_const());
        debug_assert_eq!(
            unsafe { (*node).waiter.as_ref().map(Waiter::id) },
            Some(WaiterId::current())
        );

        let node_ref = unsafe { &*node };
        node_ref.acquired.store(true, Relaxed);
        // Pairs with the fence in `ReadGuard::wake_head_successor`: either the waker sees the
        // flag, or this thread sees the waker.
        fence(SeqCst);
        while node_ref.wakers.load(Acquire) != 0 {
            yield_now();
        }

        self.head.store(node, Release);
        trace!("promoted {:?} to head", unsafe { &(*node).waiter });

        unsafe {
            (*old_head).next.store(null_mut(), Relaxed);
            (*self.retired.get()).push(NonNull::new_unchecked(old_head));
            self.reclaim();
        }
    }

    /// Frees retired nodes if no reader can reach them.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock owning this queue.
    pub(crate) unsafe fn reclaim(&self) {
        let retired = unsafe { &mut *self.retired.get() };
        if retired.is_empty() {
            return;
        }

        // Pairs with the fence in `ReadGuard::new`: a reader that is not counted here will load
        // the current head, which is never retired.
        fence(SeqCst);
        if self.readers.load(Acquire) == 0 {
            for node in retired.drain(..) {
                drop(unsafe { Box::from_raw(node.as_ptr()) });
            }
        }
    }

    /// Announces a reader.
    pub(crate) fn read(&self) -> ReadGuard<'_> {
        ReadGuard::new(self)
    }

    /// Returns `true` if any node follows the sentinel head.
    ///
    /// The result is only a hint, as the queue may be modified concurrently.
    pub(crate) fn has_queued_waiters(&self) -> bool {
        self.head.load(Acquire) != self.tail.load(Acquire)
    }

    /// Returns the number of nodes following the sentinel head.
    ///
    /// The result is only a hint, as the queue may be modified concurrently.
    pub(crate) fn len(&self) -> usize {
        let guard = self.read();
        let mut len = 0;
        let mut node = guard.head();
        loop {
            let next = node.next.load(Acquire);
            if next.is_null() {
                return len;
            }
            len += 1;
            node = unsafe { &*next };
        }
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        for node in self.retired.get_mut().drain(..) {
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }

        // No thread can be enqueued or reading anymore, so every link is in place.
        let mut node_ptr = self.head.load(Relaxed);
        while !node_ptr.is_null() {
            let node = unsafe { Box::from_raw(node_ptr) };
            node_ptr = node.next.load(Relaxed);
        }
    }
}

unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl Entry<'_> {
    /// Returns `true` if the entry is the front of the queue, that is, its predecessor is the
    /// current head.
    pub(crate) fn is_front(&self, queue: &WaitQueue) -> bool {
        let prev = unsafe { self.node.as_ref().prev };
        queue.head.load(Acquire).cast_const() == prev
    }
}

impl<'q> ReadGuard<'q> {
    /// Registers a reader of `queue`.
    fn new(queue: &'q WaitQueue) -> Self {
        queue.readers.fetch_add(1, Relaxed);
        fence(SeqCst);
        Self { queue }
    }

    /// Returns the current sentinel head.
    fn head(&self) -> &Node {
        unsafe { &*self.queue.head.load(Acquire) }
    }

    /// Returns the node right after the head, or `None` if the queue is empty.
    fn head_successor(&self) -> Option<&Node> {
        let next = self.head().next.load(Acquire);
        unsafe { next.as_ref() }
    }

    /// Wakes the waiter right after the head unless it has already acquired the lock.
    ///
    /// Returns `true` if a waiter was woken.
    pub(crate) fn wake_head_successor(&self) -> bool {
        let Some(node) = self.head_successor() else {
            return false;
        };
        let Some(waiter) = node.waiter.as_ref() else {
            return false;
        };
        node.wakers.fetch_add(1, Relaxed);
        fence(SeqCst);
        let woken = !node.acquired.load(Relaxed);
        if woken {
            trace!("waking {waiter:?}");
            waiter.wake();
        }
        node.wakers.fetch_sub(1, Release);
        woken
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.queue.readers.fetch_sub(1, Release);
    }
}
