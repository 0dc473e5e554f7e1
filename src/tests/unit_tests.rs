use std::cell::Cell;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::wait_queue::WaitQueue;
use crate::waiter::{self, Waiter};
use crate::{Config, Error, ReentrantLock, ReentrantMutex};

#[derive(Debug, Default)]
struct Spin;

impl Config for Spin {
    fn spin_count() -> usize {
        256
    }
}

/// Spins until `lock` has `len` queued threads.
fn wait_for_queue_length<C: Config>(lock: &ReentrantLock<C>, len: usize) {
    while lock.queue_length() < len {
        thread::yield_now();
    }
}

#[test]
fn reentrant_handoff() {
    let lock = Arc::new(ReentrantLock::new());
    let acquired = Arc::new(AtomicBool::new(false));

    lock.acquire();
    lock.acquire();
    assert_eq!(lock.hold_count(), 2);

    lock.release();
    assert_eq!(lock.hold_count(), 1);
    assert!(lock.is_held_by_current_thread());
    assert!(lock.is_locked(Relaxed));

    let lock_clone = lock.clone();
    let acquired_clone = acquired.clone();
    let thread = thread::spawn(move || {
        lock_clone.acquire();
        acquired_clone.store(true, Relaxed);
        assert_eq!(lock_clone.hold_count(), 1);
        assert!(lock_clone.is_held_by_current_thread());
        lock_clone.release();
    });

    wait_for_queue_length(&lock, 1);
    assert!(!acquired.load(Relaxed));

    lock.release();
    assert_eq!(lock.hold_count(), 0);
    assert!(!lock.is_held_by_current_thread());

    thread.join().unwrap();
    assert!(acquired.load(Relaxed));
    assert!(!lock.is_locked(Relaxed));
    assert!(!lock.has_queued_threads());
}

#[test]
fn nested_release_keeps_waiters_blocked() {
    let lock = Arc::new(ReentrantLock::new());
    let acquired = Arc::new(AtomicBool::new(false));

    lock.acquire();

    let lock_clone = lock.clone();
    let acquired_clone = acquired.clone();
    let thread = thread::spawn(move || {
        lock_clone.acquire();
        acquired_clone.store(true, Relaxed);
        lock_clone.release();
    });

    wait_for_queue_length(&lock, 1);
    for _ in 0..8 {
        lock.acquire();
    }
    for _ in 0..8 {
        lock.release();
        assert!(lock.is_held_by_current_thread());
    }
    thread::sleep(Duration::from_millis(10));
    assert!(!acquired.load(Relaxed));
    assert_eq!(lock.queue_length(), 1);

    lock.release();
    thread.join().unwrap();
    assert!(acquired.load(Relaxed));
}

#[test]
fn try_acquire_try_release() {
    let lock = Arc::new(ReentrantLock::new());
    assert_eq!(lock.try_release(), Err(Error::NotOwner));

    assert!(lock.try_acquire());
    assert!(lock.try_acquire());

    let lock_clone = lock.clone();
    thread::spawn(move || {
        assert!(!lock_clone.try_acquire());
        assert_eq!(lock_clone.try_release(), Err(Error::NotOwner));
        assert_eq!(lock_clone.hold_count(), 0);
    })
    .join()
    .unwrap();

    assert_eq!(lock.try_release(), Ok(1));
    assert_eq!(lock.try_release(), Ok(0));
    assert_eq!(lock.try_release(), Err(Error::NotOwner));
    assert!(!lock.is_locked(Relaxed));
}

#[test]
fn fifo_among_queued_threads() {
    let num_threads = if cfg!(miri) { 3 } else { 8 };

    let lock = Arc::new(ReentrantLock::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    lock.acquire();

    let mut threads = Vec::new();
    for i in 0..num_threads {
        let lock_clone = lock.clone();
        let order_clone = order.clone();
        threads.push(thread::spawn(move || {
            lock_clone.acquire();
            order_clone.lock().unwrap().push(i);
            lock_clone.release();
        }));
        wait_for_queue_length(&lock, i + 1);
    }

    lock.release();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), (0..num_threads).collect::<Vec<_>>());
}

#[test]
fn barging() {
    let lock = ReentrantLock::new();

    // The calling thread plays the part of a queued waiter that has not been resumed yet.
    let entry = lock.test_enqueue();
    assert!(lock.has_queued_threads());
    assert_eq!(lock.queue_length(), 1);

    // A new acquisition attempt wins even though a thread is queued.
    assert!(lock.try_acquire());
    assert!(lock.has_queued_threads());

    // The queued waiter cannot take over while the lock is held.
    lock.release();
    let entry_clone = lock.test_enqueue();
    assert_eq!(lock.queue_length(), 2);
    assert!(lock.try_acquire());
    assert!(!lock.test_acquire_as_front(entry_clone));
    lock.release();

    assert!(lock.test_acquire_as_front(entry));
    assert_eq!(lock.hold_count(), 1);
    assert_eq!(lock.queue_length(), 1);
    lock.release();
}

#[test]
fn barging_through_acquire() {
    let lock = Arc::new(ReentrantLock::new());

    // The calling thread plays the part of a queued waiter that has not been resumed yet.
    let entry = lock.test_enqueue();
    assert!(!lock.is_locked(Relaxed));

    let lock_clone = lock.clone();
    thread::spawn(move || {
        lock_clone.acquire();
        assert!(lock_clone.is_held_by_current_thread());
        assert_eq!(lock_clone.queue_length(), 1);
        lock_clone.release();
    })
    .join()
    .unwrap();

    assert!(lock.test_acquire_as_front(entry));
    assert_eq!(lock.hold_count(), 1);
    assert!(!lock.has_queued_threads());
    lock.release();
}

#[test]
fn barging_under_contention() {
    let max_rounds = if cfg!(miri) { 4 } else { 256 };

    let lock = Arc::new(ReentrantLock::new());
    let mut barged = false;
    for _ in 0..max_rounds {
        lock.acquire();
        let lock_clone = lock.clone();
        let thread = thread::spawn(move || {
            lock_clone.acquire();
            lock_clone.release();
        });
        wait_for_queue_length(&lock, 1);

        // The woken waiter has to be scheduled before it can claim the lock, so reacquiring
        // right away usually wins while it is still queued.
        lock.release();
        if lock.try_acquire() {
            barged = lock.has_queued_threads();
            lock.release();
        }
        thread.join().unwrap();
        if barged {
            break;
        }
    }
    assert!(barged);
    assert!(!lock.is_locked(Relaxed));
    assert!(!lock.has_queued_threads());
}

#[test]
fn mutual_exclusion() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 1024 };

    let lock = Arc::new(ReentrantLock::new());
    let check = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for i in 0..num_threads {
        let lock = lock.clone();
        let check = check.clone();
        threads.push(thread::spawn(move || {
            for j in 0..num_iters {
                lock.acquire();
                assert_eq!(check.fetch_add(1, Relaxed), 0);
                let depth = (i + j) % 3;
                for _ in 0..depth {
                    lock.acquire();
                }
                assert_eq!(lock.hold_count(), depth + 1);
                if j % 17 == 0 {
                    thread::sleep(Duration::from_micros(1));
                }
                for _ in 0..depth {
                    lock.release();
                }
                assert_eq!(check.fetch_sub(1, Relaxed), 1);
                lock.release();
            }
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(check.load(Relaxed), 0);
    assert!(!lock.is_locked(Relaxed));
    assert!(!lock.has_queued_threads());
}

#[test]
fn mutual_exclusion_spin() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 1024 };

    let lock: Arc<ReentrantLock<Spin>> = Arc::new(ReentrantLock::with_config());
    let check = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let lock = lock.clone();
        let check = check.clone();
        threads.push(thread::spawn(move || {
            for _ in 0..num_iters {
                lock.acquire();
                assert_eq!(check.fetch_add(1, Relaxed), 0);
                check.fetch_sub(1, Relaxed);
                lock.release();
            }
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(check.load(Relaxed), 0);
}

#[test]
fn no_lost_wakeups() {
    let num_iters = if cfg!(miri) { 16 } else { 4096 };

    let lock = Arc::new(ReentrantLock::new());
    let turn = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for parity in 0..2 {
        let lock = lock.clone();
        let turn = turn.clone();
        threads.push(thread::spawn(move || {
            let mut done = 0;
            while done < num_iters {
                lock.acquire();
                if turn.load(Relaxed) % 2 == parity {
                    turn.fetch_add(1, Relaxed);
                    done += 1;
                }
                lock.release();
            }
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(turn.load(Relaxed), num_iters * 2);
}

#[test]
fn reentrant_mutex() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 256 };

    let mutex = Arc::new(ReentrantMutex::new(Cell::new(0_usize)));

    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let mutex = mutex.clone();
        threads.push(thread::spawn(move || {
            for _ in 0..num_iters {
                let outer = mutex.lock();
                let inner = mutex.try_lock().unwrap();
                inner.set(inner.get() + 1);
                drop(inner);
                outer.set(outer.get() + 1);
                assert_eq!(mutex.raw().hold_count(), 1);
            }
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }

    let mutex = Arc::into_inner(mutex).unwrap();
    assert_eq!(mutex.into_inner().get(), num_threads * num_iters * 2);
}

#[test]
fn wake_head_successor() {
    let queue = WaitQueue::new();
    assert!(!queue.read().wake_head_successor());

    let entry = queue.enqueue(Waiter::current());
    assert!(entry.is_front(&queue));
    assert!(queue.read().wake_head_successor());
    // Consumes the pending wake-up.
    waiter::block();

    unsafe {
        queue.set_head(entry);
    }
    assert!(!queue.has_queued_waiters());
    assert!(!queue.read().wake_head_successor());
}

#[test]
fn debug_output() {
    let lock = ReentrantLock::new();
    lock.acquire();
    let output = format!("{lock:?}");
    assert!(output.contains("state: 1"));
    assert!(output.contains("has_queued_threads: false"));
    lock.release();

    let mutex = ReentrantMutex::new(7);
    assert!(format!("{mutex:?}").contains("data: 7"));
    let guard = mutex.lock();
    assert_eq!(format!("{guard:?}"), "7");
}
