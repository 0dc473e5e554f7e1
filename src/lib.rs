#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![doc = include_str!("../README.md")]

pub mod config;
pub use config::{Config, DefaultConfig};

pub mod reentrant_lock;
pub use reentrant_lock::{Error, ReentrantLock};

pub mod reentrant_mutex;
pub use reentrant_mutex::{ReentrantMutex, ReentrantMutexGuard};

mod wait_queue;
mod waiter;

#[cfg(test)]
mod tests;
