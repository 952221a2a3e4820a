//! # tickos-sync - Blocking Synchronization Primitives
//!
//! Synchronization and IPC primitives built on the kernel's blocking-event
//! protocol:
//!
//! - **Mutex**: recursive mutual exclusion with owner tracking
//! - **Semaphore**: counting semaphore with a maximum
//! - **Fifo**: concurrent byte ring buffer, safe against one
//!   interrupt-level operation without full mutual exclusion
//! - **Queue**: typed single-item-granularity variant of the FIFO
//!
//! All primitives share the same blocking model: plain operations never
//! block (capacity conditions come back as `bool`/counts/`Option`), and
//! the `pend` family registers the calling task as a waiter to be woken —
//! most urgent first — when the condition is satisfied.

use core::fmt;

mod fifo;
mod mutex;
mod queue;
mod semaphore;

pub use fifo::Fifo;
pub use mutex::Mutex;
pub use queue::Queue;
pub use semaphore::Semaphore;

/// Error types for synchronization primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// Unlock attempted by a context that does not own the mutex.
    NotOwner,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOwner => write!(f, "mutex is not owned by the caller"),
        }
    }
}

impl std::error::Error for SyncError {}
