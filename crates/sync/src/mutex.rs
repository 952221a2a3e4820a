//! Recursive mutual exclusion with owner tracking.

use std::sync::Arc;

use parking_lot::Mutex as StateLock;
use tickos_kernel::{EventList, Kernel, TaskId, Tick};

use crate::SyncError;

struct MutexInner {
    count: usize,
    owner: Option<TaskId>,
}

/// Mutual exclusion lock for tasks, recursive for its owner.
///
/// Locking never blocks: a contended [`Mutex::try_lock`] simply fails, and
/// callers that want to wait use [`Mutex::pend`] or [`Mutex::lock_pend`].
/// The owner is whatever `current_task()` was at lock time — an ownerless
/// context (interrupt level, `None`) is itself a valid owner identity.
pub struct Mutex {
    kernel: Arc<Kernel>,
    inner: StateLock<MutexInner>,
    waiters: EventList,
}

impl Mutex {
    /// Creates an unlocked mutex on `kernel`.
    pub fn new(kernel: &Arc<Kernel>) -> Self {
        Self {
            kernel: Arc::clone(kernel),
            inner: StateLock::new(MutexInner {
                count: 0,
                owner: None,
            }),
            waiters: kernel.create_event_list(),
        }
    }

    /// Takes the lock if it is free or already held by the caller,
    /// incrementing the recursion count. Fails without blocking when
    /// another task owns it.
    pub fn try_lock(&self) -> bool {
        let caller = self.kernel.current_task();
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            inner.count = 1;
            inner.owner = caller;
            true
        } else if inner.owner == caller {
            inner.count += 1;
            true
        } else {
            false
        }
    }

    /// Releases one level of the lock. At count zero the ownership clears
    /// and the single most urgent waiter, if any, is woken.
    pub fn unlock(&self) -> Result<(), SyncError> {
        let caller = self.kernel.current_task();
        let released = {
            let mut inner = self.inner.lock();
            if inner.count == 0 || inner.owner != caller {
                return Err(SyncError::NotOwner);
            }
            inner.count -= 1;
            if inner.count == 0 {
                inner.owner = None;
                true
            } else {
                false
            }
        };
        if released {
            self.kernel.lock_scheduler();
            self.kernel.event_unblock(self.waiters);
            self.kernel.unlock_scheduler();
        }
        Ok(())
    }

    /// Registers the current task as a waiter for up to `ticks`, but only
    /// when the mutex is held by a different task; pending on an unlocked
    /// or self-owned mutex is a no-op, as is `ticks == 0`.
    pub fn pend(&self, ticks: Tick) {
        if ticks == 0 {
            return;
        }
        let caller = self.kernel.current_task();
        self.kernel.lock_scheduler();
        let parked = self.kernel.event_pre_pend_if(self.waiters, 1, || {
            let inner = self.inner.lock();
            inner.count != 0 && inner.owner != caller
        });
        if parked {
            self.kernel.concurrency_point();
            self.kernel.event_pend(self.waiters, ticks);
        }
        self.kernel.unlock_scheduler();
    }

    /// Lock attempt composed with a pend on failure. Returns the attempt's
    /// outcome.
    pub fn lock_pend(&self, ticks: Tick) -> bool {
        let locked = self.try_lock();
        if !locked {
            self.pend(ticks);
        }
        locked
    }

    /// Current recursion depth (0 = unlocked).
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// Current owner while locked.
    pub fn owner(&self) -> Option<TaskId> {
        let inner = self.inner.lock();
        if inner.count == 0 {
            None
        } else {
            inner.owner
        }
    }

    /// Number of tasks waiting for the lock.
    pub fn waiters(&self) -> usize {
        self.kernel.event_waiters(self.waiters)
    }
}
