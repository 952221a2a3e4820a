//! Counting semaphore with an upper bound.

use std::sync::Arc;

use parking_lot::Mutex as StateLock;
use tickos_kernel::{EventList, Kernel, Tick};

struct SemaphoreInner {
    count: usize,
    max: usize,
}

/// Counting semaphore bounded by a maximum count.
///
/// [`Semaphore::take`] and [`Semaphore::give`] never block; a take on an
/// empty semaphore or a give on a full one simply fails. Tasks that want
/// to wait for a count use [`Semaphore::pend`] or [`Semaphore::take_pend`].
pub struct Semaphore {
    kernel: Arc<Kernel>,
    inner: StateLock<SemaphoreInner>,
    waiters: EventList,
}

impl Semaphore {
    /// Creates a semaphore with `count` initial units and a ceiling of
    /// `max`.
    ///
    /// # Panics
    ///
    /// Panics if `count > max`.
    pub fn new(kernel: &Arc<Kernel>, count: usize, max: usize) -> Self {
        assert!(
            count <= max,
            "semaphore initial count {count} exceeds maximum {max}"
        );
        Self {
            kernel: Arc::clone(kernel),
            inner: StateLock::new(SemaphoreInner { count, max }),
            waiters: kernel.create_event_list(),
        }
    }

    /// Consumes one unit if any is available.
    pub fn take(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// Returns one unit and wakes the most urgent waiter. Fails when the
    /// count is already at its maximum.
    pub fn give(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.count >= inner.max {
                return false;
            }
            inner.count += 1;
        }
        self.kernel.lock_scheduler();
        self.kernel.event_unblock(self.waiters);
        self.kernel.unlock_scheduler();
        true
    }

    /// Registers the current task as a waiter for up to `ticks`, but only
    /// while the count is zero; pending with units available is a no-op,
    /// as is `ticks == 0`.
    pub fn pend(&self, ticks: Tick) {
        if ticks == 0 {
            return;
        }
        self.kernel.lock_scheduler();
        let parked = self
            .kernel
            .event_pre_pend_if(self.waiters, 1, || self.inner.lock().count == 0);
        if parked {
            self.kernel.concurrency_point();
            self.kernel.event_pend(self.waiters, ticks);
        }
        self.kernel.unlock_scheduler();
    }

    /// Take attempt composed with a pend on failure. Returns the attempt's
    /// outcome.
    pub fn take_pend(&self, ticks: Tick) -> bool {
        let taken = self.take();
        if !taken {
            self.pend(ticks);
        }
        taken
    }

    /// Units currently available.
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// Configured maximum count.
    pub fn max(&self) -> usize {
        self.inner.lock().max
    }

    /// Number of tasks waiting for a unit.
    pub fn waiters(&self) -> usize {
        self.kernel.event_waiters(self.waiters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickos_kernel::{KernelConfig, TaskId, TaskState};

    fn fixture(count: usize, max: usize) -> (Arc<Kernel>, Semaphore, TaskId) {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.start();
        let sem = Semaphore::new(&kernel, count, max);
        let task = kernel.create_task(0, |_| {}).unwrap();
        (kernel, sem, task)
    }

    #[test]
    fn reports_initial_count_and_max() {
        let (_, sem, _) = fixture(2, 3);
        assert_eq!(sem.count(), 2);
        assert_eq!(sem.max(), 3);
        assert_eq!(sem.waiters(), 0);
    }

    #[test]
    #[should_panic(expected = "exceeds maximum")]
    fn rejects_count_above_max() {
        let kernel = Kernel::new(KernelConfig::default());
        Semaphore::new(&kernel, 4, 3);
    }

    #[test]
    fn take_consumes_until_empty() {
        let (_, sem, _) = fixture(2, 2);
        assert!(sem.take());
        assert!(sem.take());
        assert!(!sem.take());
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn give_fails_at_max() {
        let (_, sem, _) = fixture(1, 2);
        assert!(sem.give());
        assert!(!sem.give());
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn pend_zero_ticks_is_a_no_op() {
        let (kernel, sem, task) = fixture(0, 1);
        kernel.set_current_task(Some(task));
        sem.pend(0);
        assert_eq!(sem.waiters(), 0);
        assert_eq!(kernel.task_state(task), TaskState::Ready);
    }

    #[test]
    fn pend_blocks_only_when_empty() {
        let (kernel, sem, task) = fixture(1, 1);
        kernel.set_current_task(Some(task));
        sem.pend(1);
        assert_eq!(sem.waiters(), 0);

        sem.take();
        sem.pend(1);
        assert_eq!(sem.waiters(), 1);
        assert_eq!(kernel.task_state(task), TaskState::Blocked);
    }

    #[test]
    fn take_pend_reports_attempt_outcome() {
        let (kernel, sem, task) = fixture(1, 1);
        kernel.set_current_task(Some(task));
        assert!(sem.take_pend(1));
        assert_eq!(sem.waiters(), 0);

        assert!(!sem.take_pend(1));
        assert_eq!(sem.waiters(), 1);
        assert_eq!(kernel.task_state(task), TaskState::Blocked);
    }

    #[test]
    fn give_wakes_the_waiter() {
        let (kernel, sem, task) = fixture(0, 1);
        kernel.set_current_task(Some(task));
        sem.pend(1);
        kernel.set_current_task(None);

        assert!(sem.give());
        assert_eq!(sem.waiters(), 0);
        assert_eq!(kernel.task_state(task), TaskState::Ready);
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn pend_timeout_returns_waiter_to_ready() {
        let (kernel, sem, task) = fixture(0, 1);
        kernel.set_current_task(Some(task));
        sem.pend(2);
        kernel.set_current_task(None);

        kernel.tick();
        assert_eq!(kernel.task_state(task), TaskState::Blocked);
        kernel.tick();
        assert_eq!(kernel.task_state(task), TaskState::Ready);
        assert_eq!(sem.waiters(), 0);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn infinite_pend_suspends_without_a_timeout() {
        let (kernel, sem, task) = fixture(0, 1);
        kernel.set_current_task(Some(task));
        sem.pend(tickos_kernel::MAX_DELAY);
        kernel.set_current_task(None);

        assert_eq!(kernel.task_state(task), TaskState::Suspended);
        kernel.tick();
        assert_eq!(kernel.task_state(task), TaskState::Suspended);

        sem.give();
        assert_eq!(kernel.task_state(task), TaskState::Ready);
    }

    #[test]
    fn give_between_pend_phases_claims_the_parked_waiter() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.start();
        let sem = Arc::new(Semaphore::new(&kernel, 0, 1));
        let task = kernel.create_task(0, |_| {}).unwrap();
        kernel.set_current_task(Some(task));

        let racer = Arc::clone(&sem);
        kernel.set_concurrency_hook(move || {
            racer.give();
        });

        sem.pend(1);
        assert_eq!(sem.waiters(), 0);
        assert_eq!(kernel.task_state(task), TaskState::Ready);
    }
}
