//! Blocking-event lists: the pend/unblock protocol shared by every
//! synchronization primitive.
//!
//! Registration is two-phase. `event_pre_pend_if` atomically checks the
//! primitive's blocking condition and, when it holds, parks the current
//! task at the head of the waiter list with the amount it waits for
//! already recorded; the caller may then open an interruptible window
//! (buffer copies, re-enabled interrupts) before `event_pend` relocates
//! the node to its priority-ordered position and records the delay. An
//! unblock arriving inside the window finds the parked node — judged by
//! its freshly recorded amount — and claims it; `event_pend` detects the
//! theft and backs off, so the waiter never sleeps through its own
//! wake-up.

use crate::kernel::Kernel;
use crate::list::{ListRef, NodeOwner};
use crate::task::TaskState;
use crate::{Tick, MAX_DELAY};

/// Opaque handle to one waiter list (one side of a blocking primitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventList {
    pub(crate) list: ListRef,
}

impl Kernel {
    /// Allocates a waiter list inside the kernel arena.
    pub fn create_event_list(&self) -> EventList {
        EventList {
            list: self.state.lock().arena.create_list(),
        }
    }

    /// Phase one of waiter registration: evaluates `condition` and, when
    /// it holds, records `amount` (what the waiter needs before a gated
    /// unblock may wake it) and parks the current task at the head of
    /// `event` so a concurrent unblock can already find it. Returns
    /// whether the task was parked. Condition, amount and park all happen
    /// under the kernel state lock, atomic against interrupt-level
    /// producers.
    ///
    /// # Panics
    ///
    /// Panics when no task is running or the task already waits on an
    /// event.
    pub fn event_pre_pend_if(
        &self,
        event: EventList,
        amount: usize,
        condition: impl FnOnce() -> bool,
    ) -> bool {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if !condition() {
            return false;
        }
        let id = match st.current {
            Some(id) => id,
            None => panic!("pend requires a running task"),
        };
        let node = {
            let task = Self::control_mut(st, id);
            task.pend_amount = amount;
            task.node_event
        };
        assert!(
            !st.arena.is_listed(node),
            "task priority {} already waits on an event",
            id.0
        );
        let sentinel = st.arena.sentinel(event.list);
        st.arena.insert_after(event.list, sentinel, node);
        true
    }

    /// Phase two: relocates the parked waiter to priority order (lower
    /// priority number = closer to the head) and blocks the task — into a
    /// delay list keyed by absolute wake tick, or with no delay membership
    /// for `ticks == MAX_DELAY` (suspended, infinite wait). Does nothing
    /// if an unblock already claimed the waiter between the phases.
    ///
    /// Callers hold the scheduler lock across both phases.
    pub fn event_pend(&self, event: EventList, ticks: Tick) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let id = match st.current {
            Some(id) => id,
            None => panic!("pend requires a running task"),
        };
        let node = Self::control(st, id).node_event;
        if st.arena.list_of(node) != Some(event.list) {
            // An unblock between the two phases already claimed the task.
            return;
        }
        st.arena.remove(node);
        st.arena.insert_ordered(event.list, node, Tick::from(id.0));

        let node_delay = Self::control(st, id).node_delay;
        if ticks == MAX_DELAY {
            Self::control_mut(st, id).state = TaskState::Suspended;
        } else {
            let wake = st.tick.wrapping_add(ticks);
            let epoch = if wake < st.tick { st.epoch ^ 1 } else { st.epoch };
            let delay_list = st.delay_lists[epoch];
            st.arena.insert_ordered(delay_list, node_delay, wake);
            Self::control_mut(st, id).state = TaskState::Blocked;
        }
    }

    /// Pops the head (most urgent) waiter, if any, onto the pending-ready
    /// list. Promotion to Ready happens when the scheduler lock fully
    /// unwinds, so this is safe from interrupt context mid-update.
    /// Callers hold the scheduler lock. Returns whether a waiter moved.
    pub fn event_unblock(&self, event: EventList) -> bool {
        let mut guard = self.state.lock();
        Self::unblock_head(&mut guard, event)
    }

    /// Like [`Kernel::event_unblock`], but only when `available` covers
    /// the amount the head waiter recorded when it parked.
    pub fn event_unblock_if(&self, event: EventList, available: usize) -> bool {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let head = match st.arena.head(event.list) {
            Some(head) => head,
            None => return false,
        };
        let required = match st.arena.owner(head) {
            NodeOwner::Task(id) => Self::control(st, id).pend_amount,
            _ => panic!("event list holds a non-task node"),
        };
        if available < required {
            return false;
        }
        Self::unblock_head(st, event)
    }

    /// Number of tasks waiting on `event`.
    pub fn event_waiters(&self, event: EventList) -> usize {
        self.state.lock().arena.len(event.list)
    }

    fn unblock_head(st: &mut crate::kernel::KernelState, event: EventList) -> bool {
        let head = match st.arena.head(event.list) {
            Some(head) => head,
            None => return false,
        };
        st.arena.remove(head);
        let sentinel = st.arena.sentinel(st.pending_ready);
        st.arena.insert_after(st.pending_ready, sentinel, head);
        true
    }
}
