//! Software timers serviced by a dedicated task.
//!
//! Armed timers sit in a list ordered by absolute expiry tick; timers that
//! were just started or reset park on an unordered pending list and are
//! positioned lazily by the next service pass (so a timer started from
//! inside another timer's callback never reorders the list mid-scan).
//! The service task scans through an explicit cursor that is re-validated
//! on every mutation, because callbacks may reset themselves, stop other
//! timers, or advance the tick while the scan is underway.

use std::sync::Arc;

use crate::kernel::{Kernel, KernelError, KernelState};
use crate::list::{NodeOwner, NodeRef};
use crate::task::TaskId;
use crate::{Tick, MAX_DELAY};

/// Timer identity, stable for the life of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) usize);

/// What the service task does with a timer it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Re-armed after every invocation.
    Periodic,
    /// Left armed; the callback is expected to call `stop` itself.
    AutoStop,
    /// Disarmed immediately before the callback runs.
    OneShot,
}

/// Timer callback, invoked by the service task outside the kernel lock.
pub type TimerFn = Arc<dyn Fn(&Kernel, TimerId) + Send + Sync>;

pub(crate) struct TimerControl {
    pub(crate) kind: TimerKind,
    pub(crate) period: Tick,
    pub(crate) func: TimerFn,
    pub(crate) node: NodeRef,
}

enum Pass {
    Fire {
        id: TimerId,
        func: TimerFn,
        kind: TimerKind,
        node: NodeRef,
    },
    Sleep(Tick),
}

impl Kernel {
    /// Registers a timer. It starts stopped; arm it with
    /// [`Kernel::timer_start`] or [`Kernel::timer_reset`].
    pub fn create_timer<F>(&self, kind: TimerKind, period: Tick, func: F) -> TimerId
    where
        F: Fn(&Kernel, TimerId) + Send + Sync + 'static,
    {
        let mut st = self.state.lock();
        let id = TimerId(st.timers.len());
        let node = st.arena.create_node(NodeOwner::Timer(id));
        st.timers.push(TimerControl {
            kind,
            period,
            func: Arc::new(func),
            node,
        });
        id
    }

    /// Creates the dedicated timer-service task at `priority`.
    pub fn create_timer_task(&self, priority: u8) -> Result<TaskId, KernelError> {
        let id = self.create_task(priority, |kernel: &Kernel| kernel.timer_service())?;
        self.state.lock().timer_task = Some(id);
        Ok(id)
    }

    /// Arms a stopped timer: parks it on the pending list at Value 0 and
    /// wakes the service task. No-op when the timer is already running.
    pub fn timer_start(&self, id: TimerId) {
        self.lock_scheduler();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let node = st.timers[id.0].node;
            if !st.arena.is_listed(node) {
                st.arena.set_value(node, 0);
                st.arena.append(st.timer_pending, node);
                Self::wake_timer_service(st);
            }
        }
        self.unlock_scheduler();
    }

    /// Re-arms a timer for a fresh period: detaches it from wherever it
    /// is and parks it on the pending list, leaving its last computed
    /// expiry Value in place until the service pass positions it.
    pub fn timer_reset(&self, id: TimerId) {
        self.lock_scheduler();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let node = st.timers[id.0].node;
            Self::timer_detach(st, node);
            st.arena.append(st.timer_pending, node);
            Self::wake_timer_service(st);
        }
        self.unlock_scheduler();
    }

    /// Disarms a timer. Its expiry Value is left as last computed, not
    /// cleared. No-op when the timer is not running.
    pub fn timer_stop(&self, id: TimerId) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let node = st.timers[id.0].node;
        Self::timer_detach(st, node);
    }

    /// Whether the timer is armed (positioned or pending).
    pub fn timer_is_running(&self, id: TimerId) -> bool {
        let st = self.state.lock();
        st.arena.is_listed(st.timers[id.0].node)
    }

    /// Last computed absolute expiry tick. Stays stale after a stop.
    pub fn timer_expiry(&self, id: TimerId) -> Tick {
        let st = self.state.lock();
        st.arena.value(st.timers[id.0].node)
    }

    /// One full service pass, then a delay until the next expiry. Runs as
    /// the body of the task created by [`Kernel::create_timer_task`].
    fn timer_service(&self) {
        loop {
            let step = {
                let mut guard = self.state.lock();
                let st = &mut *guard;

                if let Some(node) = st.arena.head(st.timer_pending) {
                    let id = match st.arena.owner(node) {
                        NodeOwner::Timer(id) => id,
                        _ => panic!("timer pending list holds a non-timer node"),
                    };
                    st.arena.remove(node);
                    let due = st.tick.wrapping_add(st.timers[id.0].period);
                    Self::timer_position(st, node, due);
                    continue;
                }

                let sentinel = st.arena.sentinel(st.timer_list);
                let cursor = st.timer_cursor;
                if cursor != sentinel && st.arena.value(cursor) <= st.tick {
                    st.timer_cursor = st.arena.next(cursor);
                    let id = match st.arena.owner(cursor) {
                        NodeOwner::Timer(id) => id,
                        _ => panic!("timer list holds a non-timer node"),
                    };
                    let control = &st.timers[id.0];
                    let kind = control.kind;
                    let func = Arc::clone(&control.func);
                    if kind == TimerKind::OneShot {
                        st.arena.remove(cursor);
                    }
                    Pass::Fire {
                        id,
                        func,
                        kind,
                        node: cursor,
                    }
                } else {
                    let sleep = if cursor != sentinel {
                        st.arena.value(cursor).wrapping_sub(st.tick)
                    } else if let Some(head) = st.arena.head(st.timer_list) {
                        // Everything left expires after the wrap.
                        let distance = st.arena.value(head).wrapping_sub(st.tick);
                        if distance == 0 {
                            MAX_DELAY
                        } else {
                            distance
                        }
                    } else {
                        MAX_DELAY
                    };
                    Pass::Sleep(sleep)
                }
            };

            match step {
                Pass::Fire {
                    id,
                    func,
                    kind,
                    node,
                } => {
                    log::trace!("timer {} fired", id.0);
                    func(self, id);
                    if kind == TimerKind::Periodic {
                        // Re-arm only if the callback left it positioned.
                        let untouched = {
                            let st = self.state.lock();
                            st.arena.list_of(node) == Some(st.timer_list)
                        };
                        if untouched {
                            self.timer_reset(id);
                        }
                    }
                }
                Pass::Sleep(ticks) => {
                    self.delay(ticks);
                    break;
                }
            }
        }
    }

    /// Cursor-aware removal: a timer being detached out from under the
    /// scan advances the cursor to its successor first.
    fn timer_detach(st: &mut KernelState, node: NodeRef) {
        if st.arena.is_listed(node) {
            if st.timer_cursor == node {
                st.timer_cursor = st.arena.next(node);
            }
            st.arena.remove(node);
        }
    }

    /// Ordered insert into the expiry list, split around the cursor:
    /// expiries that wrap past the current tick belong to the next epoch
    /// and sort into the already-scanned segment before the cursor;
    /// everything else sorts from the cursor onward (ties after), and an
    /// insert ahead of the cursor moves the cursor onto the new node.
    fn timer_position(st: &mut KernelState, node: NodeRef, due: Tick) {
        let list = st.timer_list;
        let sentinel = st.arena.sentinel(list);
        st.arena.set_value(node, due);

        if due < st.tick {
            let mut after = sentinel;
            let mut walk = st.arena.next(sentinel);
            while walk != sentinel && walk != st.timer_cursor && st.arena.value(walk) <= due {
                after = walk;
                walk = st.arena.next(walk);
            }
            st.arena.insert_after(list, after, node);
        } else if st.timer_cursor == sentinel {
            st.arena.append(list, node);
            st.timer_cursor = node;
        } else {
            let mut after = st.arena.prev(st.timer_cursor);
            let mut walk = st.timer_cursor;
            while walk != sentinel && st.arena.value(walk) <= due {
                after = walk;
                walk = st.arena.next(walk);
            }
            st.arena.insert_after(list, after, node);
            if st.arena.value(st.timer_cursor) > due {
                st.timer_cursor = node;
            }
        }
    }

    fn wake_timer_service(st: &mut KernelState) {
        if let Some(task) = st.timer_task {
            Self::make_ready(st, task);
        }
    }
}

/// Handle pairing a timer with its kernel, for callers that prefer
/// methods over kernel-wide calls.
#[derive(Clone)]
pub struct Timer {
    kernel: Arc<Kernel>,
    id: TimerId,
}

impl Timer {
    /// Registers a new timer on `kernel`.
    pub fn new<F>(kernel: &Arc<Kernel>, kind: TimerKind, period: Tick, func: F) -> Self
    where
        F: Fn(&Kernel, TimerId) + Send + Sync + 'static,
    {
        let id = kernel.create_timer(kind, period, func);
        Self {
            kernel: Arc::clone(kernel),
            id,
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn start(&self) {
        self.kernel.timer_start(self.id);
    }

    pub fn stop(&self) {
        self.kernel.timer_stop(self.id);
    }

    pub fn reset(&self) {
        self.kernel.timer_reset(self.id);
    }

    pub fn is_running(&self) -> bool {
        self.kernel.timer_is_running(self.id)
    }

    /// Last computed absolute expiry tick.
    pub fn expiry(&self) -> Tick {
        self.kernel.timer_expiry(self.id)
    }
}
