//! Kernel state, configuration and the dispatch loop.
//!
//! The whole kernel is one explicitly-created context object. Its mutable
//! state sits behind a single short-held [`parking_lot::Mutex`], the Rust
//! stand-in for the brief interrupt-disable sections of an embedded
//! target: pure pointer/counter arithmetic happens under the lock, task
//! bodies and timer callbacks always run outside it.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::list::{ListArena, ListRef, NodeOwner, NodeRef};
use crate::task::{TaskControl, TaskFn, TaskId, TaskState};
use crate::timer::TimerControl;
use crate::Tick;

/// Callback injected between the two halves of an interruptible
/// operation, simulating an interrupt arriving at that point. Used by the
/// ring-buffer copy windows and the event registration protocol.
pub type ConcurrencyHook = Arc<dyn Fn() + Send + Sync>;

/// Sizing and behavior options for a kernel instance.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    max_priorities: u8,
    preemptive: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_priorities: 16,
            preemptive: false,
        }
    }
}

impl KernelConfig {
    /// Creates a new kernel configuration builder.
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    /// Number of priority levels (and therefore task slots).
    pub fn max_priorities(&self) -> u8 {
        self.max_priorities
    }

    /// Whether the outermost scheduler unlock re-enters the dispatch loop.
    pub fn preemptive(&self) -> bool {
        self.preemptive
    }
}

/// Builder for ergonomic kernel configuration construction.
#[derive(Debug, Clone, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    /// Sets the number of priority levels.
    pub fn max_priorities(mut self, max: u8) -> Self {
        self.config.max_priorities = max;
        self
    }

    /// Enables or disables preemption on scheduler unlock.
    pub fn preemptive(mut self, preemptive: bool) -> Self {
        self.config.preemptive = preemptive;
        self
    }

    /// Builds the kernel configuration.
    pub fn build(self) -> KernelConfig {
        self.config
    }
}

/// Errors reported when creating tasks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("priority {priority} exceeds supported range 0..{limit}")]
    InvalidPriority { priority: u8, limit: u8 },
    #[error("priority {0} already has a task")]
    PriorityInUse(u8),
}

pub(crate) struct KernelState {
    pub(crate) arena: ListArena,
    pub(crate) tasks: Vec<Option<TaskControl>>,
    pub(crate) current: Option<TaskId>,
    pub(crate) tick: Tick,
    pub(crate) delayed_ticks: Tick,
    pub(crate) lock_depth: u8,
    /// The two delay lists; `epoch` indexes the not-yet-overflowed one.
    pub(crate) delay_lists: [ListRef; 2],
    pub(crate) epoch: usize,
    /// Tasks unblocked while the scheduler was locked, awaiting promotion.
    pub(crate) pending_ready: ListRef,
    pub(crate) timers: Vec<TimerControl>,
    /// Armed timers ordered by absolute expiry tick.
    pub(crate) timer_list: ListRef,
    /// Started/reset timers not yet positioned in `timer_list`.
    pub(crate) timer_pending: ListRef,
    /// Service-task scan position; the `timer_list` sentinel when idle.
    pub(crate) timer_cursor: NodeRef,
    pub(crate) timer_task: Option<TaskId>,
}

/// The kernel context: task table, tick time base, scheduler and timers.
///
/// Created once via [`Kernel::new`]; never torn down. All kernel and
/// primitive operations are methods on (or take) this object.
pub struct Kernel {
    config: KernelConfig,
    pub(crate) state: Mutex<KernelState>,
    concurrency_hook: Mutex<Option<ConcurrencyHook>>,
}

impl Kernel {
    /// Creates a kernel with the given configuration.
    ///
    /// The scheduler starts held; call [`Kernel::start`] once setup is
    /// complete.
    pub fn new(config: KernelConfig) -> Arc<Self> {
        let mut arena = ListArena::new();
        let delay_lists = [arena.create_list(), arena.create_list()];
        let pending_ready = arena.create_list();
        let timer_list = arena.create_list();
        let timer_pending = arena.create_list();
        let timer_cursor = arena.sentinel(timer_list);
        let tasks = (0..config.max_priorities).map(|_| None).collect();

        Arc::new(Self {
            config,
            state: Mutex::new(KernelState {
                arena,
                tasks,
                current: None,
                tick: 0,
                delayed_ticks: 0,
                // Held until start() so setup code cannot be preempted.
                lock_depth: 1,
                delay_lists,
                epoch: 0,
                pending_ready,
                timers: Vec::new(),
                timer_list,
                timer_pending,
                timer_cursor,
                timer_task: None,
            }),
            concurrency_hook: Mutex::new(None),
        })
    }

    /// Releases the initial scheduler hold taken by [`Kernel::new`].
    pub fn start(&self) {
        self.unlock_scheduler();
    }

    /// Returns the kernel configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Registers a task at `priority`. The task starts Ready and is
    /// dispatched by [`Kernel::schedule`].
    pub fn create_task<F>(&self, priority: u8, func: F) -> Result<TaskId, KernelError>
    where
        F: Fn(&Kernel) + Send + Sync + 'static,
    {
        self.create_task_arc(priority, Arc::new(func))
    }

    pub(crate) fn create_task_arc(&self, priority: u8, func: TaskFn) -> Result<TaskId, KernelError> {
        if priority >= self.config.max_priorities {
            return Err(KernelError::InvalidPriority {
                priority,
                limit: self.config.max_priorities,
            });
        }
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let slot = priority as usize;
        if st.tasks[slot].is_some() {
            return Err(KernelError::PriorityInUse(priority));
        }
        let id = TaskId(priority);
        let node_delay = st.arena.create_node(NodeOwner::Task(id));
        let node_event = st.arena.create_node(NodeOwner::Task(id));
        st.tasks[slot] = Some(TaskControl {
            state: TaskState::Ready,
            func,
            node_delay,
            node_event,
            pend_amount: 0,
        });
        log::debug!("task created at priority {priority}");
        Ok(id)
    }

    /// Dispatch pass: runs Ready tasks strictly more urgent than the
    /// caller (all tasks when idle) until none remain. A task that returns
    /// without blocking stays Ready and runs again within the same pass.
    /// Returns immediately while the scheduler is locked.
    pub fn schedule(&self) {
        loop {
            let next = {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                if st.lock_depth != 0 {
                    return;
                }
                let bound = st.current.map_or(self.config.max_priorities, |t| t.0);
                let mut next = None;
                for slot in 0..bound as usize {
                    if let Some(task) = st.tasks[slot].as_mut() {
                        if task.state == TaskState::Ready {
                            task.state = TaskState::Running;
                            let func = Arc::clone(&task.func);
                            let prev = st.current;
                            st.current = Some(TaskId(slot as u8));
                            next = Some((TaskId(slot as u8), func, prev));
                            break;
                        }
                    }
                }
                next
            };
            let Some((id, func, prev)) = next else { break };

            log::trace!("dispatching priority {}", id.0);
            func(self);

            let mut guard = self.state.lock();
            let st = &mut *guard;
            if let Some(task) = st.tasks[id.0 as usize].as_mut() {
                if task.state == TaskState::Running {
                    task.state = TaskState::Ready;
                }
            }
            st.current = prev;
        }
    }

    /// Advances kernel time by one tick. Safe from any context: the tick
    /// is deferred behind the scheduler lock and replayed on the way out,
    /// which is immediate when the scheduler was unlocked.
    pub fn tick(&self) {
        self.lock_scheduler();
        {
            let mut st = self.state.lock();
            st.delayed_ticks = st.delayed_ticks.wrapping_add(1);
        }
        self.unlock_scheduler();
    }

    /// Current value of the wrapping tick counter.
    pub fn tick_count(&self) -> Tick {
        self.state.lock().tick
    }

    /// Increments the scheduler lock nesting counter.
    pub fn lock_scheduler(&self) {
        let mut st = self.state.lock();
        assert!(st.lock_depth < u8::MAX, "scheduler lock depth overflow");
        st.lock_depth += 1;
    }

    /// Unwinds one level of scheduler lock. The outermost unlock replays
    /// every deferred tick (each may wake delayed tasks and, on a counter
    /// wrap, swaps the delay lists), then promotes everything parked on
    /// the pending-ready list. With preemption configured, it finishes by
    /// re-entering the dispatch loop.
    pub fn unlock_scheduler(&self) {
        let reschedule = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            assert!(st.lock_depth > 0, "scheduler unlock without matching lock");
            if st.lock_depth == 1 {
                while st.delayed_ticks != 0 {
                    st.delayed_ticks -= 1;
                    Self::advance_tick(st);
                }
                while let Some(node) = st.arena.head(st.pending_ready) {
                    match st.arena.owner(node) {
                        NodeOwner::Task(id) => Self::make_ready(st, id),
                        _ => panic!("pending-ready list holds a non-task node"),
                    }
                }
            }
            st.lock_depth -= 1;
            st.lock_depth == 0 && self.config.preemptive
        };
        if reschedule {
            self.schedule();
        }
    }

    /// Whether the scheduler lock is currently held at any depth.
    pub fn scheduler_locked(&self) -> bool {
        self.state.lock().lock_depth != 0
    }

    /// Blocks the current task for `ticks`. Zero is a no-op. The wake tick
    /// is absolute; a sum that wraps lands the task in the overflowed
    /// delay list so cross-wrap ordering stays correct.
    ///
    /// # Panics
    ///
    /// Panics when no task is running.
    pub fn delay(&self, ticks: Tick) {
        self.lock_scheduler();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let id = match st.current {
                Some(id) => id,
                None => panic!("delay requires a running task"),
            };
            if ticks != 0 {
                let wake = st.tick.wrapping_add(ticks);
                let epoch = if wake < st.tick { st.epoch ^ 1 } else { st.epoch };
                let delay_list = st.delay_lists[epoch];
                let node = {
                    let task = Self::control_mut(st, id);
                    task.state = TaskState::Blocked;
                    task.node_delay
                };
                if st.arena.is_listed(node) {
                    st.arena.remove(node);
                }
                st.arena.insert_ordered(delay_list, node, wake);
            }
        }
        self.unlock_scheduler();
    }

    /// Returns `task` to Ready, unconditionally clearing any delay or
    /// event membership. Used for explicit resume; delay expiry and event
    /// satisfaction go through the same path internally.
    pub fn resume(&self, task: TaskId) {
        self.lock_scheduler();
        {
            let mut guard = self.state.lock();
            Self::make_ready(&mut guard, task);
        }
        self.unlock_scheduler();
    }

    /// The task currently being dispatched, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.state.lock().current
    }

    /// Priority of the current task, if any.
    pub fn current_priority(&self) -> Option<u8> {
        self.current_task().map(|t| t.0)
    }

    /// Overrides the current-task reference. Interrupt handlers and test
    /// harnesses use this to issue kernel calls on behalf of a task.
    ///
    /// # Panics
    ///
    /// Panics when `task` names a slot that was never created.
    pub fn set_current_task(&self, task: Option<TaskId>) {
        let mut st = self.state.lock();
        if let Some(id) = task {
            let _ = Self::control(&st, id);
        }
        st.current = task;
    }

    /// Scheduling state of `task`.
    pub fn task_state(&self, task: TaskId) -> TaskState {
        Self::control(&self.state.lock(), task).state
    }

    /// Installs the simulated-concurrency hook.
    pub fn set_concurrency_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.concurrency_hook.lock() = Some(Arc::new(hook));
    }

    /// Removes the simulated-concurrency hook.
    pub fn clear_concurrency_hook(&self) {
        *self.concurrency_hook.lock() = None;
    }

    /// Runs the simulated-concurrency hook, if installed. Called at the
    /// points where a real target would re-enable interrupts mid-way
    /// through an operation.
    pub fn concurrency_point(&self) {
        let hook = self.concurrency_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn control<'a>(st: &'a KernelState, id: TaskId) -> &'a TaskControl {
        match st.tasks[id.0 as usize].as_ref() {
            Some(task) => task,
            None => panic!("task priority {} was never created", id.0),
        }
    }

    pub(crate) fn control_mut<'a>(st: &'a mut KernelState, id: TaskId) -> &'a mut TaskControl {
        match st.tasks[id.0 as usize].as_mut() {
            Some(task) => task,
            None => panic!("task priority {} was never created", id.0),
        }
    }

    /// Clears delay/event membership and marks the task Ready.
    pub(crate) fn make_ready(st: &mut KernelState, id: TaskId) {
        let (node_event, node_delay) = {
            let task = Self::control(st, id);
            (task.node_event, task.node_delay)
        };
        if st.arena.is_listed(node_event) {
            st.arena.remove(node_event);
        }
        if st.arena.is_listed(node_delay) {
            st.arena.remove(node_delay);
        }
        Self::control_mut(st, id).state = TaskState::Ready;
    }

    /// One replayed tick: bump the counter, handle wrap (delay-list swap
    /// and timer-cursor rewind), wake every delayed task that came due.
    fn advance_tick(st: &mut KernelState) {
        st.tick = st.tick.wrapping_add(1);
        if st.tick == 0 {
            st.epoch ^= 1;
            let sentinel = st.arena.sentinel(st.timer_list);
            st.timer_cursor = st.arena.next(sentinel);
            log::debug!("tick counter wrapped; delay lists swapped");
        }
        let delay_list = st.delay_lists[st.epoch];
        while let Some(node) = st.arena.head(delay_list) {
            if st.arena.value(node) > st.tick {
                break;
            }
            match st.arena.owner(node) {
                NodeOwner::Task(id) => Self::make_ready(st, id),
                _ => panic!("delay list holds a non-task node"),
            }
        }
    }
}
