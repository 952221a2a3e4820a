//! Task identifiers, states and control blocks.

use std::sync::Arc;

use crate::kernel::Kernel;
use crate::list::NodeRef;

/// Task identity. The priority doubles as a unique slot index, so two
/// tasks can never share a priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u8);

impl TaskId {
    /// The priority level this task occupies (lower = more urgent).
    pub fn priority(&self) -> u8 {
        self.0
    }
}

/// Scheduling state of a task.
///
/// `Ready → Running` on dispatch; back to `Ready` when the pass returns
/// without blocking, to `Blocked` on a finite delay or pend, to
/// `Suspended` on an infinite pend. Delay expiry, event satisfaction and
/// explicit resume all lead back to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Suspended,
}

/// Task body: invoked once per dispatch pass (run-to-completion).
pub type TaskFn = Arc<dyn Fn(&Kernel) + Send + Sync>;

/// Per-priority control block.
pub(crate) struct TaskControl {
    pub(crate) state: TaskState,
    pub(crate) func: TaskFn,
    /// Membership in one of the two delay lists, or detached.
    pub(crate) node_delay: NodeRef,
    /// Membership in an event or pending-ready list, or detached.
    pub(crate) node_event: NodeRef,
    /// Amount (bytes/items) the task waits for while pending on an event.
    pub(crate) pend_amount: usize,
}
