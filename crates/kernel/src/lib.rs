//! # tickos-kernel - Fixed-Priority Real-Time Kernel Core
//!
//! A preemptive, fixed-priority kernel core for single-core targets:
//! run-to-completion tasks, a tick-driven delay mechanism, a blocking-event
//! protocol shared by every synchronization primitive, and software timers
//! serviced by a dedicated task.
//!
//! ## Architecture
//!
//! **Tasks**: one per priority level, dispatched run-to-completion. A task
//! is a closure invoked once per scheduler pass; blocking means recording
//! the wait and returning to the dispatch loop, never suspending
//! mid-function.
//!
//! **Scheduler lock**: a nesting counter. While held, tick processing is
//! deferred and unblocked tasks park on a pending-ready list; the outermost
//! unlock replays deferred ticks and promotes parked tasks.
//!
//! **Events**: priority-ordered waiter lists with a two-phase registration
//! protocol that tolerates an interrupt-level unblock arriving between the
//! phases.
//!
//! ## Module Overview
//!
//! - [`kernel`] - kernel state, configuration and the dispatch loop
//! - [`task`] - task identifiers, states and control blocks
//! - [`event`] - blocking-event lists consumed by the sync primitives
//! - [`timer`] - periodic/auto-stop/one-shot software timers

mod list;

pub mod event;
pub mod kernel;
pub mod task;
pub mod timer;

pub use event::EventList;
pub use kernel::{ConcurrencyHook, Kernel, KernelConfig, KernelConfigBuilder, KernelError};
pub use task::{TaskFn, TaskId, TaskState};
pub use timer::{Timer, TimerFn, TimerId, TimerKind};

/// Kernel time unit: a wrapping counter driven by a periodic interrupt.
pub type Tick = u16;

/// Largest representable delay; doubles as the "wait forever" sentinel for
/// event pends.
pub const MAX_DELAY: Tick = Tick::MAX;
