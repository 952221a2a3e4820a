//! Typed message queue.

use std::sync::Arc;

use parking_lot::Mutex as StateLock;
use tickos_kernel::{EventList, Kernel, Tick};

struct QueueCtrl {
    capacity: usize,
    used: usize,
    free: usize,
    head: usize,
    tail: usize,
    /// Item counts reserved by in-flight writes/reads, folded into
    /// `used`/`free` by the outermost commit.
    wlock: usize,
    rlock: usize,
}

/// Typed ring of whole items, one item per operation.
///
/// Follows the same reserve/copy/commit protocol as [`crate::Fifo`], so a
/// concurrent interrupt-level write or read interleaves safely with one
/// task-level operation on the same side.
pub struct Queue<T> {
    kernel: Arc<Kernel>,
    ctrl: StateLock<QueueCtrl>,
    data: StateLock<Box<[Option<T>]>>,
    read_event: EventList,
    write_event: EventList,
}

impl<T> Queue<T> {
    /// Creates an empty queue holding up to `capacity` items.
    pub fn new(kernel: &Arc<Kernel>, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            kernel: Arc::clone(kernel),
            ctrl: StateLock::new(QueueCtrl {
                capacity,
                used: 0,
                free: capacity,
                head: 0,
                tail: 0,
                wlock: 0,
                rlock: 0,
            }),
            data: StateLock::new(slots.into_boxed_slice()),
            read_event: kernel.create_event_list(),
            write_event: kernel.create_event_list(),
        }
    }

    /// Enqueues `item`, or hands it back when the queue is full. Never
    /// blocks.
    pub fn write(&self, item: T) -> Result<(), T> {
        let (pos, outer) = {
            let mut ctrl = self.ctrl.lock();
            if ctrl.free == 0 {
                return Err(item);
            }
            let pos = ctrl.tail;
            ctrl.tail = (ctrl.tail + 1) % ctrl.capacity;
            ctrl.free -= 1;
            let outer = ctrl.wlock == 0;
            ctrl.wlock += 1;
            (pos, outer)
        };

        self.kernel.concurrency_point();
        self.data.lock()[pos] = Some(item);

        if outer {
            let visible = {
                let mut ctrl = self.ctrl.lock();
                ctrl.used += ctrl.wlock;
                ctrl.wlock = 0;
                ctrl.used
            };
            self.kernel.lock_scheduler();
            self.kernel.event_unblock_if(self.read_event, visible);
            self.kernel.unlock_scheduler();
        }
        Ok(())
    }

    /// Dequeues the oldest item, or `None` when the queue is empty. Never
    /// blocks.
    pub fn read(&self) -> Option<T> {
        let (pos, outer) = {
            let mut ctrl = self.ctrl.lock();
            if ctrl.used == 0 {
                return None;
            }
            let pos = ctrl.head;
            ctrl.head = (ctrl.head + 1) % ctrl.capacity;
            ctrl.used -= 1;
            let outer = ctrl.rlock == 0;
            ctrl.rlock += 1;
            (pos, outer)
        };

        self.kernel.concurrency_point();
        let item = self.data.lock()[pos].take();

        if outer {
            let visible = {
                let mut ctrl = self.ctrl.lock();
                ctrl.free += ctrl.rlock;
                ctrl.rlock = 0;
                ctrl.free
            };
            self.kernel.lock_scheduler();
            self.kernel.event_unblock_if(self.write_event, visible);
            self.kernel.unlock_scheduler();
        }
        item
    }

    /// Registers the current task to wait up to `ticks` for an item. A
    /// no-op when one is already queued or when `ticks` is zero.
    pub fn pend_read(&self, ticks: Tick) {
        if ticks == 0 {
            return;
        }
        self.kernel.lock_scheduler();
        let parked = self
            .kernel
            .event_pre_pend_if(self.read_event, 1, || self.ctrl.lock().used == 0);
        if parked {
            self.kernel.concurrency_point();
            self.kernel.event_pend(self.read_event, ticks);
        }
        self.kernel.unlock_scheduler();
    }

    /// Registers the current task to wait up to `ticks` for a free slot.
    /// A no-op when one is already free or when `ticks` is zero.
    pub fn pend_write(&self, ticks: Tick) {
        if ticks == 0 {
            return;
        }
        self.kernel.lock_scheduler();
        let parked = self
            .kernel
            .event_pre_pend_if(self.write_event, 1, || self.ctrl.lock().free == 0);
        if parked {
            self.kernel.concurrency_point();
            self.kernel.event_pend(self.write_event, ticks);
        }
        self.kernel.unlock_scheduler();
    }

    /// Read attempt composed with a pend when the queue was empty.
    pub fn read_pend(&self, ticks: Tick) -> Option<T> {
        let item = self.read();
        if item.is_none() {
            self.pend_read(ticks);
        }
        item
    }

    /// Write attempt composed with a pend when the queue was full.
    pub fn write_pend(&self, item: T, ticks: Tick) -> Result<(), T> {
        match self.write(item) {
            Ok(()) => Ok(()),
            Err(item) => {
                self.pend_write(ticks);
                Err(item)
            }
        }
    }

    /// Total queue capacity in items.
    pub fn capacity(&self) -> usize {
        self.ctrl.lock().capacity
    }

    /// Items currently queued.
    pub fn used(&self) -> usize {
        self.ctrl.lock().used
    }

    /// Free slots.
    pub fn free(&self) -> usize {
        self.ctrl.lock().free
    }

    /// Size of one item in bytes.
    pub fn item_size(&self) -> usize {
        core::mem::size_of::<T>()
    }

    /// Number of tasks waiting for an item.
    pub fn read_waiters(&self) -> usize {
        self.kernel.event_waiters(self.read_event)
    }

    /// Number of tasks waiting for a free slot.
    pub fn write_waiters(&self) -> usize {
        self.kernel.event_waiters(self.write_event)
    }
}
