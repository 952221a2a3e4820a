//! Concurrent byte ring buffer.

use std::sync::Arc;

use log::trace;
use parking_lot::Mutex as StateLock;
use tickos_kernel::{EventList, Kernel, Tick};

struct FifoCtrl {
    capacity: usize,
    used: usize,
    free: usize,
    head: usize,
    tail: usize,
    /// Byte amounts reserved by in-flight writes/reads, folded into
    /// `used`/`free` by the outermost commit. These accumulate accepted
    /// byte counts, not a nesting depth.
    wlock: usize,
    rlock: usize,
}

/// Byte FIFO safe against one concurrent interrupt-level operation.
///
/// Each side of the buffer reserves its region under the control lock,
/// copies with the lock released, then commits. While an operation is in
/// flight its bytes are tracked in a side counter (`wlock`/`rlock`)
/// instead of the shared fill level, so a nested operation on the same
/// side can proceed and the outermost one publishes everything at once.
/// Readers therefore never observe half-copied bytes as available, and
/// writers never observe half-drained space as free.
pub struct Fifo {
    kernel: Arc<Kernel>,
    ctrl: StateLock<FifoCtrl>,
    data: StateLock<Box<[u8]>>,
    read_event: EventList,
    write_event: EventList,
}

impl Fifo {
    /// Creates an empty FIFO holding up to `capacity` bytes.
    pub fn new(kernel: &Arc<Kernel>, capacity: usize) -> Self {
        Self {
            kernel: Arc::clone(kernel),
            ctrl: StateLock::new(FifoCtrl {
                capacity,
                used: 0,
                free: capacity,
                head: 0,
                tail: 0,
                wlock: 0,
                rlock: 0,
            }),
            data: StateLock::new(vec![0u8; capacity].into_boxed_slice()),
            read_event: kernel.create_event_list(),
            write_event: kernel.create_event_list(),
        }
    }

    /// Writes as much of `buf` as fits and returns the number of bytes
    /// accepted. Never blocks.
    pub fn write(&self, buf: &[u8]) -> usize {
        // Reserve: claim the region and advance the shared cursor so a
        // concurrent writer lands behind this one.
        let (accepted, pos, outer) = {
            let mut ctrl = self.ctrl.lock();
            let accepted = buf.len().min(ctrl.free);
            if accepted == 0 {
                return 0;
            }
            let pos = ctrl.tail;
            ctrl.tail = (ctrl.tail + accepted) % ctrl.capacity;
            ctrl.free -= accepted;
            let outer = ctrl.wlock == 0;
            ctrl.wlock += accepted;
            (accepted, pos, outer)
        };

        self.kernel.concurrency_point();
        self.copy_in(pos, &buf[..accepted]);

        if outer {
            // Commit: publish every write that completed while this one
            // was in flight, then wake a reader that can now make progress.
            let visible = {
                let mut ctrl = self.ctrl.lock();
                ctrl.used += ctrl.wlock;
                ctrl.wlock = 0;
                ctrl.used
            };
            trace!("fifo write committed, {visible} bytes readable");
            self.kernel.lock_scheduler();
            self.kernel.event_unblock_if(self.read_event, visible);
            self.kernel.unlock_scheduler();
        }
        accepted
    }

    /// Reads up to `buf.len()` bytes and returns the number copied out.
    /// Never blocks.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let (accepted, pos, outer) = {
            let mut ctrl = self.ctrl.lock();
            let accepted = buf.len().min(ctrl.used);
            if accepted == 0 {
                return 0;
            }
            let pos = ctrl.head;
            ctrl.head = (ctrl.head + accepted) % ctrl.capacity;
            ctrl.used -= accepted;
            let outer = ctrl.rlock == 0;
            ctrl.rlock += accepted;
            (accepted, pos, outer)
        };

        self.kernel.concurrency_point();
        self.copy_out(pos, &mut buf[..accepted]);

        if outer {
            let visible = {
                let mut ctrl = self.ctrl.lock();
                ctrl.free += ctrl.rlock;
                ctrl.rlock = 0;
                ctrl.free
            };
            trace!("fifo read committed, {visible} bytes writable");
            self.kernel.lock_scheduler();
            self.kernel.event_unblock_if(self.write_event, visible);
            self.kernel.unlock_scheduler();
        }
        accepted
    }

    /// Registers the current task to wait up to `ticks` for `length`
    /// readable bytes. A no-op when the bytes are already available or
    /// when `length` or `ticks` is zero.
    pub fn pend_read(&self, length: usize, ticks: Tick) {
        if length == 0 || ticks == 0 {
            return;
        }
        self.kernel.lock_scheduler();
        let parked = self
            .kernel
            .event_pre_pend_if(self.read_event, length, || self.ctrl.lock().used < length);
        if parked {
            self.kernel.concurrency_point();
            self.kernel.event_pend(self.read_event, ticks);
        }
        self.kernel.unlock_scheduler();
    }

    /// Registers the current task to wait up to `ticks` for `length`
    /// bytes of free space. A no-op when the space is already available
    /// or when `length` or `ticks` is zero.
    pub fn pend_write(&self, length: usize, ticks: Tick) {
        if length == 0 || ticks == 0 {
            return;
        }
        self.kernel.lock_scheduler();
        let parked = self
            .kernel
            .event_pre_pend_if(self.write_event, length, || self.ctrl.lock().free < length);
        if parked {
            self.kernel.concurrency_point();
            self.kernel.event_pend(self.write_event, ticks);
        }
        self.kernel.unlock_scheduler();
    }

    /// Read attempt composed with a pend when nothing was copied.
    pub fn read_pend(&self, buf: &mut [u8], ticks: Tick) -> usize {
        let accepted = self.read(buf);
        if accepted == 0 {
            self.pend_read(buf.len(), ticks);
        }
        accepted
    }

    /// Write attempt composed with a pend when nothing was accepted.
    pub fn write_pend(&self, buf: &[u8], ticks: Tick) -> usize {
        let accepted = self.write(buf);
        if accepted == 0 {
            self.pend_write(buf.len(), ticks);
        }
        accepted
    }

    /// Total buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.ctrl.lock().capacity
    }

    /// Bytes currently readable.
    pub fn used(&self) -> usize {
        self.ctrl.lock().used
    }

    /// Bytes currently writable.
    pub fn free(&self) -> usize {
        self.ctrl.lock().free
    }

    /// Number of tasks waiting for readable bytes.
    pub fn read_waiters(&self) -> usize {
        self.kernel.event_waiters(self.read_event)
    }

    /// Number of tasks waiting for free space.
    pub fn write_waiters(&self) -> usize {
        self.kernel.event_waiters(self.write_event)
    }

    fn copy_in(&self, pos: usize, src: &[u8]) {
        let mut data = self.data.lock();
        let first = src.len().min(data.len() - pos);
        data[pos..pos + first].copy_from_slice(&src[..first]);
        data[..src.len() - first].copy_from_slice(&src[first..]);
    }

    fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        let first = dst.len().min(data.len() - pos);
        let rest = dst.len() - first;
        dst[..first].copy_from_slice(&data[pos..pos + first]);
        dst[first..].copy_from_slice(&data[..rest]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tickos_kernel::{KernelConfig, TaskId, TaskState};

    fn fixture(capacity: usize) -> (Arc<Kernel>, Arc<Fifo>, TaskId) {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.start();
        let fifo = Arc::new(Fifo::new(&kernel, capacity));
        let task = kernel.create_task(0, |_| {}).unwrap();
        (kernel, fifo, task)
    }

    #[test]
    fn starts_empty() {
        let (_, fifo, _) = fixture(3);
        assert_eq!(fifo.capacity(), 3);
        assert_eq!(fifo.used(), 0);
        assert_eq!(fifo.free(), 3);
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let (_, fifo, _) = fixture(3);
        assert_eq!(fifo.write(b"abc"), 3);
        assert_eq!(fifo.used(), 3);
        assert_eq!(fifo.free(), 0);

        let mut out = [0u8; 3];
        assert_eq!(fifo.read(&mut out), 3);
        assert_eq!(&out, b"abc");
        assert_eq!(fifo.read(&mut out), 0);
    }

    #[test]
    fn write_accepts_a_partial_fit() {
        let (_, fifo, _) = fixture(3);
        fifo.write(b"abc");
        let mut out = [0u8; 2];
        assert_eq!(fifo.read(&mut out), 2);

        // Only two slots are free, so one byte of "def" is rejected.
        assert_eq!(fifo.write(b"def"), 2);
        let mut rest = [0u8; 3];
        assert_eq!(fifo.read(&mut rest), 3);
        assert_eq!(&rest, b"cde");
    }

    #[test]
    fn write_to_full_buffer_accepts_nothing() {
        let (_, fifo, _) = fixture(3);
        assert_eq!(fifo.write(b"abc"), 3);
        assert_eq!(fifo.write(b"d"), 0);
        assert_eq!(fifo.used(), 3);
    }

    #[test]
    fn data_wraps_around_the_buffer_end() {
        let (_, fifo, _) = fixture(4);
        fifo.write(b"abcd");
        let mut out = [0u8; 3];
        fifo.read(&mut out);
        // Head is now at 3; this write spans the end of the storage.
        assert_eq!(fifo.write(b"efg"), 3);

        let mut all = [0u8; 4];
        assert_eq!(fifo.read(&mut all), 4);
        assert_eq!(&all, b"defg");
    }

    #[test]
    fn read_into_empty_slice_is_a_no_op() {
        let (_, fifo, _) = fixture(3);
        fifo.write(b"ab");
        let mut out = [0u8; 0];
        assert_eq!(fifo.read(&mut out), 0);
        assert_eq!(fifo.used(), 2);
    }

    #[test]
    fn pend_read_blocks_until_enough_bytes() {
        let (kernel, fifo, task) = fixture(3);
        fifo.write(b"a");
        kernel.set_current_task(Some(task));
        fifo.pend_read(2, 10);
        kernel.set_current_task(None);
        assert_eq!(fifo.read_waiters(), 1);
        assert_eq!(kernel.task_state(task), TaskState::Blocked);

        // One more byte satisfies the recorded amount.
        fifo.write(b"b");
        assert_eq!(fifo.read_waiters(), 0);
        assert_eq!(kernel.task_state(task), TaskState::Ready);
    }

    #[test]
    fn pend_read_waiter_stays_blocked_below_its_amount() {
        let (kernel, fifo, task) = fixture(4);
        kernel.set_current_task(Some(task));
        fifo.pend_read(3, 10);
        kernel.set_current_task(None);

        fifo.write(b"ab");
        assert_eq!(fifo.read_waiters(), 1);
        assert_eq!(kernel.task_state(task), TaskState::Blocked);

        fifo.write(b"c");
        assert_eq!(kernel.task_state(task), TaskState::Ready);
    }

    #[test]
    fn pend_read_with_bytes_available_is_a_no_op() {
        let (kernel, fifo, task) = fixture(3);
        fifo.write(b"ab");
        kernel.set_current_task(Some(task));
        fifo.pend_read(2, 10);
        assert_eq!(fifo.read_waiters(), 0);
        assert_eq!(kernel.task_state(task), TaskState::Ready);
    }

    #[test]
    fn pend_write_blocks_until_enough_space() {
        let (kernel, fifo, task) = fixture(3);
        fifo.write(b"abc");
        kernel.set_current_task(Some(task));
        fifo.pend_write(2, 10);
        kernel.set_current_task(None);
        assert_eq!(fifo.write_waiters(), 1);
        assert_eq!(kernel.task_state(task), TaskState::Blocked);

        let mut out = [0u8; 1];
        fifo.read(&mut out);
        assert_eq!(fifo.write_waiters(), 1);
        fifo.read(&mut out);
        assert_eq!(fifo.write_waiters(), 0);
        assert_eq!(kernel.task_state(task), TaskState::Ready);
    }

    #[test]
    fn read_pend_returns_data_or_registers_a_wait() {
        let (kernel, fifo, task) = fixture(3);
        kernel.set_current_task(Some(task));

        let mut out = [0u8; 2];
        assert_eq!(fifo.read_pend(&mut out, 10), 0);
        assert_eq!(fifo.read_waiters(), 1);
        assert_eq!(kernel.task_state(task), TaskState::Blocked);
    }

    #[test]
    fn write_pend_returns_progress_or_registers_a_wait() {
        let (kernel, fifo, task) = fixture(3);
        kernel.set_current_task(Some(task));
        assert_eq!(fifo.write_pend(b"abc", 10), 3);
        assert_eq!(fifo.write_waiters(), 0);

        assert_eq!(fifo.write_pend(b"d", 10), 0);
        assert_eq!(fifo.write_waiters(), 1);
        assert_eq!(kernel.task_state(task), TaskState::Blocked);
    }

    #[test]
    fn nested_write_is_published_by_the_outer_commit() {
        let (kernel, fifo, _) = fixture(8);

        let nested = Arc::clone(&fifo);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&observed);
        let fired = Arc::new(Mutex::new(false));
        kernel.set_concurrency_hook(move || {
            // Runs between the outer write's reservation and its commit,
            // standing in for an interrupt-level write. One-shot so the
            // nested write does not retrigger it.
            {
                let mut f = fired.lock();
                if *f {
                    return;
                }
                *f = true;
            }
            nested.write(b"de");
            record.lock().push(nested.ctrl.lock().wlock);
            record.lock().push(nested.used());
        });

        assert_eq!(fifo.write(b"abc"), 3);

        // The nested write saw both reservations pending and nothing
        // published yet; the outer commit published all five bytes.
        assert_eq!(*observed.lock(), vec![5, 0]);
        assert_eq!(fifo.used(), 5);

        kernel.clear_concurrency_hook();
        let mut out = [0u8; 5];
        assert_eq!(fifo.read(&mut out), 5);
        assert_eq!(&out, b"abcde");
    }

    #[test]
    fn nested_read_is_published_by_the_outer_commit() {
        let (kernel, fifo, _) = fixture(8);
        fifo.write(b"abcdef");

        let nested = Arc::clone(&fifo);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&observed);
        let fired = Arc::new(Mutex::new(false));
        kernel.set_concurrency_hook(move || {
            {
                let mut f = fired.lock();
                if *f {
                    return;
                }
                *f = true;
            }
            let mut inner = [0u8; 2];
            assert_eq!(nested.read(&mut inner), 2);
            assert_eq!(&inner, b"de");
            record.lock().push(nested.ctrl.lock().rlock);
            record.lock().push(nested.free());
        });

        let mut out = [0u8; 3];
        assert_eq!(fifo.read(&mut out), 3);
        assert_eq!(&out, b"abc");

        assert_eq!(*observed.lock(), vec![5, 2]);
        assert_eq!(fifo.free(), 7);
    }

    #[test]
    fn window_write_is_judged_by_the_new_amount_not_a_stale_one() {
        let (kernel, fifo, task) = fixture(8);
        kernel.set_current_task(Some(task));

        // A completed wait for four bytes leaves that amount behind in
        // the task's control block.
        fifo.pend_read(4, 10);
        fifo.write(b"abcd");
        assert_eq!(kernel.task_state(task), TaskState::Ready);
        let mut buf = [0u8; 4];
        assert_eq!(fifo.read(&mut buf), 4);

        // The next wait needs one byte, and the producer lands inside
        // the registration window. The gated wake must be judged by the
        // new amount, not the old four.
        let racer = Arc::clone(&fifo);
        let fired = Arc::new(Mutex::new(false));
        kernel.set_concurrency_hook(move || {
            {
                let mut f = fired.lock();
                if *f {
                    return;
                }
                *f = true;
            }
            racer.write(b"x");
        });
        fifo.pend_read(1, 10);

        assert_eq!(kernel.task_state(task), TaskState::Ready);
        assert_eq!(fifo.read_waiters(), 0);
        assert_eq!(fifo.used(), 1);
    }

    #[test]
    fn write_racing_a_pend_claims_the_parked_waiter() {
        let kernel = Kernel::new(KernelConfig::default());
        kernel.start();
        let fifo = Arc::new(Fifo::new(&kernel, 3));
        let task = kernel.create_task(0, |_| {}).unwrap();
        kernel.set_current_task(Some(task));

        let racer = Arc::clone(&fifo);
        let fired = Arc::new(Mutex::new(false));
        kernel.set_concurrency_hook(move || {
            {
                let mut f = fired.lock();
                if *f {
                    return;
                }
                *f = true;
            }
            racer.write(b"x");
        });

        let mut out = [0u8; 1];
        assert_eq!(fifo.read_pend(&mut out, 10), 0);
        assert_eq!(fifo.read_waiters(), 0);
        assert_eq!(kernel.task_state(task), TaskState::Ready);
    }
}
