use crate::kernel::Kernel;
use crate::lock::SpinlockGuard;
use crate::proc::ProcState;

/// An opaque token sleepers and wakers agree on: the channel object's
/// address.
pub struct WaitChannel {
    /// Required to make this type non-zero-sized, so distinct channels
    /// have distinct addresses.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    pub fn token(&self) -> usize {
        self as *const _ as usize
    }

    /// Atomically release `lk` and sleep on this channel; reacquires
    /// `lk` before returning. `lk` must not be the process-table lock —
    /// code sleeping under that lock goes through the process table's
    /// own wait loop.
    pub fn sleep<T>(&self, lk: &mut SpinlockGuard<'_, T>, kernel: &Kernel) {
        let idx = kernel.current_proc_idx().expect("sleep");
        let procs = kernel.procs();

        // Acquire the process table lock before releasing `lk`: wakeup
        // runs with the table lock held, so it cannot slip between the
        // condition check and the state change below.
        let mut table = procs.table().lock();
        // SAFETY: reacquired below, after the table guard is gone.
        unsafe { lk.raw_release() };

        table.info[idx].chan = self.token();
        table.info[idx].state = ProcState::Sleeping;
        procs.sched(&mut table, idx);

        // Tidy up.
        table.info[idx].chan = 0;
        drop(table);

        // Reacquire original lock.
        // SAFETY: pairs with the release above.
        unsafe { lk.raw_acquire() };
    }

    /// Wake all processes sleeping on this channel.
    pub fn wakeup(&self, kernel: &Kernel) {
        kernel.procs().wakeup(self.token());
    }
}
