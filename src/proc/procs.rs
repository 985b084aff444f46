//! The process table and scheduler.
//!
//! One spinlock protects every process's scheduling state: `state`,
//! `chan`, `pid`, and `parent`. It is the lock held across the context
//! switch into and out of the scheduler, and the lock `wakeup` takes, so
//! a sleeper that set its state under it cannot miss a wakeup.

use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use itertools::izip;
use spin::Once;

use super::{Context, CurrentProc, Pid, Proc, ProcState, TrapFrame};
use crate::arch::{interface::Arch, TargetArch, DPL_USER, FL_IF, SEG_UCODE, SEG_UDATA};
use crate::cpu::current_cpu;
use crate::kernel::Kernel;
use crate::lock::{Spinlock, SpinlockGuard};
use crate::param::{KSTACKSIZE, NPROC, ROOTDEV};
use crate::vm::{UserMemory, PGSIZE};

/// A user program that calls exec("/init").
/// od -t xC initcode
const INITCODE: [u8; 44] = [
    0x68, 0x24, 0, 0, 0, 0x68, 0x1c, 0, 0, 0, 0x6a, 0, 0xb8, 0x07, 0, 0, 0, 0xcd, 0x40, 0xb8,
    0x02, 0, 0, 0, 0xcd, 0x40, 0xeb, 0xf7, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0, 0, 0, 0x1c, 0, 0, 0,
    0, 0, 0, 0,
];

/// Scheduling state shared with the rest of the kernel; the process
/// table's spinlock protects every field.
pub struct ProcInfo {
    pub state: ProcState,

    /// If non-zero, sleeping on this channel token.
    pub chan: usize,

    pub pid: Pid,

    /// Index of the parent process.
    pub parent: Option<usize>,
}

pub struct ProcTable {
    nextpid: Pid,
    pub info: [ProcInfo; NPROC],
}

impl ProcTable {
    /// Wake every process sleeping on `chan`. Caller holds the table
    /// lock.
    fn wakeup_locked(&mut self, chan: usize) {
        for info in self.info.iter_mut() {
            if info.state == ProcState::Sleeping && info.chan == chan {
                info.state = ProcState::Runnable;
            }
        }
    }
}

pub struct Procs {
    table: Spinlock<ProcTable>,
    pool: [Proc; NPROC],
    init_idx: Once<usize>,
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            table: Spinlock::new(
                "ptable",
                ProcTable {
                    nextpid: 1,
                    info: array![_ => ProcInfo {
                        state: ProcState::Unused,
                        chan: 0,
                        pid: 0,
                        parent: None,
                    }; NPROC],
                },
            ),
            pool: array![_ => Proc::new(); NPROC],
            init_idx: Once::new(),
        }
    }

    pub fn table(&self) -> &Spinlock<ProcTable> {
        &self.table
    }

    /// Release the table lock without a guard; used by a freshly
    /// scheduled process that inherited the lock from the scheduler.
    ///
    /// # Safety
    ///
    /// The lock must be held by this CPU with no live guard.
    pub unsafe fn table_unlock(&self) {
        self.table.unlock();
    }

    pub fn proc(&self, idx: usize) -> &Proc {
        &self.pool[idx]
    }

    /// The sleep token for waiting on process `idx`, e.g. a parent in
    /// wait().
    fn token_of(&self, idx: usize) -> usize {
        &self.pool[idx] as *const Proc as usize
    }

    fn init_idx(&self) -> usize {
        *self.init_idx.get().expect("no init process")
    }

    /// Look in the process table for an Unused slot. If found, set it up
    /// to run in the kernel: allocate the kernel stack, carve the trap
    /// frame out of its top, and seed the context so the first switch
    /// enters `forkret`, which returns into the trap-return thunk.
    pub fn alloc(&self, kernel: &Kernel) -> Result<usize, ()> {
        let mut table = self.table.lock();
        let idx = match table
            .info
            .iter()
            .position(|info| info.state == ProcState::Unused)
        {
            Some(idx) => idx,
            None => return Err(()),
        };
        table.info[idx].state = ProcState::Embryo;
        table.info[idx].pid = table.nextpid;
        table.nextpid += 1;
        drop(table);

        let kstack = match kernel.alloc_page() {
            Some(pa) => pa,
            None => {
                self.table.lock().info[idx] = ProcInfo {
                    state: ProcState::Unused,
                    chan: 0,
                    pid: 0,
                    parent: None,
                };
                return Err(());
            }
        };

        // SAFETY: the slot is Embryo; no one else touches its data.
        let data = unsafe { &mut *self.pool[idx].data.get() };
        data.kstack = kstack;

        let base = kernel.mem().p2v(kstack);
        // SAFETY: the stack page is exclusively ours; all carving stays
        // inside it.
        unsafe {
            let mut sp = base.add(KSTACKSIZE);

            // Leave room for the trap frame.
            sp = sp.sub(core::mem::size_of::<TrapFrame>());
            data.trap_frame = sp as *mut TrapFrame;
            *data.trap_frame = TrapFrame::zero();

            // Return address for forkret: the trap-return thunk. The
            // cell is a 32-bit stack word on the target.
            sp = sp.sub(4);
            (sp as *mut u32).write(TargetArch::trap_return() as u32);

            data.context = Context::zero();
            data.context.esp = sp as usize;
            data.context.eip = forkret as usize;
        }

        Ok(idx)
    }

    /// Undo `alloc` when a later step fails.
    fn dealloc(&self, kernel: &Kernel, idx: usize) {
        // SAFETY: the slot is Embryo; no one else touches its data.
        let data = unsafe { &mut *self.pool[idx].data.get() };
        kernel.free_page(data.kstack);
        data.kstack = 0;
        data.trap_frame = core::ptr::null_mut();
        self.table.lock().info[idx] = ProcInfo {
            state: ProcState::Unused,
            chan: 0,
            pid: 0,
            parent: None,
        };
    }

    /// Set up the first user process.
    pub fn user_init(&self, kernel: &Kernel) {
        let idx = self.alloc(kernel).expect("userinit: alloc");
        let memory = UserMemory::new(kernel, Some(&INITCODE)).expect("userinit: out of memory");

        // SAFETY: the slot is Embryo; no one else touches its data.
        let data = unsafe { &mut *self.pool[idx].data.get() };
        data.memory = Some(memory);
        // SAFETY: trap_frame was set up by alloc.
        unsafe {
            let tf = &mut *data.trap_frame;
            tf.cs = (SEG_UCODE << 3) | DPL_USER;
            tf.ds = (SEG_UDATA << 3) | DPL_USER;
            tf.es = tf.ds;
            tf.ss = tf.ds;
            tf.eflags = FL_IF;
            tf.esp = PGSIZE as u32;
            tf.eip = 0; // beginning of initcode
        }
        data.name[..b"initcode".len()].copy_from_slice(b"initcode");
        data.cwd = Some(kernel.itable().get(ROOTDEV, crate::fs::ROOTINO));

        self.init_idx.call_once(|| idx);

        let mut table = self.table.lock();
        table.info[idx].parent = None;
        table.info[idx].state = ProcState::Runnable;
    }

    /// Create a new process copying the caller. Sets up the child's
    /// trap frame to return 0 from the fork system call.
    pub fn fork(&self, kernel: &Kernel, proc: &mut CurrentProc<'_>) -> Result<Pid, ()> {
        let idx = self.alloc(kernel)?;

        // Copy user memory from parent to child.
        let memory = match proc.memory_mut().try_clone(kernel) {
            Some(memory) => memory,
            None => {
                self.dealloc(kernel, idx);
                return Err(());
            }
        };

        // SAFETY: the slot is Embryo; no one else touches its data.
        let data = unsafe { &mut *self.pool[idx].data.get() };
        data.memory = Some(memory);

        // Copy saved user registers; fork returns 0 in the child.
        // SAFETY: both trap frames were set up by alloc.
        unsafe {
            *data.trap_frame = *proc.trap_frame();
            (*data.trap_frame).eax = 0;
        }

        // The child shares the parent's open file descriptions and cwd.
        for (nf, f) in izip!(data.open_files.iter_mut(), proc.data().open_files.iter()) {
            if let Some(file) = f {
                *nf = Some(kernel.ftable().dup(file));
            }
        }
        data.cwd = Some(kernel.itable().dup(proc.cwd()));
        data.name = proc.data().name;

        let mut table = self.table.lock();
        let pid = table.info[idx].pid;
        table.info[idx].parent = Some(proc.idx());
        table.info[idx].state = ProcState::Runnable;
        Ok(pid)
    }

    /// Exit the current process. Does not return: the process stays a
    /// zombie until its parent calls wait().
    pub fn exit(&self, kernel: &Kernel, proc: &mut CurrentProc<'_>) -> ! {
        assert_ne!(proc.idx(), self.init_idx(), "init exiting");

        // Close all open files.
        let data = proc.data_mut();
        for f in data.open_files.iter_mut() {
            if let Some(f) = f.take() {
                kernel.ftable().close(kernel, f);
            }
        }

        {
            let tx = kernel.begin_tx();
            let cwd = data.cwd.take().expect("exit: no cwd");
            kernel.itable().put(kernel, &tx, cwd);
        }

        let my = proc.idx();
        let mut table = self.table.lock();

        // Parent might be sleeping in wait().
        let parent = table.info[my].parent.expect("exit: no parent");
        table.wakeup_locked(self.token_of(parent));

        // Pass abandoned children to init.
        let init = self.init_idx();
        for i in 0..NPROC {
            if table.info[i].parent == Some(my) {
                table.info[i].parent = Some(init);
                if table.info[i].state == ProcState::Zombie {
                    table.wakeup_locked(self.token_of(init));
                }
            }
        }

        // Jump into the scheduler, never to return.
        table.info[my].state = ProcState::Zombie;
        self.sched(&mut table, my);
        panic!("zombie exit");
    }

    /// Wait for a child process to exit; returns its pid, or Err if the
    /// caller has no children.
    pub fn wait(&self, kernel: &Kernel, proc: &CurrentProc<'_>) -> Result<Pid, ()> {
        let my = proc.idx();
        let mut table = self.table.lock();
        loop {
            // Scan through the table looking for exited children.
            let mut havekids = false;
            for i in 0..NPROC {
                if table.info[i].parent != Some(my) {
                    continue;
                }
                havekids = true;
                if table.info[i].state == ProcState::Zombie {
                    // Found one; release its resources.
                    let pid = table.info[i].pid;
                    // SAFETY: the child is a zombie, so nothing else
                    // touches its data.
                    let data = unsafe { &mut *self.pool[i].data.get() };
                    kernel.free_page(data.kstack);
                    data.kstack = 0;
                    data.trap_frame = core::ptr::null_mut();
                    if let Some(memory) = data.memory.take() {
                        memory.free(kernel);
                    }
                    data.name[0] = 0;
                    self.pool[i].clear_killed();
                    table.info[i] = ProcInfo {
                        state: ProcState::Unused,
                        chan: 0,
                        pid: 0,
                        parent: None,
                    };
                    return Ok(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || proc.killed() {
                return Err(());
            }

            // Wait for a child to exit; exit() wakes our token.
            table = self.sleep_on_table(table, my);
        }
    }

    /// Sleep on our own token while already holding the process-table
    /// lock: the lock doubles as the condition lock, so there is nothing
    /// to juggle. Returns with the lock held again.
    fn sleep_on_table<'s>(
        &'s self,
        mut table: SpinlockGuard<'s, ProcTable>,
        idx: usize,
    ) -> SpinlockGuard<'s, ProcTable> {
        table.info[idx].chan = self.token_of(idx);
        table.info[idx].state = ProcState::Sleeping;
        self.sched(&mut table, idx);
        table.info[idx].chan = 0;
        table
    }

    /// Wake all processes sleeping on `chan`.
    pub fn wakeup(&self, chan: usize) {
        self.table.lock().wakeup_locked(chan);
    }

    /// Flag the process with the given pid to die.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        let mut table = self.table.lock();
        for i in 0..NPROC {
            if table.info[i].pid == pid && table.info[i].state != ProcState::Unused {
                self.pool[i].kill();
                // Wake it from sleep so it reaches the trap boundary.
                if table.info[i].state == ProcState::Sleeping {
                    table.info[i].state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_now(&self, proc: &CurrentProc<'_>) {
        let mut table = self.table.lock();
        table.info[proc.idx()].state = ProcState::Runnable;
        self.sched(&mut table, proc.idx());
    }

    /// Switch to the scheduler. The caller holds the process-table lock
    /// (exactly that one lock) and has already changed the process's
    /// state away from Running. Interrupt state is a property of this
    /// kernel thread, so it is saved and restored across the switch.
    pub(crate) fn sched(&self, table: &mut SpinlockGuard<'_, ProcTable>, idx: usize) {
        assert!(!TargetArch::intr_get(), "sched interruptible");
        assert_ne!(table.info[idx].state, ProcState::Running, "sched running");

        let cpu = current_cpu();
        // SAFETY: interrupts are off, so the CPU struct is ours.
        unsafe {
            assert_eq!((*cpu).noff, 1, "sched locks");
            let intena = (*cpu).intena;

            let ctx = &mut (*self.pool[idx].data.get()).context as *mut Context;
            TargetArch::context_switch(ctx, &(*cpu).scheduler);

            // This thread may resume on another CPU.
            let cpu = current_cpu();
            (*cpu).intena = intena;
        }
    }

    /// Per-CPU scheduler loop; never returns. Each iteration enables
    /// interrupts, picks a Runnable process, and switches to it with the
    /// process-table lock held; the process releases the lock on its way
    /// out of the kernel and reacquires it before switching back.
    pub fn scheduler(&self, kernel: &Kernel) -> ! {
        let cpu = current_cpu();
        loop {
            // Enable interrupts on this processor.
            // SAFETY: trap handling was set up by boot.
            unsafe { TargetArch::intr_on() };

            let mut table = self.table.lock();
            for idx in 0..NPROC {
                if table.info[idx].state != ProcState::Runnable {
                    continue;
                }

                // Switch to the chosen process. It is its job to release
                // the table lock and then reacquire it before jumping
                // back to us.
                table.info[idx].state = ProcState::Running;
                // SAFETY: interrupts are off while the lock is held.
                unsafe { (*cpu).proc_idx = Some(idx) };
                kernel.switch_user_vm(&self.pool[idx]);
                // SAFETY: the process context was seeded by alloc or
                // saved by a previous sched.
                unsafe {
                    TargetArch::context_switch(
                        &mut (*cpu).scheduler,
                        &(*self.pool[idx].data.get()).context,
                    );
                }
                kernel.switch_kernel_vm();

                // The process is done running for now.
                unsafe { (*cpu).proc_idx = None };
            }
            drop(table);
        }
    }
}

/// A fork child's first scheduling by the scheduler switches here.
pub extern "C" fn forkret() {
    static FIRST: AtomicBool = AtomicBool::new(true);

    let kernel = crate::kernel::kernel();

    // Still holding the process-table lock from the scheduler.
    // SAFETY: inherited exactly one hold of the lock.
    unsafe { kernel.procs().table_unlock() };

    if FIRST.swap(false, Ordering::AcqRel) {
        // The file system must be initialized in the context of a
        // regular process because recovery sleeps on disk I/O.
        kernel.fs_init(ROOTDEV);
    }

    // Return to trap_return, which was pushed right above the context.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestKernel;

    #[test]
    fn alloc_seeds_the_bootstrap_context() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let idx = k.procs().alloc(k).unwrap();
        // SAFETY: embryo slot, test is the only toucher.
        let data = unsafe { &*k.procs().proc(idx).data.get() };
        assert_ne!(data.kstack, 0);
        assert_eq!(data.context.eip, forkret as usize);
        assert!(!data.trap_frame.is_null());
        let table = k.procs().table().lock();
        assert_eq!(table.info[idx].state, ProcState::Embryo);
        assert!(table.info[idx].pid > 0);
    }

    #[test]
    fn pids_are_monotonic() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let a = k.procs().alloc(k).unwrap();
        let b = k.procs().alloc(k).unwrap();
        let table = k.procs().table().lock();
        assert!(table.info[b].pid > table.info[a].pid);
    }

    #[test]
    fn wakeup_makes_sleeping_runnable() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let chan = 0xdead_beef;
        let idx = k.procs().alloc(k).unwrap();
        {
            let mut table = k.procs().table().lock();
            table.info[idx].state = ProcState::Sleeping;
            table.info[idx].chan = chan;
        }
        k.procs().wakeup(chan);
        let table = k.procs().table().lock();
        assert_eq!(table.info[idx].state, ProcState::Runnable);
    }

    #[test]
    fn wakeup_ignores_other_channels() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let idx = k.procs().alloc(k).unwrap();
        {
            let mut table = k.procs().table().lock();
            table.info[idx].state = ProcState::Sleeping;
            table.info[idx].chan = 1;
        }
        k.procs().wakeup(2);
        let table = k.procs().table().lock();
        assert_eq!(table.info[idx].state, ProcState::Sleeping);
    }

    #[test]
    fn kill_wakes_the_victim() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let idx = k.procs().alloc(k).unwrap();
        let pid = {
            let mut table = k.procs().table().lock();
            table.info[idx].state = ProcState::Sleeping;
            table.info[idx].chan = 42;
            table.info[idx].pid
        };
        assert!(k.procs().kill(pid).is_ok());
        {
            let table = k.procs().table().lock();
            assert_eq!(table.info[idx].state, ProcState::Runnable);
        }
        assert!(k.procs().proc(idx).killed());
        assert!(k.procs().kill(9999).is_err());
    }
}
