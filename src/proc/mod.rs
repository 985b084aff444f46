//! Processes: per-process state, the current-process handle, and the
//! machine state saved across context switches and traps.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::file::FileRef;
use crate::fs::InodeRef;
use crate::kernel::Kernel;
use crate::param::{MAXPROCNAME, NOFILE};
use crate::vm::UserMemory;

mod procs;
mod wait_channel;

pub use procs::{forkret, ProcInfo, ProcTable, Procs};
pub use wait_channel::WaitChannel;

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Callee-saved registers plus stack and instruction pointers, saved by
/// `context_switch`. The layout is what the switch assembly expects.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Context {
    pub edi: usize,
    pub esi: usize,
    pub ebx: usize,
    pub ebp: usize,
    pub esp: usize,
    pub eip: usize,
}

impl Context {
    pub const fn zero() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebx: 0,
            ebp: 0,
            esp: 0,
            eip: 0,
        }
    }
}

/// Full CPU state pushed on kernel entry, in the order the trap vector
/// assembly lays it out on the kernel stack.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct TrapFrame {
    // registers as pushed by pusha
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    // rest of trap frame
    pub gs: u16,
    pub padding1: u16,
    pub fs: u16,
    pub padding2: u16,
    pub es: u16,
    pub padding3: u16,
    pub ds: u16,
    pub padding4: u16,
    pub trapno: u32,

    // below here defined by x86 hardware
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding5: u16,
    pub eflags: u32,

    // below here only when crossing rings, such as from user to kernel
    pub esp: u32,
    pub ss: u16,
    pub padding6: u16,
}

impl TrapFrame {
    pub const fn zero() -> Self {
        // SAFETY: every field is an integer; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    /// Did the trap come from user mode?
    pub fn from_user(&self) -> bool {
        self.cs & 3 == crate::arch::DPL_USER
    }
}

/// Per-process private data. No lock protects this: only the process
/// itself, or code that knows the process cannot run (an `Embryo` being
/// built, a `Zombie` being reaped), may touch it.
pub struct ProcData {
    /// Physical address of the kernel stack page.
    pub kstack: u32,

    /// Trap frame for the current syscall, carved out of the kernel
    /// stack.
    pub trap_frame: *mut TrapFrame,

    /// User memory manager: page table and size.
    pub memory: Option<UserMemory>,

    /// context_switch() here to run the process.
    pub context: Context,

    /// Open files.
    pub open_files: [Option<FileRef>; NOFILE],

    /// Current directory.
    pub cwd: Option<InodeRef>,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    pub const fn new() -> Self {
        Self {
            kstack: 0,
            trap_frame: core::ptr::null_mut(),
            memory: None,
            context: Context::zero(),
            open_files: array![_ => None; NOFILE],
            cwd: None,
            name: [0; MAXPROCNAME],
        }
    }
}

/// Per-process state. The shared scheduling fields live in the process
/// table under its single lock; `killed` is an atomic flag checked at
/// trap boundaries.
pub struct Proc {
    pub data: UnsafeCell<ProcData>,
    killed: AtomicBool,
}

// `data` is private to the running process per the ProcData protocol;
// the raw trap-frame pointer it holds always targets the process's own
// kernel stack.
unsafe impl Send for Proc {}
unsafe impl Sync for Proc {}

impl Proc {
    pub const fn new() -> Self {
        Self {
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
        }
    }

    /// Flag the process to die at its next trap boundary.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn clear_killed(&self) {
        self.killed.store(false, Ordering::Release);
    }
}

/// The process running on this CPU. Grants access to the process's
/// private data without further locking.
pub struct CurrentProc<'s> {
    kernel: &'s Kernel,
    idx: usize,
    pid: Pid,
}

impl<'s> CurrentProc<'s> {
    /// # Safety
    ///
    /// `idx` must be the process currently installed on this CPU.
    pub(crate) unsafe fn new(kernel: &'s Kernel, idx: usize, pid: Pid) -> Self {
        Self { kernel, idx, pid }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn proc(&self) -> &'s Proc {
        self.kernel.procs().proc(self.idx)
    }

    pub fn killed(&self) -> bool {
        self.proc().killed()
    }

    pub fn data(&self) -> &ProcData {
        // SAFETY: this is the running process; only it touches its data.
        unsafe { &*self.proc().data.get() }
    }

    pub fn data_mut(&mut self) -> &mut ProcData {
        // SAFETY: this is the running process, and `&mut self` makes the
        // borrow exclusive.
        unsafe { &mut *self.proc().data.get() }
    }

    pub fn kernel(&self) -> &'s Kernel {
        self.kernel
    }

    pub fn memory(&self) -> &UserMemory {
        self.data().memory.as_ref().expect("no user memory")
    }

    pub fn memory_mut(&mut self) -> &mut UserMemory {
        self.data_mut().memory.as_mut().expect("no user memory")
    }

    pub fn cwd(&self) -> &InodeRef {
        self.data().cwd.as_ref().expect("no cwd")
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        // SAFETY: set up by allocproc; points into this process's
        // kernel stack.
        unsafe { &*self.data().trap_frame }
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        // SAFETY: as above, with exclusivity from `&mut self`.
        unsafe { &mut *self.data_mut().trap_frame }
    }
}
