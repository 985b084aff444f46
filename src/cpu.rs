//! Per-CPU state.

use crate::proc::Context;

/// What a CPU needs between scheduling decisions: the interrupt-disable
/// nesting depth, the interrupt state captured at the outermost
/// `push_off`, the process it is running, and the scheduler context it
/// switches back to.
pub struct Cpu {
    /// Depth of push_off() nesting.
    pub noff: i32,

    /// Were interrupts enabled before the outermost push_off()?
    pub intena: bool,

    /// Index of the process running on this CPU, if any.
    pub proc_idx: Option<usize>,

    /// context_switch() here to enter the scheduler loop.
    pub scheduler: Context,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            noff: 0,
            intena: false,
            proc_idx: None,
            scheduler: Context::zero(),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(test)] {
        use core::cell::UnsafeCell;

        std::thread_local! {
            static CPU: UnsafeCell<Cpu> = UnsafeCell::new(Cpu::new());
        }

        /// Return this CPU's cpu struct. Under the test harness each test
        /// thread is its own CPU, so the pointer is stable for the life
        /// of the thread.
        pub fn current_cpu() -> *mut Cpu {
            CPU.with(|c| c.get())
        }
    } else if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        use core::cell::UnsafeCell;

        use array_macro::array;

        use crate::arch::{interface::Arch, TargetArch};
        use crate::param::NCPU;

        struct Cpus([UnsafeCell<Cpu>; NCPU]);

        // Each CPU mutates only its own entry, with interrupts disabled.
        unsafe impl Sync for Cpus {}

        static CPUS: Cpus = Cpus(array![_ => UnsafeCell::new(Cpu::new()); NCPU]);

        /// Return this CPU's cpu struct.
        ///
        /// Stable only while interrupts are disabled; otherwise the
        /// scheduler could move the caller to another CPU between the id
        /// read and the use of the pointer.
        pub fn current_cpu() -> *mut Cpu {
            CPUS.0[TargetArch::cpu_id()].get()
        }
    } else {
        use core::cell::UnsafeCell;

        struct Cpu0(UnsafeCell<Cpu>);

        unsafe impl Sync for Cpu0 {}

        static CPU0: Cpu0 = Cpu0(UnsafeCell::new(Cpu::new()));

        /// Return this CPU's cpu struct. Hosted non-test builds have a
        /// single CPU.
        pub fn current_cpu() -> *mut Cpu {
            CPU0.0.get()
        }
    }
}
