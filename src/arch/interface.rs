use super::RtcDate;
use crate::proc::Context;

/// The machine-dependent surface of the kernel.
///
/// The portable code calls these through [`crate::arch::TargetArch`]; the
/// chosen implementation is fixed at compile time.
pub trait Arch {
    /// Which CPU is this?
    fn cpu_id() -> usize;

    /// Enable device interrupts.
    ///
    /// # Safety
    ///
    /// Interrupt handlers must have been configured in advance.
    unsafe fn intr_on();

    /// Disable device interrupts.
    fn intr_off();

    /// Are device interrupts enabled?
    fn intr_get() -> bool;

    /// Save the current register context in `old` and switch to `new`.
    ///
    /// # Safety
    ///
    /// `old` and `new` must point to valid contexts; `new` must have been
    /// produced by a previous switch or by seeding a fresh kernel stack.
    unsafe fn context_switch(old: *mut Context, new: *const Context);

    /// Load `pgdir` (a physical address) as the active page directory.
    ///
    /// # Safety
    ///
    /// `pgdir` must be a valid page directory including the kernel map.
    /// Must run with interrupts disabled.
    unsafe fn load_page_dir(pgdir: u32);

    /// Point the task-state segment at `esp0` so kernel entry from user
    /// mode lands on that stack, and fence off user I/O port access.
    ///
    /// # Safety
    ///
    /// Must run with interrupts disabled; `esp0` must be the top of a
    /// valid kernel stack.
    unsafe fn load_kernel_stack(esp0: usize);

    /// The faulting virtual address of the most recent page fault.
    fn fault_addr() -> usize;

    /// Address of the trap-return thunk that restores a trapframe and
    /// drops to user mode. New kernel stacks are seeded so that the
    /// bootstrap entry returns here.
    fn trap_return() -> usize;

    /// Acknowledge the current interrupt at the local interrupt
    /// controller.
    fn end_of_interrupt();

    /// Drive the keyboard collaborator's interrupt handler.
    fn kbd_intr();

    /// Drive the serial collaborator's interrupt handler.
    fn uart_intr();

    /// Read the CMOS real-time clock.
    fn rtc_time() -> RtcDate;

    /// Emit one byte on the console collaborator.
    fn putc(c: u8);
}
