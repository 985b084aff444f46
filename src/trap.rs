//! Trap dispatch: system calls, device interrupts, and faults all enter
//! here with a trap frame built by the vector assembly.

use crate::arch::{interface::Arch, TargetArch};
use crate::kernel::Kernel;
use crate::memlayout::KERNBASE;
use crate::proc::{ProcState, TrapFrame};
use crate::vm::pgroundup;

pub const T_PGFLT: u32 = 14;
pub const T_SYSCALL: u32 = 64;

pub const T_IRQ0: u32 = 32;
pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KBD: u32 = 1;
pub const IRQ_COM1: u32 = 4;
pub const IRQ_IDE: u32 = 14;
pub const IRQ_SPURIOUS: u32 = 31;

/// Handle one trap described by `tf` and return to the trap-return
/// assembly, which restores the frame.
pub fn trap(kernel: &Kernel, tf: &mut TrapFrame) {
    if tf.trapno == T_SYSCALL {
        let mut proc = kernel.current_proc().expect("syscall from no process");
        if proc.killed() {
            kernel.procs().exit(kernel, &mut proc);
        }
        // Point the process at this trap frame so argument fetching and
        // the return value go through it.
        proc.data_mut().trap_frame = tf;
        let num = proc.trap_frame().eax as i32;
        let ret = kernel.syscall(num, &mut proc);
        proc.trap_frame_mut().eax = match ret {
            Ok(v) => v as u32,
            Err(()) => -1i32 as u32,
        };
        if proc.killed() {
            kernel.procs().exit(kernel, &mut proc);
        }
        return;
    }

    match tf.trapno {
        t if t == T_IRQ0 + IRQ_TIMER => {
            if TargetArch::cpu_id() == 0 {
                let mut ticks = kernel.ticks.lock();
                *ticks = ticks.wrapping_add(1);
                ticks.wakeup(kernel);
            }
            TargetArch::end_of_interrupt();
        }
        t if t == T_IRQ0 + IRQ_IDE => {
            kernel.disk().intr(kernel);
            TargetArch::end_of_interrupt();
        }
        t if t == T_IRQ0 + IRQ_IDE + 1 => {
            // Bochs generates spurious IDE1 interrupts.
        }
        t if t == T_IRQ0 + IRQ_KBD => {
            TargetArch::kbd_intr();
            TargetArch::end_of_interrupt();
        }
        t if t == T_IRQ0 + IRQ_COM1 => {
            TargetArch::uart_intr();
            TargetArch::end_of_interrupt();
        }
        t if t == T_IRQ0 + 7 || t == T_IRQ0 + IRQ_SPURIOUS => {
            println!(
                "cpu{}: spurious interrupt at {:x}:{:x}",
                TargetArch::cpu_id(),
                tf.cs,
                tf.eip
            );
            TargetArch::end_of_interrupt();
        }
        _ => fault(kernel, tf),
    }

    // If the process has been killed since we yielded, exit before
    // going back to user space.
    if let Some(mut proc) = kernel.current_proc() {
        if proc.killed() && tf.from_user() {
            kernel.procs().exit(kernel, &mut proc);
        }

        // Force the process to give up the CPU on a clock tick.
        if tf.trapno == T_IRQ0 + IRQ_TIMER
            && kernel.procs().table().lock().info[proc.idx()].state == ProcState::Running
        {
            kernel.procs().yield_now(&proc);
        }

        if proc.killed() && tf.from_user() {
            kernel.procs().exit(kernel, &mut proc);
        }
    }
}

/// A trap that is neither a syscall nor a device interrupt: grow the
/// heap on a user page fault above the current size, otherwise kill the
/// offender. In the kernel it can only be our own bug.
fn fault(kernel: &Kernel, tf: &mut TrapFrame) {
    let proc = kernel.current_proc();
    if proc.is_none() || !tf.from_user() {
        // From the kernel: it must be our mistake.
        println!(
            "unexpected trap {} from cpu {} eip {:#x} (cr2={:#x})",
            tf.trapno,
            TargetArch::cpu_id(),
            tf.eip,
            TargetArch::fault_addr()
        );
        panic!("trap");
    }

    let mut proc = proc.unwrap();
    if tf.trapno == T_PGFLT {
        let addr = TargetArch::fault_addr();
        let sz = proc.memory().size();
        if addr >= sz && addr < KERNBASE {
            // Demand growth: map pages up to and including the faulting
            // address. alloc() rolls itself back on failure, so a
            // repeated fault starts from the same state.
            if proc
                .memory_mut()
                .alloc(kernel, pgroundup(addr + 1))
                .is_ok()
            {
                return;
            }
            println!("allocuvm out of memory");
        }
    }

    // From user space: the process misbehaved.
    let name = proc.data().name;
    let len = name.iter().position(|c| *c == 0).unwrap_or(name.len());
    println!(
        "pid {} {}: trap {} err {} on cpu {} eip {:#x} addr {:#x}--kill proc",
        proc.pid(),
        core::str::from_utf8(&name[..len]).unwrap_or("???"),
        tf.trapno,
        tf.err,
        TargetArch::cpu_id(),
        tf.eip,
        TargetArch::fault_addr()
    );
    proc.proc().kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host;
    use crate::vm::{UVAddr, PGSIZE};
    use crate::test_util::TestKernel;

    fn user_frame(trapno: u32) -> TrapFrame {
        let mut tf = TrapFrame::zero();
        tf.trapno = trapno;
        tf.cs = (crate::arch::SEG_UCODE << 3) | crate::arch::DPL_USER;
        tf
    }

    #[test]
    fn timer_tick_advances_the_clock() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        t.uninstall_proc();
        let before = *k.ticks.lock();
        let mut tf = TrapFrame::zero();
        tf.trapno = T_IRQ0 + IRQ_TIMER;
        trap(k, &mut tf);
        trap(k, &mut tf);
        assert_eq!(*k.ticks.lock(), before + 2);
    }

    #[test]
    fn page_fault_grows_the_heap() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        {
            let mut proc = k.current_proc().unwrap();
            proc.memory_mut().alloc(k, PGSIZE).unwrap();
            assert_eq!(proc.memory().size(), PGSIZE);
        }

        // Touching 8192 faults; the handler must map it.
        host::set_fault_addr(2 * PGSIZE);
        let mut tf = user_frame(T_PGFLT);
        trap(k, &mut tf);

        let mut proc = k.current_proc().unwrap();
        assert!(!proc.killed());
        assert!(proc.memory().size() > 2 * PGSIZE - 1);
        let addr = UVAddr::new(2 * PGSIZE);
        proc.memory_mut().copy_out(k, addr, &0xAB_u8).unwrap();
        let mut byte = 0u8;
        proc.memory_mut().copy_in(k, &mut byte, addr).unwrap();
        assert_eq!(byte, 0xAB);
    }

    #[test]
    fn page_fault_below_size_kills() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        {
            let mut proc = k.current_proc().unwrap();
            proc.memory_mut().alloc(k, PGSIZE).unwrap();
        }
        // A fault below the current size is not growth; the process is
        // at fault. (It would also never happen with healthy mappings.)
        host::set_fault_addr(16);
        let mut tf = user_frame(T_PGFLT);
        fault(k, &mut tf);
        // The process is marked killed; teardown happens at the next
        // trap boundary.
        let proc = k.current_proc().unwrap();
        assert!(proc.killed());
        proc.proc().clear_killed();
    }

    #[test]
    fn page_fault_above_kernbase_kills() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        {
            let mut proc = k.current_proc().unwrap();
            proc.memory_mut().alloc(k, PGSIZE).unwrap();
        }
        host::set_fault_addr(crate::memlayout::KERNBASE + 0x1000);
        let mut tf = user_frame(T_PGFLT);
        fault(k, &mut tf);
        let proc = k.current_proc().unwrap();
        assert!(proc.killed());
        proc.proc().clear_killed();
    }

    #[test]
    #[should_panic(expected = "trap")]
    fn kernel_mode_fault_panics() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        t.uninstall_proc();
        let mut tf = TrapFrame::zero();
        tf.trapno = T_PGFLT;
        trap(k, &mut tf);
    }
}
