//! Bare-metal 32-bit x86.
//!
//! Register access, port I/O, and the context switch live here. The
//! APIC/CMOS/console routines come from the machine bring-up
//! collaborators and are reached through their C interfaces.

use core::arch::{asm, global_asm};

use super::{interface::Arch, RtcDate};
use crate::param::NCPU;
use crate::proc::Context;

extern "C" {
    fn lapicid() -> u32;
    fn lapiceoi();
    fn kbdintr();
    fn uartintr();
    fn cmostime(r: *mut RtcDate);
    fn consputc(c: i32);

    /// Restores a trapframe and returns to the interrupted mode. Defined
    /// by the trap vector assembly next to `alltraps`.
    fn trapret();
}

pub struct X86;

#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let data: u8;
    asm!("in al, dx", out("al") data, in("dx") port, options(nomem, nostack, preserves_flags));
    data
}

#[inline]
pub unsafe fn outb(port: u16, data: u8) {
    asm!("out dx, al", in("dx") port, in("al") data, options(nomem, nostack, preserves_flags));
}

#[inline]
pub unsafe fn insl(port: u16, addr: *mut u32, cnt: usize) {
    asm!(
        "cld",
        "rep insd",
        in("dx") port,
        inout("edi") addr => _,
        inout("ecx") cnt => _,
        options(nostack, preserves_flags)
    );
}

#[inline]
pub unsafe fn outsl(port: u16, addr: *const u32, cnt: usize) {
    asm!(
        "cld",
        "rep outsd",
        in("dx") port,
        inout("esi") addr => _,
        inout("ecx") cnt => _,
        options(nostack, preserves_flags)
    );
}

#[inline]
fn readeflags() -> u32 {
    let eflags: u32;
    unsafe {
        asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
    }
    eflags
}

#[inline]
fn rcr2() -> usize {
    let cr2: usize;
    unsafe {
        asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    cr2
}

#[inline]
unsafe fn lcr3(pa: u32) {
    asm!("mov cr3, {}", in(reg) pa, options(nostack, preserves_flags));
}

/// Per-CPU task-state segments; the boot collaborator's GDT reserves a
/// TSS slot per CPU and `ltr` points at it after `esp0` updates.
#[repr(C, align(16))]
struct TaskState {
    link: u32,
    esp0: u32,
    ss0: u16,
    _pad: [u16; 45],
    iomb: u16,
}

impl TaskState {
    const ZERO: TaskState = TaskState {
        link: 0,
        esp0: 0,
        ss0: (super::SEG_KDATA << 3) as u16,
        _pad: [0; 45],
        iomb: 0xFFFF,
    };
}

struct TsTable([TaskState; NCPU]);

// One CPU writes only its own entry, with interrupts disabled.
unsafe impl Sync for TsTable {}

static mut TS: TsTable = TsTable([TaskState::ZERO; NCPU]);

extern "C" {
    /// Installed by the boot collaborator's `seginit`; one descriptor per
    /// CPU TSS.
    fn ltr_tss(cpu: usize, ts: *mut TaskState);
}

global_asm!(
    r#"
.globl context_swtch
context_swtch:
        mov eax, [esp + 4]
        mov edx, [esp + 8]

        # Save the outgoing callee-saved registers and return address.
        mov [eax + 0], edi
        mov [eax + 4], esi
        mov [eax + 8], ebx
        mov [eax + 12], ebp
        pop ecx
        mov [eax + 16], esp
        mov [eax + 20], ecx

        # Load the incoming context.
        mov edi, [edx + 0]
        mov esi, [edx + 4]
        mov ebx, [edx + 8]
        mov ebp, [edx + 12]
        mov esp, [edx + 16]
        jmp dword ptr [edx + 20]
"#
);

extern "C" {
    fn context_swtch(old: *mut Context, new: *const Context);
}

impl Arch for X86 {
    fn cpu_id() -> usize {
        // Stable only with interrupts off; callers go through
        // push_off/pop_off.
        unsafe { lapicid() as usize }
    }

    unsafe fn intr_on() {
        asm!("sti", options(nomem, nostack));
    }

    fn intr_off() {
        unsafe {
            asm!("cli", options(nomem, nostack));
        }
    }

    fn intr_get() -> bool {
        readeflags() & super::FL_IF != 0
    }

    unsafe fn context_switch(old: *mut Context, new: *const Context) {
        context_swtch(old, new);
    }

    unsafe fn load_page_dir(pgdir: u32) {
        lcr3(pgdir);
    }

    unsafe fn load_kernel_stack(esp0: usize) {
        let cpu = Self::cpu_id();
        let ts = &mut TS.0[cpu];
        ts.esp0 = esp0 as u32;
        // Forbid user I/O instructions: IOPL stays 0 in EFLAGS and the
        // I/O permission bitmap sits past the segment limit.
        ts.iomb = 0xFFFF;
        ltr_tss(cpu, ts);
    }

    fn fault_addr() -> usize {
        rcr2()
    }

    fn trap_return() -> usize {
        trapret as usize
    }

    fn end_of_interrupt() {
        unsafe { lapiceoi() }
    }

    fn kbd_intr() {
        unsafe { kbdintr() }
    }

    fn uart_intr() {
        unsafe { uartintr() }
    }

    fn rtc_time() -> RtcDate {
        let mut r = RtcDate::default();
        unsafe { cmostime(&mut r) };
        r
    }

    fn putc(c: u8) {
        unsafe { consputc(c as i32) }
    }
}
