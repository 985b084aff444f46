//! Deterministic stand-in architecture for hosted builds.
//!
//! Interrupt enable state, the CPU id, and the page-fault address are
//! plain data here, so lock nesting and trap dispatch behave exactly the
//! same on every run. Under the test harness each test thread is its own
//! CPU; context switching is the one operation that genuinely needs a
//! target and is therefore unavailable.

use super::{interface::Arch, RtcDate};
use crate::proc::Context;

pub struct Host;

cfg_if::cfg_if! {
    if #[cfg(test)] {
        use core::cell::Cell;

        std::thread_local! {
            static INTR_ENABLED: Cell<bool> = Cell::new(false);
            static FAULT_ADDR: Cell<usize> = Cell::new(0);
        }

        // Every test thread models CPU 0; per-CPU state itself is
        // thread-local, so the id only matters for display and for the
        // boot-CPU checks in trap dispatch.
        fn cpu_id() -> usize {
            0
        }

        fn set_intr(on: bool) {
            INTR_ENABLED.with(|f| f.set(on));
        }

        fn get_intr() -> bool {
            INTR_ENABLED.with(|f| f.get())
        }

        fn get_fault_addr() -> usize {
            FAULT_ADDR.with(|f| f.get())
        }

        /// Stage the address the next trap dispatch will observe as the
        /// page-fault address.
        pub fn set_fault_addr(addr: usize) {
            FAULT_ADDR.with(|f| f.set(addr));
        }

        fn put_byte(c: u8) {
            use std::io::Write;
            let _ = std::io::stderr().write_all(&[c]);
        }
    } else {
        use core::sync::atomic::{AtomicBool, Ordering};

        static INTR_ENABLED: AtomicBool = AtomicBool::new(false);

        fn cpu_id() -> usize {
            0
        }

        fn set_intr(on: bool) {
            INTR_ENABLED.store(on, Ordering::Relaxed);
        }

        fn get_intr() -> bool {
            INTR_ENABLED.load(Ordering::Relaxed)
        }

        fn get_fault_addr() -> usize {
            0
        }

        fn put_byte(_c: u8) {}
    }
}

extern "C" fn trap_return_stub() {
    panic!("trap return on host");
}

impl Arch for Host {
    fn cpu_id() -> usize {
        cpu_id()
    }

    unsafe fn intr_on() {
        set_intr(true);
    }

    fn intr_off() {
        set_intr(false);
    }

    fn intr_get() -> bool {
        get_intr()
    }

    unsafe fn context_switch(_old: *mut Context, _new: *const Context) {
        panic!("context switch on host");
    }

    unsafe fn load_page_dir(_pgdir: u32) {}

    unsafe fn load_kernel_stack(_esp0: usize) {}

    fn fault_addr() -> usize {
        get_fault_addr()
    }

    fn trap_return() -> usize {
        trap_return_stub as usize
    }

    fn end_of_interrupt() {}

    fn kbd_intr() {}

    fn uart_intr() {}

    fn rtc_time() -> RtcDate {
        RtcDate {
            second: 0,
            minute: 0,
            hour: 0,
            day: 1,
            month: 1,
            year: 1970,
        }
    }

    fn putc(c: u8) {
        put_byte(c);
    }
}
