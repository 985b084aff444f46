//! Console formatting. Bytes go to the console collaborator through
//! `Arch::putc`; a spin mutex keeps concurrent lines from interleaving
//! and still works before the kernel value exists and inside panics.

use core::fmt;

use crate::arch::{interface::Arch, TargetArch};

pub struct Printer;

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            TargetArch::putc(b);
        }
        Ok(())
    }
}

pub static PRINTER: spin::Mutex<Printer> = spin::Mutex::new(Printer);

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    let _ = PRINTER.lock().write_fmt(args);
}

/// print! macro prints to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// println! macro prints to the console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handles kernel panics; the host test harness keeps std's unwinding
/// panics instead.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    crate::arch::TargetArch::intr_off();
    // The printer lock may be held by the panicking CPU; steal it
    // rather than deadlock.
    unsafe { PRINTER.force_unlock() };
    println!("{}", info);
    loop {
        core::hint::spin_loop();
    }
}
