//! Architecture-specific mechanics behind a trait seam.
//!
//! Everything the portable kernel needs from the machine goes through
//! [`interface::Arch`]: interrupt enable state, the CPU id, the context
//! switch, CR3/TSS loads, the page-fault address, the RTC, and console
//! byte output. The bare-metal x86 implementation lives in [`x86`]; hosted
//! builds (including the test suite) use the deterministic stand-in in
//! [`host`].

pub mod interface;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        pub mod x86;
        pub type TargetArch = x86::X86;
    } else {
        pub mod host;
        pub type TargetArch = host::Host;
    }
}

/// Segment selectors and descriptor privilege levels of the GDT laid out
/// by the boot collaborator. User segments are referenced when crafting
/// the first trapframe of a process.
pub const SEG_KCODE: u16 = 1;
pub const SEG_KDATA: u16 = 2;
pub const SEG_UCODE: u16 = 3;
pub const SEG_UDATA: u16 = 4;
pub const DPL_USER: u16 = 3;

/// EFLAGS interrupt-enable bit.
pub const FL_IF: u32 = 0x200;

/// A calendar date read from the CMOS real-time clock.
#[repr(C)]
#[derive(Copy, Clone, Default, zerocopy::AsBytes, zerocopy::FromBytes)]
pub struct RtcDate {
    pub second: u32,
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    pub year: u32,
}
