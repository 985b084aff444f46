//! Process-related system calls.

use crate::arch::{interface::Arch, RtcDate, TargetArch};
use crate::kernel::Kernel;
use crate::proc::CurrentProc;

impl Kernel {
    pub(super) fn sys_fork(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        self.procs().fork(self, proc).map(|pid| pid as usize)
    }

    pub(super) fn sys_exit(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        self.procs().exit(self, proc)
    }

    pub(super) fn sys_wait(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        self.procs().wait(self, proc).map(|pid| pid as usize)
    }

    pub(super) fn sys_kill(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let pid = proc.argint(0)?;
        self.procs().kill(pid)?;
        Ok(0)
    }

    pub(super) fn sys_getpid(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        Ok(proc.pid() as usize)
    }

    /// Grow or shrink the heap by n bytes; returns the old break.
    pub(super) fn sys_sbrk(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let n = proc.argint(0)?;
        let addr = proc.memory_mut().resize(self, n)?;
        // The mappings changed; reload the hardware translation.
        self.switch_user_vm(proc.proc());
        Ok(addr)
    }

    /// Sleep for n timer ticks.
    pub(super) fn sys_sleep(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let n = proc.argint(0)?;
        if n < 0 {
            return Err(());
        }
        let mut ticks = self.ticks.lock();
        let t0 = *ticks;
        while ticks.wrapping_sub(t0) < n as u32 {
            if proc.killed() {
                return Err(());
            }
            ticks.sleep(self);
        }
        Ok(0)
    }

    /// Ticks since boot.
    pub(super) fn sys_uptime(&self, _proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        Ok(*self.ticks.lock() as usize)
    }

    /// Fill in the current real-time clock reading.
    pub(super) fn sys_date(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let addr = proc.argptr(0, core::mem::size_of::<RtcDate>())?;
        let date = TargetArch::rtc_time();
        proc.memory_mut().copy_out(self, addr, &date)?;
        Ok(0)
    }
}
