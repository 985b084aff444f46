//! System calls.
//!
//! User code traps with INT T_SYSCALL; the call number sits in %eax and
//! the C-calling-convention arguments on the user stack, so the saved
//! user %esp points at the return address with the first argument right
//! above it. Every fetch validates addresses against the process size
//! before touching user memory.

use core::mem;

use cstr_core::CStr;

use crate::file::File;
use crate::kernel::Kernel;
use crate::param::NOFILE;
use crate::proc::CurrentProc;
use crate::vm::UVAddr;

mod file;
mod proc;

pub const SYS_FORK: i32 = 1;
pub const SYS_EXIT: i32 = 2;
pub const SYS_WAIT: i32 = 3;
pub const SYS_PIPE: i32 = 4;
pub const SYS_READ: i32 = 5;
pub const SYS_KILL: i32 = 6;
pub const SYS_EXEC: i32 = 7;
pub const SYS_FSTAT: i32 = 8;
pub const SYS_CHDIR: i32 = 9;
pub const SYS_DUP: i32 = 10;
pub const SYS_GETPID: i32 = 11;
pub const SYS_SBRK: i32 = 12;
pub const SYS_SLEEP: i32 = 13;
pub const SYS_UPTIME: i32 = 14;
pub const SYS_OPEN: i32 = 15;
pub const SYS_WRITE: i32 = 16;
pub const SYS_MKNOD: i32 = 17;
pub const SYS_UNLINK: i32 = 18;
pub const SYS_LINK: i32 = 19;
pub const SYS_MKDIR: i32 = 20;
pub const SYS_CLOSE: i32 = 21;
pub const SYS_DATE: i32 = 22;
pub const SYS_DUP2: i32 = 23;
pub const SYS_LSEEK: i32 = 24;

impl Kernel {
    /// Dispatch a system call; the result lands in the caller's %eax,
    /// with every error collapsed to -1.
    pub fn syscall(&self, num: i32, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        match num {
            SYS_FORK => self.sys_fork(proc),
            SYS_EXIT => self.sys_exit(proc),
            SYS_WAIT => self.sys_wait(proc),
            SYS_PIPE => self.sys_pipe(proc),
            SYS_READ => self.sys_read(proc),
            SYS_KILL => self.sys_kill(proc),
            SYS_EXEC => self.sys_exec(proc),
            SYS_FSTAT => self.sys_fstat(proc),
            SYS_CHDIR => self.sys_chdir(proc),
            SYS_DUP => self.sys_dup(proc),
            SYS_GETPID => self.sys_getpid(proc),
            SYS_SBRK => self.sys_sbrk(proc),
            SYS_SLEEP => self.sys_sleep(proc),
            SYS_UPTIME => self.sys_uptime(proc),
            SYS_OPEN => self.sys_open(proc),
            SYS_WRITE => self.sys_write(proc),
            SYS_MKNOD => self.sys_mknod(proc),
            SYS_UNLINK => self.sys_unlink(proc),
            SYS_LINK => self.sys_link(proc),
            SYS_MKDIR => self.sys_mkdir(proc),
            SYS_CLOSE => self.sys_close(proc),
            SYS_DATE => self.sys_date(proc),
            SYS_DUP2 => self.sys_dup2(proc),
            SYS_LSEEK => self.sys_lseek(proc),
            _ => {
                let name = proc.data().name;
                let len = name.iter().position(|c| *c == 0).unwrap_or(name.len());
                println!(
                    "{} {}: unknown sys call {}",
                    proc.pid(),
                    core::str::from_utf8(&name[..len]).unwrap_or("???"),
                    num
                );
                Err(())
            }
        }
    }
}

impl CurrentProc<'_> {
    /// Fetch the 32-bit word at user address `addr`.
    pub fn fetchint(&mut self, addr: UVAddr) -> Result<i32, ()> {
        let sz = self.memory().size();
        if addr.value() >= sz || addr.value() + mem::size_of::<i32>() > sz {
            return Err(());
        }
        let mut v: i32 = 0;
        let kernel = self.kernel();
        self.memory_mut().copy_in(kernel, &mut v, addr)?;
        Ok(v)
    }

    /// Fetch the NUL-terminated string at user address `addr` into
    /// `buf`; the string must lie within the process size.
    pub fn fetchstr<'a>(&mut self, addr: UVAddr, buf: &'a mut [u8]) -> Result<&'a CStr, ()> {
        let sz = self.memory().size();
        if addr.value() >= sz {
            return Err(());
        }
        let max = buf.len().min(sz - addr.value());
        let kernel = self.kernel();
        self.memory_mut()
            .copy_in_str(kernel, &mut buf[..max], addr)?;
        // SAFETY: copy_in_str succeeded, so buf holds a NUL.
        Ok(unsafe { CStr::from_ptr(buf.as_ptr() as *const _) })
    }

    /// Fetch the n-th 32-bit system call argument from the user stack:
    /// the saved %esp points at the return address, the first argument
    /// is the word above it.
    pub fn argint(&mut self, n: usize) -> Result<i32, ()> {
        let esp = self.trap_frame().esp as usize;
        self.fetchint(UVAddr::new(esp + 4 + 4 * n))
    }

    /// Fetch the n-th argument as a pointer to a block of `size` bytes,
    /// checking that it lies within the process address space.
    pub fn argptr(&mut self, n: usize, size: usize) -> Result<UVAddr, ()> {
        let addr = self.argint(n)? as u32 as usize;
        let sz = self.memory().size();
        if addr >= sz || addr + size > sz {
            return Err(());
        }
        Ok(UVAddr::new(addr))
    }

    /// Fetch the n-th argument as a NUL-terminated string.
    pub fn argstr<'a>(&mut self, n: usize, buf: &'a mut [u8]) -> Result<&'a CStr, ()> {
        let addr = self.argint(n)? as u32 as usize;
        self.fetchstr(UVAddr::new(addr), buf)
    }

    /// Fetch the n-th argument as a file descriptor, checking that it
    /// names an open file.
    pub fn argfd(&mut self, n: usize) -> Result<usize, ()> {
        let fd = self.argint(n)?;
        if fd < 0 || fd as usize >= NOFILE {
            return Err(());
        }
        let fd = fd as usize;
        self.data().open_files[fd].as_ref().ok_or(())?;
        Ok(fd)
    }
}

impl Kernel {
    /// The open file behind descriptor `fd` of `proc`. The reference
    /// borrows the file table, not the process, so the caller is free
    /// to keep using `proc`.
    pub fn open_file<'s>(&'s self, proc: &CurrentProc<'_>, fd: usize) -> Result<&'s File, ()> {
        let f = proc.data().open_files.get(fd).ok_or(())?.as_ref().ok_or(())?;
        Ok(self.ftable().get(f))
    }
}
