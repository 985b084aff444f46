//! File-related system calls. Calls that mutate on-disk state run
//! inside a transaction.

use core::cell::UnsafeCell;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::file::{File, FileType};
use crate::fs::{InodeType, Path, Stat, T_FILE};
use crate::kernel::Kernel;
use crate::param::{MAXARG, MAXPATH, NDEV};
use crate::proc::CurrentProc;
use crate::vm::UVAddr;

bitflags! {
    pub struct OpenFlags: i32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
        const APPEND = 0x400;
    }
}

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

impl Kernel {
    pub(super) fn sys_dup(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let fd = proc.argfd(0)?;
        let f = {
            let file = proc.data().open_files[fd].as_ref().ok_or(())?;
            self.ftable().dup(file)
        };
        proc.fdalloc(f).map_err(|f| self.ftable().close(self, f))
    }

    /// Duplicate `ofd` onto `nfd`, closing whatever `nfd` held. Both
    /// must name open files; duplicating a descriptor onto itself is a
    /// no-op.
    pub(super) fn sys_dup2(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let ofd = proc.argfd(0)?;
        let nfd = proc.argfd(1)?;
        if ofd == nfd {
            return Ok(nfd);
        }
        let dup = {
            let file = proc.data().open_files[ofd].as_ref().ok_or(())?;
            self.ftable().dup(file)
        };
        let old = proc.data_mut().open_files[nfd].replace(dup);
        if let Some(old) = old {
            self.ftable().close(self, old);
        }
        Ok(nfd)
    }

    pub(super) fn sys_read(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let fd = proc.argfd(0)?;
        let n = proc.argint(2)?;
        if n < 0 {
            return Err(());
        }
        let addr = proc.argptr(1, n as usize)?;
        let f = self.open_file(proc, fd)?;
        f.read(self, proc, addr, n as usize)
    }

    pub(super) fn sys_write(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let fd = proc.argfd(0)?;
        let n = proc.argint(2)?;
        if n < 0 {
            return Err(());
        }
        let addr = proc.argptr(1, n as usize)?;
        let f = self.open_file(proc, fd)?;
        f.write(self, proc, addr, n as usize)
    }

    pub(super) fn sys_close(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let fd = proc.argfd(0)?;
        let f = proc.data_mut().open_files[fd].take().ok_or(())?;
        self.ftable().close(self, f);
        Ok(0)
    }

    pub(super) fn sys_fstat(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let fd = proc.argfd(0)?;
        let addr = proc.argptr(1, core::mem::size_of::<Stat>())?;
        let f = self.open_file(proc, fd)?;
        f.stat(self, proc, addr)?;
        Ok(0)
    }

    /// Create the path `new` as a link to the same inode as `old`.
    pub(super) fn sys_link(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let mut old_buf = [0u8; MAXPATH];
        let mut new_buf = [0u8; MAXPATH];
        let old = proc.argstr(0, &mut old_buf)?;
        let new = proc.argstr(1, &mut new_buf)?;
        let tx = self.begin_tx();
        self.link(&tx, proc.cwd(), &Path::new(old), &Path::new(new))?;
        Ok(0)
    }

    pub(super) fn sys_unlink(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let mut buf = [0u8; MAXPATH];
        let path = proc.argstr(0, &mut buf)?;
        let tx = self.begin_tx();
        self.unlink(&tx, proc.cwd(), &Path::new(path))?;
        Ok(0)
    }

    pub(super) fn sys_open(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let mut buf = [0u8; MAXPATH];
        let path = proc.argstr(0, &mut buf)?;
        let path = Path::new(path);
        let omode = OpenFlags::from_bits_truncate(proc.argint(1)?);

        let tx = self.begin_tx();
        let ip_ref = if omode.contains(OpenFlags::CREATE) {
            self.create(&tx, proc.cwd(), &path, InodeType::File)?
        } else {
            self.itable().namei(self, &tx, proc.cwd(), &path)?
        };

        let mut ip = self.itable().lock(self, &ip_ref);

        if ip.typ == InodeType::Dir && !omode.is_empty() {
            drop(ip);
            self.itable().put(self, &tx, ip_ref);
            return Err(());
        }
        if let InodeType::Device { major, .. } = ip.typ {
            if major as usize >= NDEV {
                drop(ip);
                self.itable().put(self, &tx, ip_ref);
                return Err(());
            }
        }

        // Starting offset: append mode begins at the end, and a bare
        // write-create truncates.
        let mut off = 0;
        if ip.typ == InodeType::File {
            if omode == OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::APPEND {
                off = ip.size;
            } else if omode == OpenFlags::WRONLY | OpenFlags::CREATE {
                ip.size = 0;
                ip.update(self, &tx);
            }
        }
        let typ = ip.typ;
        drop(ip);

        let filetype = match typ {
            InodeType::Device { major, .. } => FileType::Device { ip: ip_ref, major },
            _ => FileType::Inode {
                ip: ip_ref,
                off: UnsafeCell::new(off),
            },
        };
        let readable = !omode.intersects(OpenFlags::WRONLY);
        let writable = omode.intersects(OpenFlags::WRONLY | OpenFlags::RDWR);

        let f = match self.ftable().alloc(File::new(filetype, readable, writable)) {
            Ok(f) => f,
            Err(file) => {
                match file.typ {
                    FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                        self.itable().put(self, &tx, ip)
                    }
                    _ => {}
                }
                return Err(());
            }
        };
        match proc.fdalloc(f) {
            Ok(fd) => Ok(fd),
            Err(f) => {
                self.ftable().close(self, f);
                Err(())
            }
        }
    }

    pub(super) fn sys_mkdir(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let mut buf = [0u8; MAXPATH];
        let path = proc.argstr(0, &mut buf)?;
        let tx = self.begin_tx();
        let ip = self.create(&tx, proc.cwd(), &Path::new(path), InodeType::Dir)?;
        self.itable().put(self, &tx, ip);
        Ok(0)
    }

    pub(super) fn sys_mknod(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let mut buf = [0u8; MAXPATH];
        let path = proc.argstr(0, &mut buf)?;
        let major = proc.argint(1)?;
        let minor = proc.argint(2)?;
        if major < 0 || minor < 0 {
            return Err(());
        }
        let tx = self.begin_tx();
        let ip = self.create(
            &tx,
            proc.cwd(),
            &Path::new(path),
            InodeType::Device {
                major: major as u16,
                minor: minor as u16,
            },
        )?;
        self.itable().put(self, &tx, ip);
        Ok(0)
    }

    pub(super) fn sys_chdir(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let mut buf = [0u8; MAXPATH];
        let path = proc.argstr(0, &mut buf)?;
        let tx = self.begin_tx();
        let ip_ref = self.itable().namei(self, &tx, proc.cwd(), &Path::new(path))?;
        let ip = self.itable().lock(self, &ip_ref);
        if ip.typ != InodeType::Dir {
            drop(ip);
            self.itable().put(self, &tx, ip_ref);
            return Err(());
        }
        drop(ip);
        let old = proc.data_mut().cwd.replace(ip_ref).expect("chdir: no cwd");
        self.itable().put(self, &tx, old);
        Ok(0)
    }

    pub(super) fn sys_exec(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let mut path_buf = [0u8; MAXPATH];
        let path = proc.argstr(0, &mut path_buf)?;
        let uargv = proc.argint(1)? as u32 as usize;

        let mut args = scopeguard::guard(ArrayVec::<u32, MAXARG>::new(), |args| {
            for pa in args {
                self.free_page(pa);
            }
        });
        loop {
            if args.len() >= MAXARG {
                return Err(());
            }
            let uarg = proc.fetchint(UVAddr::new(uargv + 4 * args.len()))? as u32;
            if uarg == 0 {
                break;
            }
            let pa = self.alloc_page().ok_or(())?;
            args.push(pa);
            // SAFETY: the page was just allocated for this argument.
            let page = unsafe { self.mem().page_slice_mut(pa) };
            proc.fetchstr(UVAddr::new(uarg as usize), page)?;
        }

        self.exec(proc, &Path::new(path), &args)
    }

    pub(super) fn sys_pipe(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let fdarray = proc.argptr(0, 2 * core::mem::size_of::<i32>())?;
        let (rf, wf) = self.alloc_pipe()?;

        let fd0 = match proc.fdalloc(rf) {
            Ok(fd) => fd,
            Err(rf) => {
                self.ftable().close(self, rf);
                self.ftable().close(self, wf);
                return Err(());
            }
        };
        let fd1 = match proc.fdalloc(wf) {
            Ok(fd) => fd,
            Err(wf) => {
                let rf = proc.data_mut().open_files[fd0].take().unwrap();
                self.ftable().close(self, rf);
                self.ftable().close(self, wf);
                return Err(());
            }
        };

        let fds = [fd0 as i32, fd1 as i32];
        proc.memory_mut().copy_out(self, fdarray, &fds)?;
        Ok(0)
    }

    /// Reposition the offset of an open regular file. Every variant
    /// rejects targets outside [0, size]; no sparse growth.
    pub(super) fn sys_lseek(&self, proc: &mut CurrentProc<'_>) -> Result<usize, ()> {
        let fd = proc.argfd(0)?;
        let offset = proc.argint(1)?;
        let whence = proc.argint(2)?;
        let f = self.open_file(proc, fd)?;

        match &f.typ {
            FileType::Inode { ip, off } => {
                let guard = self.itable().lock(self, ip);
                if guard.typ.as_disk() != T_FILE {
                    return Err(());
                }
                let size = guard.size as i32;
                // SAFETY: the offset is accessed under the inode lock.
                let cur = unsafe { *off.get() } as i32;
                let new = match whence {
                    SEEK_SET => offset,
                    SEEK_CUR => cur + offset,
                    SEEK_END => size + offset,
                    _ => return Err(()),
                };
                if new < 0 || new > size {
                    return Err(());
                }
                // SAFETY: as above.
                unsafe { *off.get() = new as u32 };
                Ok(0)
            }
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::*;
    use core::convert::TryInto;
    use crate::fs::T_DIR;
    use zerocopy::AsBytes;
    use crate::proc::ProcState;
    use crate::test_util::TestKernel;
    use crate::vm::{UVAddr, PGSIZE};

    /// Place a NUL-terminated string into the harness process's memory.
    fn ustr(t: &TestKernel, addr: usize, s: &[u8]) {
        let k = t.kernel();
        let mut proc = t.proc();
        if proc.memory().size() < PGSIZE {
            proc.memory_mut().alloc(k, PGSIZE).unwrap();
        }
        proc.memory_mut()
            .copy_out_bytes(k, UVAddr::new(addr), s)
            .unwrap();
        proc.memory_mut()
            .copy_out_bytes(k, UVAddr::new(addr + s.len()), &[0])
            .unwrap();
    }

    fn ubytes(t: &TestKernel, addr: usize, s: &[u8]) {
        let k = t.kernel();
        let mut proc = t.proc();
        proc.memory_mut()
            .copy_out_bytes(k, UVAddr::new(addr), s)
            .unwrap();
    }

    fn uread(t: &TestKernel, addr: usize, n: usize) -> Vec<u8> {
        let k = t.kernel();
        let mut proc = t.proc();
        let mut buf = vec![0u8; n];
        proc.memory_mut()
            .copy_in_bytes(k, &mut buf, UVAddr::new(addr))
            .unwrap();
        buf
    }

    #[test]
    fn open_write_seek_read_round_trip() {
        let t = TestKernel::boot_default();
        ustr(&t, 0x10, b"/a");
        ubytes(&t, 0x40, b"hello");

        let fd = t.syscall(
            SYS_OPEN,
            &[0x10, (OpenFlags::WRONLY | OpenFlags::CREATE).bits()],
        );
        assert!(fd >= 0);
        assert_eq!(t.syscall(SYS_WRITE, &[fd, 0x40, 5]), 5);
        // Reopen read-only and read it back.
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
        let fd = t.syscall(SYS_OPEN, &[0x10, 0]);
        assert!(fd >= 0);
        assert_eq!(t.syscall(SYS_READ, &[fd, 0x80, 32]), 5);
        assert_eq!(uread(&t, 0x80, 5), b"hello");

        // lseek back to the start re-reads the same bytes.
        assert_eq!(t.syscall(SYS_LSEEK, &[fd, 0, SEEK_SET]), 0);
        assert_eq!(t.syscall(SYS_READ, &[fd, 0xC0, 32]), 5);
        assert_eq!(uread(&t, 0xC0, 5), b"hello");

        // Seeking past the size is rejected, as is a bad whence.
        assert_eq!(t.syscall(SYS_LSEEK, &[fd, 1, SEEK_END]), -1);
        assert_eq!(t.syscall(SYS_LSEEK, &[fd, 0, 9]), -1);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
    }

    #[test]
    fn append_mode_starts_at_the_end() {
        let t = TestKernel::boot_default();
        ustr(&t, 0x10, b"/log");
        ubytes(&t, 0x40, b"onetwo");

        let mode = OpenFlags::WRONLY | OpenFlags::CREATE;
        let fd = t.syscall(SYS_OPEN, &[0x10, mode.bits()]);
        assert_eq!(t.syscall(SYS_WRITE, &[fd, 0x40, 3]), 3);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);

        let fd = t.syscall(SYS_OPEN, &[0x10, (mode | OpenFlags::APPEND).bits()]);
        assert_eq!(t.syscall(SYS_WRITE, &[fd, 0x43, 3]), 3);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);

        let fd = t.syscall(SYS_OPEN, &[0x10, 0]);
        assert_eq!(t.syscall(SYS_READ, &[fd, 0x80, 16]), 6);
        assert_eq!(uread(&t, 0x80, 6), b"onetwo");

        // Without APPEND, write-create truncates.
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
        let fd = t.syscall(SYS_OPEN, &[0x10, mode.bits()]);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
        let fd = t.syscall(SYS_OPEN, &[0x10, 0]);
        assert_eq!(t.syscall(SYS_READ, &[fd, 0x80, 16]), 0);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
    }

    #[test]
    fn dup2_shares_the_offset() {
        let t = TestKernel::boot_default();
        ustr(&t, 0x10, b"/d2");
        ubytes(&t, 0x40, b"abcdef");

        let fd = t.syscall(
            SYS_OPEN,
            &[0x10, (OpenFlags::RDWR | OpenFlags::CREATE).bits()],
        );
        assert_eq!(t.syscall(SYS_WRITE, &[fd, 0x40, 6]), 6);
        assert_eq!(t.syscall(SYS_LSEEK, &[fd, 0, SEEK_SET]), 0);

        // Open a placeholder to occupy a second descriptor, then splat
        // the first over it.
        ustr(&t, 0x20, b"/other");
        let nfd = t.syscall(
            SYS_OPEN,
            &[0x20, (OpenFlags::WRONLY | OpenFlags::CREATE).bits()],
        );
        assert_ne!(fd, nfd);
        assert_eq!(t.syscall(SYS_DUP2, &[fd, nfd]), nfd);
        assert_eq!(t.syscall(SYS_DUP2, &[fd, fd]), fd);

        // Reading through one advances the other.
        assert_eq!(t.syscall(SYS_READ, &[fd, 0x80, 3]), 3);
        assert_eq!(t.syscall(SYS_READ, &[nfd, 0x90, 3]), 3);
        assert_eq!(uread(&t, 0x90, 3), b"def");

        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
        assert_eq!(t.syscall(SYS_CLOSE, &[nfd]), 0);
    }

    #[test]
    fn fstat_reports_the_inode() {
        let t = TestKernel::boot_default();
        ustr(&t, 0x10, b"/st");
        ubytes(&t, 0x40, b"123");
        let fd = t.syscall(
            SYS_OPEN,
            &[0x10, (OpenFlags::WRONLY | OpenFlags::CREATE).bits()],
        );
        assert_eq!(t.syscall(SYS_WRITE, &[fd, 0x40, 3]), 3);
        assert_eq!(t.syscall(SYS_FSTAT, &[fd, 0x200]), 0);

        let raw = uread(&t, 0x200, core::mem::size_of::<Stat>());
        let mut st = Stat::default();
        st.as_bytes_mut().copy_from_slice(&raw);
        assert_eq!(st.typ, crate::fs::T_FILE);
        assert_eq!(st.size, 3);
        assert_eq!(st.nlink, 1);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
    }

    #[test]
    fn mkdir_chdir_and_relative_paths() {
        let t = TestKernel::boot_default();
        ustr(&t, 0x10, b"/home");
        assert_eq!(t.syscall(SYS_MKDIR, &[0x10]), 0);
        assert_eq!(t.syscall(SYS_CHDIR, &[0x10]), 0);

        // A relative create lands inside the new cwd.
        ustr(&t, 0x20, b"file");
        let fd = t.syscall(
            SYS_OPEN,
            &[0x20, (OpenFlags::WRONLY | OpenFlags::CREATE).bits()],
        );
        assert!(fd >= 0);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);

        ustr(&t, 0x30, b"/home/file");
        let fd = t.syscall(SYS_OPEN, &[0x30, 0]);
        assert!(fd >= 0);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);

        // Walking back through ".." returns to the root.
        ustr(&t, 0x50, b"..");
        assert_eq!(t.syscall(SYS_CHDIR, &[0x50]), 0);
        ustr(&t, 0x60, b"home/file");
        let fd = t.syscall(SYS_OPEN, &[0x60, 0]);
        assert!(fd >= 0);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);

        // chdir to a non-directory fails.
        assert_eq!(t.syscall(SYS_CHDIR, &[0x30]), -1);
    }

    #[test]
    fn link_and_unlink_through_the_surface() {
        let t = TestKernel::boot_default();
        ustr(&t, 0x10, b"/orig");
        ubytes(&t, 0x40, b"data");
        let fd = t.syscall(
            SYS_OPEN,
            &[0x10, (OpenFlags::WRONLY | OpenFlags::CREATE).bits()],
        );
        assert_eq!(t.syscall(SYS_WRITE, &[fd, 0x40, 4]), 4);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);

        ustr(&t, 0x20, b"/alias");
        assert_eq!(t.syscall(SYS_LINK, &[0x10, 0x20]), 0);
        assert_eq!(t.syscall(SYS_UNLINK, &[0x10]), 0);
        assert_eq!(t.syscall(SYS_OPEN, &[0x10, 0]), -1);

        let fd = t.syscall(SYS_OPEN, &[0x20, 0]);
        assert_eq!(t.syscall(SYS_READ, &[fd, 0x80, 16]), 4);
        assert_eq!(uread(&t, 0x80, 4), b"data");
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
        // Unlinking again reports failure.
        assert_eq!(t.syscall(SYS_UNLINK, &[0x10]), -1);
    }

    #[test]
    fn mknod_creates_a_device_inode() {
        let t = TestKernel::boot_default();
        ustr(&t, 0x10, b"/dev0");
        assert_eq!(t.syscall(SYS_MKNOD, &[0x10, 3, 7]), 0);
        let fd = t.syscall(SYS_OPEN, &[0x10, 0]);
        assert!(fd >= 0);
        assert_eq!(t.syscall(SYS_FSTAT, &[fd, 0x200]), 0);
        let raw = uread(&t, 0x200, core::mem::size_of::<Stat>());
        let mut st = Stat::default();
        st.as_bytes_mut().copy_from_slice(&raw);
        assert_eq!(st.typ, crate::fs::T_DEV);
        // Reading an unregistered device fails rather than panicking.
        assert_eq!(t.syscall(SYS_READ, &[fd, 0x80, 1]), -1);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
    }

    #[test]
    fn bad_descriptors_and_bad_pointers_fail() {
        let t = TestKernel::boot_default();
        assert_eq!(t.syscall(SYS_READ, &[42, 0x80, 1]), -1);
        assert_eq!(t.syscall(SYS_CLOSE, &[-1]), -1);
        // A buffer outside the address space is rejected up front.
        ustr(&t, 0x10, b"/px");
        let fd = t.syscall(
            SYS_OPEN,
            &[0x10, (OpenFlags::WRONLY | OpenFlags::CREATE).bits()],
        );
        assert_eq!(t.syscall(SYS_WRITE, &[fd, 0x7000_0000, 4]), -1);
        assert_eq!(t.syscall(SYS_WRITE, &[fd, 0x40, -3]), -1);
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
        // Unknown numbers print a diagnostic and fail.
        assert_eq!(t.syscall(999, &[]), -1);
    }

    #[test]
    fn pipe_syscall_wires_two_descriptors() {
        let t = TestKernel::boot_default();
        // Make room for the fd array.
        ustr(&t, 0x10, b"");
        assert_eq!(t.syscall(SYS_PIPE, &[0x100]), 0);
        let raw = uread(&t, 0x100, 8);
        let rfd = i32::from_le_bytes(raw[0..4].try_into().unwrap());
        let wfd = i32::from_le_bytes(raw[4..8].try_into().unwrap());
        assert_ne!(rfd, wfd);

        ubytes(&t, 0x40, b"ping");
        assert_eq!(t.syscall(SYS_WRITE, &[wfd, 0x40, 4]), 4);
        assert_eq!(t.syscall(SYS_READ, &[rfd, 0x80, 8]), 4);
        assert_eq!(uread(&t, 0x80, 4), b"ping");
        // Wrong directions are refused.
        assert_eq!(t.syscall(SYS_WRITE, &[rfd, 0x40, 1]), -1);
        assert_eq!(t.syscall(SYS_READ, &[wfd, 0x80, 1]), -1);
        assert_eq!(t.syscall(SYS_CLOSE, &[rfd]), 0);
        assert_eq!(t.syscall(SYS_CLOSE, &[wfd]), 0);
    }

    #[test]
    fn fork_copies_the_caller() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        ustr(&t, 0x10, b"/shared");
        let fd = t.syscall(
            SYS_OPEN,
            &[0x10, (OpenFlags::RDWR | OpenFlags::CREATE).bits()],
        );
        assert!(fd >= 0);

        let child_pid = t.syscall(SYS_FORK, &[]);
        assert!(child_pid > 0);

        // Find the child and inspect what fork built.
        let child = {
            let table = k.procs().table().lock();
            (0..crate::param::NPROC)
                .find(|&i| table.info[i].pid == child_pid)
                .unwrap()
        };
        let my_idx = t.proc().idx();
        {
            let table = k.procs().table().lock();
            assert_eq!(table.info[child].state, ProcState::Runnable);
            assert_eq!(table.info[child].parent, Some(my_idx));
        }
        // SAFETY: the child is runnable but never scheduled in tests.
        let cdata = unsafe { &*k.procs().proc(child).data.get() };
        assert_eq!(unsafe { (*cdata.trap_frame).eax }, 0);

        // The open file is shared by reference: two owners now.
        let proc = t.proc();
        let fref = proc.data().open_files[fd as usize].as_ref().unwrap();
        assert_eq!(k.ftable().refcnt(fref), 2);

        // Same story for the working directory.
        let cwd = proc.cwd();
        assert!(k.itable().refcnt(cwd) >= 2);

        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
    }

    #[test]
    fn wait_reaps_a_zombie_child() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let child_pid = t.syscall(SYS_FORK, &[]);
        assert!(child_pid > 0);

        let child = {
            let table = k.procs().table().lock();
            (0..crate::param::NPROC)
                .find(|&i| table.info[i].pid == child_pid)
                .unwrap()
        };
        // Stage the child as exited; wait() must reap without sleeping.
        {
            // Its private resources go the way exit would send them.
            let cdata = unsafe { &mut *k.procs().proc(child).data.get() };
            for f in cdata.open_files.iter_mut() {
                if let Some(f) = f.take() {
                    k.ftable().close(k, f);
                }
            }
            let tx = k.begin_tx();
            let cwd = cdata.cwd.take().unwrap();
            k.itable().put(k, &tx, cwd);
            drop(tx);
            let mut table = k.procs().table().lock();
            table.info[child].state = ProcState::Zombie;
        }

        assert_eq!(t.syscall(SYS_WAIT, &[]), child_pid);
        let table = k.procs().table().lock();
        assert_eq!(table.info[child].state, ProcState::Unused);
        assert_eq!(table.info[child].pid, 0);
        drop(table);

        // No children left: wait fails instead of blocking forever.
        assert_eq!(t.syscall(SYS_WAIT, &[]), -1);
    }

    #[test]
    fn process_queries_answer() {
        let t = TestKernel::boot_default();
        let pid = t.syscall(SYS_GETPID, &[]);
        assert!(pid > 0);
        assert_eq!(t.syscall(SYS_UPTIME, &[]), 0);
        assert_eq!(t.syscall(SYS_KILL, &[9999]), -1);

        // sbrk grows and reports the old break.
        let before = t.proc().memory().size();
        let got = t.syscall(SYS_SBRK, &[PGSIZE as i32]);
        assert_eq!(got as usize, before);
        assert_eq!(t.proc().memory().size(), before + PGSIZE);

        // date fills in something plausible.
        assert_eq!(t.syscall(SYS_DATE, &[0x300]), 0);
        let raw = uread(&t, 0x300, core::mem::size_of::<crate::arch::RtcDate>());
        let mut date = crate::arch::RtcDate::default();
        date.as_bytes_mut().copy_from_slice(&raw);
        assert!(date.month >= 1 && date.month <= 12);
    }

    #[test]
    fn root_directory_lists_itself() {
        let t = TestKernel::boot_default();
        ustr(&t, 0x10, b"/");
        let fd = t.syscall(SYS_OPEN, &[0x10, 0]);
        assert!(fd >= 0);
        assert_eq!(t.syscall(SYS_FSTAT, &[fd, 0x200]), 0);
        let raw = uread(&t, 0x200, core::mem::size_of::<Stat>());
        let mut st = Stat::default();
        st.as_bytes_mut().copy_from_slice(&raw);
        assert_eq!(st.typ, T_DIR);
        // Opening the root for writing is refused.
        assert_eq!(t.syscall(SYS_CLOSE, &[fd]), 0);
        assert_eq!(t.syscall(SYS_OPEN, &[0x10, OpenFlags::WRONLY.bits()]), -1);
    }
}
