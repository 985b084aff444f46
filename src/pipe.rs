//! Pipes: a bounded in-memory FIFO with a read end and a write end,
//! allocated out of one kernel page.

use core::ptr::NonNull;

use crate::file::{File, FileRef, FileType};
use crate::kernel::Kernel;
use crate::lock::Spinlock;
use crate::proc::{CurrentProc, WaitChannel};
use crate::vm::{UVAddr, PGSIZE};

pub const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,

    /// WaitChannel saying there are unread bytes in data.
    read_chan: WaitChannel,

    /// WaitChannel saying there is room to write in data.
    write_chan: WaitChannel,
}

static_assertions::const_assert!(core::mem::size_of::<Pipe>() <= PGSIZE);

enum PipeError {
    WaitForIo,
    Closed,
    BadCopy(usize),
}

impl Pipe {
    const fn new() -> Self {
        Self {
            inner: Spinlock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
            read_chan: WaitChannel::new(),
            write_chan: WaitChannel::new(),
        }
    }

    /// Read up to `n` bytes into user address `addr`, sleeping while the
    /// pipe is empty and the write end is open.
    pub fn read(
        &self,
        kernel: &Kernel,
        proc: &mut CurrentProc<'_>,
        addr: UVAddr,
        n: usize,
    ) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(kernel, proc, addr, n) {
                Ok(r) => {
                    //DOC: piperead-wakeup
                    self.write_chan.wakeup(kernel);
                    return Ok(r);
                }
                Err(PipeError::WaitForIo) => {
                    //DOC: piperead-sleep
                    self.read_chan.sleep(&mut inner, kernel);
                }
                Err(_) => return Err(()),
            }
        }
    }

    /// Write `n` bytes from user address `addr`, sleeping while the pipe
    /// is full and the read end is open.
    pub fn write(
        &self,
        kernel: &Kernel,
        proc: &mut CurrentProc<'_>,
        addr: UVAddr,
        n: usize,
    ) -> Result<usize, ()> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            match inner.try_write(kernel, proc, addr + written, n - written) {
                Ok(r) => {
                    written += r;
                    self.read_chan.wakeup(kernel);
                    if written < n {
                        //DOC: pipewrite-sleep
                        self.write_chan.sleep(&mut inner, kernel);
                    } else {
                        return Ok(written);
                    }
                }
                Err(PipeError::BadCopy(r)) => {
                    self.read_chan.wakeup(kernel);
                    return Ok(written + r);
                }
                Err(_) => return Err(()),
            }
        }
    }

    /// Close one end; the opposite side wakes to observe EOF or a broken
    /// pipe. Returns whether both ends are now closed.
    fn close_end(&self, kernel: &Kernel, writable: bool) -> bool {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            self.read_chan.wakeup(kernel);
        } else {
            inner.readopen = false;
            self.write_chan.wakeup(kernel);
        }
        !inner.readopen && !inner.writeopen
    }
}

impl PipeInner {
    fn try_write(
        &mut self,
        kernel: &Kernel,
        proc: &mut CurrentProc<'_>,
        addr: UVAddr,
        n: usize,
    ) -> Result<usize, PipeError> {
        if !self.readopen || proc.killed() {
            return Err(PipeError::Closed);
        }
        for i in 0..n {
            if self.nwrite == self.nread.wrapping_add(PIPESIZE as u32) {
                //DOC: pipewrite-full
                return Ok(i);
            }
            let mut ch = [0u8];
            if proc
                .memory_mut()
                .copy_in_bytes(kernel, &mut ch, addr + i)
                .is_err()
            {
                return Err(PipeError::BadCopy(i));
            }
            self.data[self.nwrite as usize % PIPESIZE] = ch[0];
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(n)
    }

    fn try_read(
        &mut self,
        kernel: &Kernel,
        proc: &mut CurrentProc<'_>,
        addr: UVAddr,
        n: usize,
    ) -> Result<usize, PipeError> {
        //DOC: pipe-empty
        if self.nread == self.nwrite && self.writeopen {
            if proc.killed() {
                return Err(PipeError::Closed);
            }
            return Err(PipeError::WaitForIo);
        }

        //DOC: piperead-copy
        for i in 0..n {
            if self.nread == self.nwrite {
                return Ok(i);
            }
            let ch = [self.data[self.nread as usize % PIPESIZE]];
            self.nread = self.nread.wrapping_add(1);
            if proc
                .memory_mut()
                .copy_out_bytes(kernel, addr + i, &ch)
                .is_err()
            {
                return Ok(i);
            }
        }
        Ok(n)
    }
}

/// An owning pointer to a page-backed `Pipe`. One read-only and one
/// write-only file share it; the page is freed when the second end
/// closes.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
    pa: u32,
}

// Access to the pipe goes through its spinlock.
unsafe impl Send for AllocatedPipe {}
unsafe impl Sync for AllocatedPipe {}

impl core::ops::Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Self::Target {
        // SAFETY: `ptr` refers to a live page-backed Pipe.
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Close one end; frees the backing page when both are closed.
    pub fn close(self, kernel: &Kernel, writable: bool) {
        if self.close_end(kernel, writable) {
            kernel.free_page(self.pa);
        }
    }
}

impl Kernel {
    /// Create a pipe and return its (read, write) file-table entries.
    pub fn alloc_pipe(&self) -> Result<(FileRef, FileRef), ()> {
        let pa = self.alloc_page().ok_or(())?;
        let pa = scopeguard::guard(pa, |pa| self.free_page(pa));
        let ptr = self.mem().p2v(*pa) as *mut Pipe;
        // SAFETY: the page is freshly allocated, large enough, and
        // page-aligned.
        unsafe { ptr.write(Pipe::new()) };
        let ptr = NonNull::new(ptr).unwrap();

        let f0 = self
            .ftable()
            .alloc(File::new(
                FileType::Pipe {
                    pipe: AllocatedPipe { ptr, pa: *pa },
                },
                true,
                false,
            ))
            .map_err(|_| ())?;
        let f0 = scopeguard::guard(f0, |f0| self.ftable().close(self, f0));
        let f1 = self
            .ftable()
            .alloc(File::new(
                FileType::Pipe {
                    pipe: AllocatedPipe { ptr, pa: *pa },
                },
                false,
                true,
            ))
            .map_err(|_| ())?;

        // Both files exist; the page now belongs to them.
        scopeguard::ScopeGuard::into_inner(pa);
        Ok((scopeguard::ScopeGuard::into_inner(f0), f1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileType;
    use crate::test_util::TestKernel;
    use crate::vm::PGSIZE;

    #[test]
    fn bytes_come_out_in_order() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut proc = t.proc();
        proc.memory_mut().alloc(k, PGSIZE).unwrap();

        let (rf, wf) = k.alloc_pipe().unwrap();
        let src = UVAddr::new(0x10);
        let dst = UVAddr::new(0x200);
        proc.memory_mut().copy_out_bytes(k, src, b"ABC").unwrap();

        // One byte per write, like the scenario's child.
        for i in 0..3 {
            let n = k
                .ftable()
                .get(&wf)
                .write(k, &mut proc, src + i, 1)
                .unwrap();
            assert_eq!(n, 1);
        }

        let n = k.ftable().get(&rf).read(k, &mut proc, dst, 4).unwrap();
        assert_eq!(n, 3);
        let mut got = [0u8; 3];
        proc.memory_mut().copy_in_bytes(k, &mut got, dst).unwrap();
        assert_eq!(&got, b"ABC");

        k.ftable().close(k, rf);
        k.ftable().close(k, wf);
    }

    #[test]
    fn read_hits_eof_after_writer_closes() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut proc = t.proc();
        proc.memory_mut().alloc(k, PGSIZE).unwrap();

        let (rf, wf) = k.alloc_pipe().unwrap();
        let addr = UVAddr::new(0x20);
        proc.memory_mut().copy_out_bytes(k, addr, b"Z").unwrap();
        k.ftable().get(&wf).write(k, &mut proc, addr, 1).unwrap();
        k.ftable().close(k, wf);

        let dst = UVAddr::new(0x80);
        assert_eq!(k.ftable().get(&rf).read(k, &mut proc, dst, 8).unwrap(), 1);
        // Drained and the write end is gone: EOF, not a sleep.
        assert_eq!(k.ftable().get(&rf).read(k, &mut proc, dst, 8).unwrap(), 0);
        k.ftable().close(k, rf);
    }

    #[test]
    fn write_to_closed_read_end_fails() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut proc = t.proc();
        proc.memory_mut().alloc(k, PGSIZE).unwrap();

        let (rf, wf) = k.alloc_pipe().unwrap();
        k.ftable().close(k, rf);
        let addr = UVAddr::new(0x20);
        assert!(k.ftable().get(&wf).write(k, &mut proc, addr, 1).is_err());
        k.ftable().close(k, wf);
    }

    #[test]
    fn a_full_pipe_takes_exactly_pipesize_bytes() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut proc = t.proc();
        proc.memory_mut().alloc(k, 2 * PGSIZE).unwrap();

        let (rf, wf) = k.alloc_pipe().unwrap();
        let addr = UVAddr::new(0);
        // Writing exactly PIPESIZE fills the buffer without blocking.
        assert_eq!(
            k.ftable()
                .get(&wf)
                .write(k, &mut proc, addr, PIPESIZE)
                .unwrap(),
            PIPESIZE
        );
        let dst = UVAddr::new(PGSIZE);
        assert_eq!(
            k.ftable()
                .get(&rf)
                .read(k, &mut proc, dst, PIPESIZE)
                .unwrap(),
            PIPESIZE
        );
        k.ftable().close(k, rf);
        k.ftable().close(k, wf);
    }

    #[test]
    fn page_is_reclaimed_when_both_ends_close() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let (rf, wf) = k.alloc_pipe().unwrap();
        let pa = match &k.ftable().get(&rf).typ {
            FileType::Pipe { pipe } => pipe.pa,
            _ => unreachable!(),
        };
        k.ftable().close(k, rf);
        k.ftable().close(k, wf);
        // The page went back to the allocator; it is the next one out.
        let got = k.alloc_page().unwrap();
        assert_eq!(got, pa);
        k.free_page(got);
    }
}
