//! Support for system calls that involve file descriptors: the global
//! table of open-file descriptions and the read/write/stat operations
//! over them.

use core::cell::UnsafeCell;
use core::cmp;

use array_macro::array;

use crate::fs::{InodeRef, InodeType, Stat};
use crate::kernel::Kernel;
use crate::lock::Spinlock;
use crate::param::{BSIZE, MAXOPBLOCKS, NDEV, NFILE};
use crate::pipe::AllocatedPipe;
use crate::proc::CurrentProc;
use crate::vm::UVAddr;

pub enum FileType {
    None,
    Pipe {
        pipe: AllocatedPipe,
    },
    Inode {
        ip: InodeRef,
        /// The read/write offset. Mutated through a shared reference,
        /// which is sound because every use happens while the file's
        /// inode sleep-lock is held.
        off: UnsafeCell<u32>,
    },
    Device {
        ip: InodeRef,
        major: u16,
    },
}

pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

impl File {
    pub const fn new(typ: FileType, readable: bool, writable: bool) -> Self {
        Self {
            typ,
            readable,
            writable,
        }
    }

    const fn none() -> Self {
        Self::new(FileType::None, false, false)
    }
}

/// Map major device number to device read/write functions. The console
/// collaborator installs itself at boot.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<fn(&Kernel, &mut CurrentProc<'_>, UVAddr, usize) -> Result<usize, ()>>,
    pub write: Option<fn(&Kernel, &mut CurrentProc<'_>, UVAddr, usize) -> Result<usize, ()>>,
}

impl Devsw {
    pub const fn none() -> Self {
        Self {
            read: None,
            write: None,
        }
    }
}

pub type DevswTable = Spinlock<[Devsw; NDEV]>;

pub const fn new_devsw_table() -> DevswTable {
    Spinlock::new("devsw", [Devsw::none(); NDEV])
}

struct FileSlot {
    inner: UnsafeCell<File>,
}

/// A counted handle to a file-table slot. Not Clone: new references come
/// from `Ftable::dup` and die in `Ftable::close`.
#[derive(Debug)]
pub struct FileRef(usize);

/// Global table of open-file descriptions. Reference counts live under
/// the table spinlock; the `File` in a slot is written only on the 0→1
/// transition of `alloc` and the 1→0 transition of `close`, and is
/// otherwise read-shared.
pub struct Ftable {
    refs: Spinlock<[u32; NFILE]>,
    files: [FileSlot; NFILE],
}

// Slots are only mutated while their refcount pins them to one owner;
// FileType's interior offsets follow the inode-lock protocol.
unsafe impl Sync for Ftable {}

impl Ftable {
    pub const fn new() -> Self {
        Self {
            refs: Spinlock::new("ftable", [0; NFILE]),
            files: array![_ => FileSlot { inner: UnsafeCell::new(File::none()) }; NFILE],
        }
    }

    /// Allocate a file-table slot for `file`. A full table hands the
    /// file back so the caller can release whatever it holds.
    pub fn alloc(&self, file: File) -> Result<FileRef, File> {
        let mut refs = self.refs.lock();
        for (i, r) in refs.iter_mut().enumerate() {
            if *r == 0 {
                *r = 1;
                // SAFETY: refcount was 0, so no other reference exists.
                unsafe { *self.files[i].inner.get() = file };
                return Ok(FileRef(i));
            }
        }
        Err(file)
    }

    pub fn get(&self, f: &FileRef) -> &File {
        // SAFETY: a live FileRef pins the slot's contents.
        unsafe { &*self.files[f.0].inner.get() }
    }

    /// Increment the reference count of `f`'s slot.
    pub fn dup(&self, f: &FileRef) -> FileRef {
        let mut refs = self.refs.lock();
        assert!(refs[f.0] >= 1, "filedup");
        refs[f.0] += 1;
        FileRef(f.0)
    }

    /// Drop a reference; the last one closes the underlying object. An
    /// inode-backed file closes inside a transaction because dropping
    /// the inode reference may trigger truncation.
    pub fn close(&self, kernel: &Kernel, f: FileRef) {
        let file = {
            let mut refs = self.refs.lock();
            assert!(refs[f.0] >= 1, "fileclose");
            refs[f.0] -= 1;
            if refs[f.0] > 0 {
                return;
            }
            // SAFETY: the count just hit 0; we are the sole owner.
            unsafe { core::ptr::replace(self.files[f.0].inner.get(), File::none()) }
        };

        match file.typ {
            FileType::None => {}
            FileType::Pipe { pipe } => pipe.close(kernel, file.writable),
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let tx = kernel.begin_tx();
                kernel.itable().put(kernel, &tx, ip);
            }
        }
    }

    pub fn refcnt(&self, f: &FileRef) -> u32 {
        self.refs.lock()[f.0]
    }
}

impl File {
    /// Get metadata about file `self`, copied out to user address
    /// `addr`.
    pub fn stat(
        &self,
        kernel: &Kernel,
        proc: &mut CurrentProc<'_>,
        addr: UVAddr,
    ) -> Result<(), ()> {
        match &self.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let st: Stat = {
                    let guard = kernel.itable().lock(kernel, ip);
                    guard.stat()
                };
                proc.memory_mut().copy_out(kernel, addr, &st)
            }
            _ => Err(()),
        }
    }

    /// Read from file `self` into user address `addr`.
    pub fn read(
        &self,
        kernel: &Kernel,
        proc: &mut CurrentProc<'_>,
        addr: UVAddr,
        n: usize,
    ) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(kernel, proc, addr, n),
            FileType::Inode { ip, off } => {
                let mut guard = kernel.itable().lock(kernel, ip);
                // SAFETY: the offset is accessed under the inode lock.
                let curr = unsafe { *off.get() };
                let r = guard.read_internal(kernel, curr, n as u32, |tot, src| {
                    proc.memory_mut()
                        .copy_out_bytes(kernel, addr + tot as usize, src)
                });
                if let Ok(read) = r {
                    // SAFETY: as above.
                    unsafe { *off.get() = curr + read as u32 };
                }
                r
            }
            FileType::Device { major, .. } => {
                let dev = *kernel.devsw().lock().get(*major as usize).ok_or(())?;
                (dev.read.ok_or(())?)(kernel, proc, addr, n)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Write to file `self` from user address `addr`.
    pub fn write(
        &self,
        kernel: &Kernel,
        proc: &mut CurrentProc<'_>,
        addr: UVAddr,
        n: usize,
    ) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(kernel, proc, addr, n),
            FileType::Inode { ip, off } => {
                // Write a few blocks at a time to avoid exceeding the
                // maximum log transaction size, including i-node,
                // indirect block, allocation blocks, and 2 blocks of
                // slop for non-aligned writes.
                let max = (MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE;
                let mut written = 0;
                while written < n {
                    let chunk = cmp::min(n - written, max);
                    let tx = kernel.begin_tx();
                    let mut guard = kernel.itable().lock(kernel, ip);
                    // SAFETY: the offset is accessed under the inode
                    // lock.
                    let curr = unsafe { *off.get() };
                    let r = guard.write_internal(kernel, &tx, curr, chunk as u32, |tot, dst| {
                        proc.memory_mut().copy_in_bytes(
                            kernel,
                            dst,
                            addr + written + tot as usize,
                        )
                    })?;
                    // SAFETY: as above.
                    unsafe { *off.get() = curr + r as u32 };
                    if r < chunk {
                        // Short write, e.g. out of blocks.
                        return Err(());
                    }
                    written += chunk;
                }
                Ok(n)
            }
            FileType::Device { major, .. } => {
                let dev = *kernel.devsw().lock().get(*major as usize).ok_or(())?;
                (dev.write.ok_or(())?)(kernel, proc, addr, n)
            }
            FileType::None => panic!("File::write"),
        }
    }
}

impl CurrentProc<'_> {
    /// Allocate a file descriptor for the given file, or hand the file
    /// back if the descriptor table is full.
    pub fn fdalloc(&mut self, f: FileRef) -> Result<usize, FileRef> {
        for (fd, slot) in self.data_mut().open_files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(f);
                return Ok(fd);
            }
        }
        Err(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{InodeType, Path};
    use crate::test_util::TestKernel;
    use crate::vm::PGSIZE;

    fn open_new(t: &TestKernel, path: &[u8]) -> FileRef {
        let k = t.kernel();
        let proc = t.proc();
        let tx = k.begin_tx();
        let ip = k
            .create(&tx, proc.cwd(), &Path::from_bytes(path), InodeType::File)
            .unwrap();
        {
            let mut g = k.itable().lock(k, &ip);
            g.nlink = 1;
            g.update(k, &tx);
        }
        drop(tx);
        k.ftable()
            .alloc(File::new(
                FileType::Inode {
                    ip,
                    off: UnsafeCell::new(0),
                },
                true,
                true,
            ))
            .map_err(|_| ())
            .unwrap()
    }

    #[test]
    fn dup_and_close_track_references() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let f = open_new(&t, b"/refs");
        assert_eq!(k.ftable().refcnt(&f), 1);
        let g = k.ftable().dup(&f);
        assert_eq!(k.ftable().refcnt(&f), 2);
        k.ftable().close(k, g);
        assert_eq!(k.ftable().refcnt(&f), 1);
        k.ftable().close(k, f);
    }

    #[test]
    fn reads_and_writes_share_the_offset() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut proc = t.proc();
        proc.memory_mut().alloc(k, PGSIZE).unwrap();
        let addr = crate::vm::UVAddr::new(0x40);

        let f = open_new(&t, b"/data");
        proc.memory_mut()
            .copy_out_bytes(k, addr, b"first-half|second-half")
            .unwrap();
        let file = k.ftable().get(&f);
        assert_eq!(file.write(k, &mut proc, addr, 22).unwrap(), 22);

        // The same description sees its own offset advance; a dup
        // shares it by reference.
        let d = k.ftable().dup(&f);
        if let FileType::Inode { off, .. } = &k.ftable().get(&d).typ {
            // SAFETY: nothing else touches the file in this test.
            assert_eq!(unsafe { *off.get() }, 22);
        } else {
            panic!("not an inode file");
        }

        k.ftable().close(k, d);
        k.ftable().close(k, f);
    }

    #[test]
    fn read_returns_what_write_stored() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut proc = t.proc();
        proc.memory_mut().alloc(k, PGSIZE).unwrap();

        let f = open_new(&t, b"/echo");
        let out = crate::vm::UVAddr::new(0x100);
        proc.memory_mut().copy_out_bytes(k, out, b"xyzzy").unwrap();
        let file = k.ftable().get(&f);
        assert_eq!(file.write(k, &mut proc, out, 5).unwrap(), 5);

        // Rewind by hand and read back through the file layer.
        if let FileType::Inode { off, .. } = &file.typ {
            // SAFETY: nothing else touches the file in this test.
            unsafe { *off.get() = 0 };
        }
        let back = crate::vm::UVAddr::new(0x300);
        assert_eq!(file.read(k, &mut proc, back, 64).unwrap(), 5);
        let mut got = [0u8; 5];
        proc.memory_mut().copy_in_bytes(k, &mut got, back).unwrap();
        assert_eq!(&got, b"xyzzy");

        k.ftable().close(k, f);
    }

    #[test]
    fn direction_flags_are_enforced() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut proc = t.proc();
        proc.memory_mut().alloc(k, PGSIZE).unwrap();
        let addr = crate::vm::UVAddr::new(0x80);

        let f = open_new(&t, b"/ro");
        // Rebuild as read-only by hand.
        let ip = match k.ftable().get(&f).typ {
            FileType::Inode { ref ip, .. } => k.itable().dup(ip),
            _ => unreachable!(),
        };
        k.ftable().close(k, f);
        let ro = k
            .ftable()
            .alloc(File::new(
                FileType::Inode {
                    ip,
                    off: UnsafeCell::new(0),
                },
                true,
                false,
            ))
            .map_err(|_| ())
            .unwrap();
        let file = k.ftable().get(&ro);
        assert!(file.write(k, &mut proc, addr, 1).is_err());
        assert!(file.read(k, &mut proc, addr, 1).is_ok());
        k.ftable().close(k, ro);
    }

    #[test]
    fn fdalloc_fills_the_descriptor_table() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut proc = t.proc();

        let mut fds = Vec::new();
        for i in 0..crate::param::NOFILE {
            let f = open_new(&t, format!("/fd{}", i).as_bytes());
            fds.push(proc.fdalloc(f).unwrap());
        }
        // Table is full now.
        let extra = open_new(&t, b"/fdx");
        let back = proc.fdalloc(extra).unwrap_err();
        k.ftable().close(k, back);

        for fd in fds {
            let f = proc.data_mut().open_files[fd].take().unwrap();
            k.ftable().close(k, f);
        }
    }
}
