//! Inodes.
//!
//! An inode describes a single unnamed file. The inode disk structure
//! holds metadata: the file's type, its size, the number of links
//! referring to it, and the list of blocks holding the file's content.
//!
//! The inodes are laid out sequentially on disk at
//! `superblock.inodestart`. Each inode has a number, indicating its
//! position on the disk.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a
//! place for synchronizing access to inodes used by multiple processes.
//! The in-memory inodes include book-keeping information that is not
//! stored on disk: the reference count and the valid flag.
//!
//! An inode and its in-memory representation go through a sequence of
//! states before they can be used by the rest of the file system code.
//!
//! * Allocation: an inode is allocated if its type (on disk) is
//!   non-zero. `Itable::alloc_inode` allocates, and `Itable::put` frees
//!   if the reference and link counts have fallen to zero.
//!
//! * Referencing in table: an entry in the inode table is free if its
//!   reference count is zero. Otherwise it tracks the number of
//!   in-memory handles to the entry (open files and current
//!   directories). `Itable::get` finds or creates a table entry and
//!   increments its count; `Itable::put` decrements it.
//!
//! * Valid: the information (type, size, &c) in a table entry is only
//!   correct once it has been read from disk, which `Itable::lock` does
//!   lazily on first lock.
//!
//! * Locked: file system code may only examine and modify the
//!   information in an inode and its content if it holds the per-inode
//!   sleep-lock, i.e. through an [`InodeGuard`].
//!
//! Thus a typical sequence is:
//!   let ip = itable.get(dev, inum);
//!   let mut guard = itable.lock(kernel, &ip);
//!   ... examine and modify through the guard ...
//!   drop(guard);
//!   itable.put(kernel, &tx, ip);
//!
//! Locking is separate from `get` so that system calls can hold a
//! long-term reference to an inode (as for an open file) and only lock
//! it for short periods (e.g. in read). The separation also helps avoid
//! deadlock and races during pathname lookup.
//!
//! The table spinlock protects the reference counts and the (dev, inum)
//! identity of each slot; the per-inode sleep-lock protects everything
//! else.

use core::mem;

use array_macro::array;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use super::{FileName, Path, Stat, Tx, IPB, T_DEV, T_DIR, T_FILE};
use crate::kernel::Kernel;
use crate::lock::{SleepLock, SleepLockGuard, Spinlock};
use crate::param::{BSIZE, NINODE, ROOTDEV};

/// Root i-number.
pub const ROOTINO: u32 = 1;

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// Directory entry name width.
pub const DIRSIZ: usize = 14;

/// In-memory copy of an inode's disk fields.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

impl InodeType {
    pub fn as_disk(&self) -> i16 {
        match self {
            InodeType::None => 0,
            InodeType::Dir => T_DIR,
            InodeType::File => T_FILE,
            InodeType::Device { .. } => T_DEV,
        }
    }
}

pub struct InodeInner {
    /// The disk fields below have been read?
    pub valid: bool,

    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,
    pub addr_direct: [u32; NDIRECT],
    pub addr_indirect: u32,
}

/// On-disk inode structure.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct Dinode {
    /// File type; 0 marks a free inode.
    pub(crate) typ: i16,

    /// Major device number (T_DEV only).
    pub(crate) major: i16,

    /// Minor device number (T_DEV only).
    pub(crate) minor: i16,

    /// Number of links to inode in file system.
    pub(crate) nlink: i16,

    /// Size of file (bytes).
    pub(crate) size: u32,

    /// Direct data block addresses.
    pub(crate) addr_direct: [u32; NDIRECT],

    /// Indirect data block address.
    pub(crate) addr_indirect: u32,
}

static_assertions::const_assert_eq!(mem::size_of::<Dinode>(), 64);

/// A directory is a file containing a sequence of Dirent structures.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Dirent {
    pub inum: u16,
    pub(crate) name: [u8; DIRSIZ],
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

static_assertions::const_assert_eq!(DIRENT_SIZE, 16);

impl Dirent {
    /// Fill in the name, NUL-padded when shorter than DIRSIZ.
    fn set_name(&mut self, name: &FileName<'_>) {
        let bytes = name.as_bytes();
        self.name = [0; DIRSIZ];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    fn name_matches(&self, name: &FileName<'_>) -> bool {
        let len = self.name.iter().position(|c| *c == 0).unwrap_or(DIRSIZ);
        &self.name[..len] == name.as_bytes()
    }
}

struct ISlot {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

struct InodeEntry {
    inner: SleepLock<InodeInner>,
}

/// A counted handle to an inode table slot. Not Clone: new references
/// come from `Itable::get`/`dup` and die in `Itable::put`.
pub struct InodeRef {
    idx: usize,
    pub dev: u32,
    pub inum: u32,
}

/// A locked inode: the holder may examine and modify the disk fields.
pub struct InodeGuard<'s> {
    pub dev: u32,
    pub inum: u32,
    guard: SleepLockGuard<'s, InodeInner>,
}

impl core::ops::Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl core::ops::DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

pub struct Itable {
    ctl: Spinlock<[ISlot; NINODE]>,
    entries: [InodeEntry; NINODE],
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            ctl: Spinlock::new(
                "itable",
                array![_ => ISlot { dev: 0, inum: 0, refcnt: 0 }; NINODE],
            ),
            entries: array![_ => InodeEntry {
                inner: SleepLock::new("inode", InodeInner {
                    valid: false,
                    typ: InodeType::None,
                    nlink: 0,
                    size: 0,
                    addr_direct: [0; NDIRECT],
                    addr_indirect: 0,
                }),
            }; NINODE],
        }
    }

    /// Find the inode with number `inum` on device `dev` and return its
    /// in-memory handle. Does not lock the inode and does not read it
    /// from disk.
    pub fn get(&self, dev: u32, inum: u32) -> InodeRef {
        let mut ctl = self.ctl.lock();

        let mut empty = None;
        for (i, slot) in ctl.iter_mut().enumerate() {
            if slot.refcnt > 0 && slot.dev == dev && slot.inum == inum {
                slot.refcnt += 1;
                return InodeRef { idx: i, dev, inum };
            }
            if empty.is_none() && slot.refcnt == 0 {
                empty = Some(i);
            }
        }

        // Recycle an unreferenced slot.
        let i = empty.expect("iget: no inodes");
        ctl[i] = ISlot { dev, inum, refcnt: 1 };
        // SAFETY: refcnt was 0 and the table lock is held, so no one
        // holds or can acquire this inode's sleep-lock.
        unsafe { (*self.entries[i].inner.get_mut_raw()).valid = false };
        InodeRef { idx: i, dev, inum }
    }

    /// Increment the reference count of `ip` and return a second handle.
    pub fn dup(&self, ip: &InodeRef) -> InodeRef {
        let mut ctl = self.ctl.lock();
        assert!(ctl[ip.idx].refcnt >= 1, "idup");
        ctl[ip.idx].refcnt += 1;
        InodeRef {
            idx: ip.idx,
            dev: ip.dev,
            inum: ip.inum,
        }
    }

    /// Lock `ip`, reading its fields from disk on first use.
    pub fn lock<'s>(&'s self, kernel: &'s Kernel, ip: &InodeRef) -> InodeGuard<'s> {
        let mut guard = self.entries[ip.idx].inner.lock(kernel);
        if !guard.valid {
            let sb = *kernel.fs().superblock();
            let bp = kernel.bread(ip.dev, sb.iblock(ip.inum));
            let off = (ip.inum as usize % IPB) * mem::size_of::<Dinode>();
            let (dip, _) = LayoutVerified::<&[u8], Dinode>::new_from_prefix(&bp.data()[off..])
                .expect("ilock: dinode");

            guard.typ = match dip.typ {
                0 => InodeType::None,
                T_DIR => InodeType::Dir,
                T_FILE => InodeType::File,
                T_DEV => InodeType::Device {
                    major: dip.major as u16,
                    minor: dip.minor as u16,
                },
                t => panic!("ilock: unknown type {}", t),
            };
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addr_direct = dip.addr_direct;
            guard.addr_indirect = dip.addr_indirect;
            drop(bp);
            guard.valid = true;
            assert!(guard.typ != InodeType::None, "ilock: no type");
        }
        InodeGuard {
            dev: ip.dev,
            inum: ip.inum,
            guard,
        }
    }

    /// Drop a reference to an in-memory inode. If that was the last
    /// reference and the inode has no links, free it on disk; that
    /// modification is why every put happens inside a transaction.
    pub fn put(&self, kernel: &Kernel, tx: &Tx<'_>, ip: InodeRef) {
        let guard = self.entries[ip.idx].inner.lock(kernel);
        if guard.valid && guard.nlink == 0 {
            let r = self.ctl.lock()[ip.idx].refcnt;
            if r == 1 {
                // The inode has no links and no other references:
                // truncate and free. No one else can lock it, so this
                // cannot deadlock.
                let mut guard = InodeGuard {
                    dev: ip.dev,
                    inum: ip.inum,
                    guard,
                };
                guard.itrunc(kernel, tx);
                guard.typ = InodeType::None;
                guard.update(kernel, tx);
                guard.valid = false;
                drop(guard);
                let mut ctl = self.ctl.lock();
                ctl[ip.idx].refcnt -= 1;
                return;
            }
        }
        drop(guard);
        let mut ctl = self.ctl.lock();
        assert!(ctl[ip.idx].refcnt >= 1, "iput");
        ctl[ip.idx].refcnt -= 1;
    }

    /// Allocate an inode on device `dev` by scanning the inode blocks
    /// for a free slot. Marks it allocated on disk with the given type
    /// and returns an unlocked, referenced handle.
    pub fn alloc_inode(
        &self,
        kernel: &Kernel,
        tx: &Tx<'_>,
        dev: u32,
        typ: InodeType,
    ) -> Result<InodeRef, ()> {
        assert!(typ != InodeType::None, "ialloc");
        let sb = *kernel.fs().superblock();
        for inum in 1..sb.ninodes {
            let mut bp = kernel.bread(dev, sb.iblock(inum));
            let off = (inum as usize % IPB) * mem::size_of::<Dinode>();
            let free = {
                let (dip, _) =
                    LayoutVerified::<&[u8], Dinode>::new_from_prefix(&bp.data()[off..])
                        .expect("ialloc: dinode");
                dip.typ == 0
            };
            if free {
                {
                    let (mut dip, _) = LayoutVerified::<&mut [u8], Dinode>::new_from_prefix(
                        &mut bp.data_mut()[off..],
                    )
                    .expect("ialloc: dinode");
                    *dip = Dinode {
                        typ: typ.as_disk(),
                        major: match typ {
                            InodeType::Device { major, .. } => major as i16,
                            _ => 0,
                        },
                        minor: match typ {
                            InodeType::Device { minor, .. } => minor as i16,
                            _ => 0,
                        },
                        nlink: 0,
                        size: 0,
                        addr_direct: [0; NDIRECT],
                        addr_indirect: 0,
                    };
                }
                // Mark it allocated on the disk.
                tx.write(bp);
                return Ok(self.get(dev, inum));
            }
        }
        // Out of free inodes; user space sees -1.
        Err(())
    }

    /// Current reference count of `ip`; identity bookkeeping only.
    pub fn refcnt(&self, ip: &InodeRef) -> u32 {
        self.ctl.lock()[ip.idx].refcnt
    }

    /// Look up a path and return its inode.
    /// Runs inside a transaction because it may put a freshly unlinked
    /// inode.
    pub fn namei(
        &self,
        kernel: &Kernel,
        tx: &Tx<'_>,
        cwd: &InodeRef,
        path: &Path<'_>,
    ) -> Result<InodeRef, ()> {
        self.namex(kernel, tx, cwd, path, false).map(|(ip, _)| ip)
    }

    /// Look up the parent directory of a path; also returns the final
    /// element.
    pub fn nameiparent<'p>(
        &self,
        kernel: &Kernel,
        tx: &Tx<'_>,
        cwd: &InodeRef,
        path: &Path<'p>,
    ) -> Result<(InodeRef, FileName<'p>), ()> {
        let (ip, name) = self.namex(kernel, tx, cwd, path, true)?;
        Ok((ip, name.ok_or(())?))
    }

    fn namex<'p>(
        &self,
        kernel: &Kernel,
        tx: &Tx<'_>,
        cwd: &InodeRef,
        path: &Path<'p>,
        parent: bool,
    ) -> Result<(InodeRef, Option<FileName<'p>>), ()> {
        let mut ip = if path.is_absolute() {
            self.get(ROOTDEV, ROOTINO)
        } else {
            self.dup(cwd)
        };

        let mut path = *path;
        while let Some((name, rest)) = path.skipelem() {
            let mut dp = self.lock(kernel, &ip);
            if dp.typ != InodeType::Dir {
                drop(dp);
                self.put(kernel, tx, ip);
                return Err(());
            }
            if parent && rest.is_exhausted() {
                // Stop one level early.
                drop(dp);
                return Ok((ip, Some(name)));
            }
            let next = match dp.dirlookup(kernel, &name) {
                Ok((next, _)) => next,
                Err(()) => {
                    drop(dp);
                    self.put(kernel, tx, ip);
                    return Err(());
                }
            };
            drop(dp);
            self.put(kernel, tx, ip);
            ip = next;
            path = rest;
        }

        if parent {
            self.put(kernel, tx, ip);
            return Err(());
        }
        Ok((ip, None))
    }
}

impl InodeGuard<'_> {
    /// Copy a modified in-memory inode to disk. Must be called after
    /// every change to a field that lives on disk.
    pub fn update(&self, kernel: &Kernel, tx: &Tx<'_>) {
        let sb = *kernel.fs().superblock();
        let mut bp = kernel.bread(self.dev, sb.iblock(self.inum));
        let off = (self.inum as usize % IPB) * mem::size_of::<Dinode>();
        {
            let (mut dip, _) =
                LayoutVerified::<&mut [u8], Dinode>::new_from_prefix(&mut bp.data_mut()[off..])
                    .expect("iupdate: dinode");
            dip.typ = self.typ.as_disk();
            let (major, minor) = match self.typ {
                InodeType::Device { major, minor } => (major as i16, minor as i16),
                _ => (0, 0),
            };
            dip.major = major;
            dip.minor = minor;
            dip.nlink = self.nlink;
            dip.size = self.size;
            dip.addr_direct = self.addr_direct;
            dip.addr_indirect = self.addr_indirect;
        }
        tx.write(bp);
    }

    /// Disk block backing the `bn`-th block of this inode's content,
    /// allocating it (and the indirect block) if needed.
    pub fn bmap_or_alloc(&mut self, kernel: &Kernel, tx: &Tx<'_>, bn: usize) -> Result<u32, ()> {
        if bn < NDIRECT {
            if self.addr_direct[bn] == 0 {
                self.addr_direct[bn] = tx.balloc(self.dev)?;
            }
            return Ok(self.addr_direct[bn]);
        }

        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");

        // Load the indirect block, allocating if necessary.
        if self.addr_indirect == 0 {
            self.addr_indirect = tx.balloc(self.dev)?;
        }
        let mut bp = kernel.bread(self.dev, self.addr_indirect);
        let addr = indirect_entry(bp.data())[bn];
        if addr != 0 {
            return Ok(addr);
        }
        let addr = tx.balloc(self.dev)?;
        indirect_entry_mut(bp.data_mut())[bn] = addr;
        tx.write(bp);
        Ok(addr)
    }

    /// Like `bmap_or_alloc` for content known to exist: reads never
    /// touch holes because they are bounded by the size.
    pub fn bmap(&mut self, kernel: &Kernel, bn: usize) -> u32 {
        if bn < NDIRECT {
            let addr = self.addr_direct[bn];
            assert_ne!(addr, 0, "bmap: unallocated block");
            return addr;
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");
        assert_ne!(self.addr_indirect, 0, "bmap: unallocated block");
        let bp = kernel.bread(self.dev, self.addr_indirect);
        let addr = indirect_entry(bp.data())[bn];
        assert_ne!(addr, 0, "bmap: unallocated block");
        addr
    }

    /// Truncate inode (discard contents) and reset size to 0, all
    /// through the log.
    pub fn itrunc(&mut self, kernel: &Kernel, tx: &Tx<'_>) {
        let dev = self.dev;
        for addr in self.addr_direct.iter_mut() {
            if *addr != 0 {
                tx.bfree(dev, *addr);
                *addr = 0;
            }
        }

        if self.addr_indirect != 0 {
            {
                let bp = kernel.bread(dev, self.addr_indirect);
                for &a in indirect_entry(bp.data()) {
                    if a != 0 {
                        tx.bfree(dev, a);
                    }
                }
            }
            tx.bfree(dev, self.addr_indirect);
            self.addr_indirect = 0;
        }

        self.size = 0;
        self.update(kernel, tx);
    }

    pub fn stat(&self) -> Stat {
        Stat {
            typ: self.typ.as_disk(),
            _pad0: 0,
            dev: self.dev,
            ino: self.inum,
            nlink: self.nlink,
            _pad1: 0,
            size: self.size,
        }
    }

    /// Read the inode's content: call `f(tot, chunk)` for successive
    /// chunks of the `n` bytes starting at `off`. Stops early if `f`
    /// fails. Returns the number of bytes handed to `f`.
    pub fn read_internal<F>(
        &mut self,
        kernel: &Kernel,
        mut off: u32,
        mut n: u32,
        mut f: F,
    ) -> Result<usize, ()>
    where
        F: FnMut(u32, &[u8]) -> Result<(), ()>,
    {
        if off > self.size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > self.size {
            n = self.size - off;
        }
        let mut tot = 0;
        while tot < n {
            let addr = self.bmap(kernel, off as usize / BSIZE);
            let bp = kernel.bread(self.dev, addr);
            let m = core::cmp::min(n - tot, (BSIZE - off as usize % BSIZE) as u32);
            let begin = off as usize % BSIZE;
            let res = f(tot, &bp.data()[begin..begin + m as usize]);
            drop(bp);
            res?;
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    /// Copy the inode's content at `off` into `dst`. Returns the number
    /// of bytes copied, which is short only at end of file.
    pub fn read_bytes_kernel(&mut self, kernel: &Kernel, dst: &mut [u8], off: u32) -> usize {
        self.read_internal(kernel, off, dst.len() as u32, |tot, src| {
            dst[tot as usize..tot as usize + src.len()].copy_from_slice(src);
            Ok(())
        })
        .expect("read_bytes_kernel")
    }

    /// Copy a value's bytes out of the inode at `off`.
    pub fn read_kernel<T: AsBytes + FromBytes>(
        &mut self,
        kernel: &Kernel,
        dst: &mut T,
        off: u32,
    ) -> Result<(), ()> {
        let n = self.read_bytes_kernel(kernel, dst.as_bytes_mut(), off);
        if n == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Write the inode's content: call `f(tot, chunk)` to fill
    /// successive chunks of the `n` bytes starting at `off`, extending
    /// the file if needed. Every modified block goes through the log.
    pub fn write_internal<F>(
        &mut self,
        kernel: &Kernel,
        tx: &Tx<'_>,
        mut off: u32,
        n: u32,
        mut f: F,
    ) -> Result<usize, ()>
    where
        F: FnMut(u32, &mut [u8]) -> Result<(), ()>,
    {
        if off > self.size {
            return Err(());
        }
        if off.checked_add(n).ok_or(())? as usize > MAXFILE * BSIZE {
            return Err(());
        }
        let mut tot = 0;
        while tot < n {
            let addr = self.bmap_or_alloc(kernel, tx, off as usize / BSIZE)?;
            let mut bp = kernel.bread(self.dev, addr);
            let m = core::cmp::min(n - tot, (BSIZE - off as usize % BSIZE) as u32);
            let begin = off as usize % BSIZE;
            if f(tot, &mut bp.data_mut()[begin..begin + m as usize]).is_ok() {
                tx.write(bp);
            } else {
                break;
            }
            tot += m;
            off += m;
        }

        if off > self.size {
            self.size = off;
        }

        // Write the inode back even if the size is unchanged, because
        // bmap_or_alloc may have added a new block address.
        self.update(kernel, tx);
        Ok(tot as usize)
    }

    /// Copy `src` into the inode's content at `off`.
    pub fn write_bytes_kernel(
        &mut self,
        kernel: &Kernel,
        tx: &Tx<'_>,
        src: &[u8],
        off: u32,
    ) -> Result<usize, ()> {
        self.write_internal(kernel, tx, off, src.len() as u32, |tot, dst| {
            dst.copy_from_slice(&src[tot as usize..tot as usize + dst.len()]);
            Ok(())
        })
    }

    /// Write a value's bytes into the inode at `off`.
    pub fn write_kernel<T: AsBytes>(
        &mut self,
        kernel: &Kernel,
        tx: &Tx<'_>,
        src: &T,
        off: u32,
    ) -> Result<(), ()> {
        let n = self.write_bytes_kernel(kernel, tx, src.as_bytes(), off)?;
        if n == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Look for a directory entry by name. If found, return the entry's
    /// inode and the byte offset of the entry.
    pub fn dirlookup(
        &mut self,
        kernel: &Kernel,
        name: &FileName<'_>,
    ) -> Result<(InodeRef, u32), ()> {
        assert!(self.typ == InodeType::Dir, "dirlookup not DIR");

        for off in (0..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::default();
            self.read_kernel(kernel, &mut de, off)
                .expect("dirlookup read");
            if de.inum != 0 && de.name_matches(name) {
                return Ok((kernel.itable().get(self.dev, de.inum as u32), off));
            }
        }
        Err(())
    }

    /// Write a new directory entry (name, inum) into this directory.
    pub fn dirlink(
        &mut self,
        kernel: &Kernel,
        tx: &Tx<'_>,
        name: &FileName<'_>,
        inum: u32,
    ) -> Result<(), ()> {
        // The name must not already be present.
        if let Ok((ip, _)) = self.dirlookup(kernel, name) {
            kernel.itable().put(kernel, tx, ip);
            return Err(());
        }

        // Look for an empty dirent.
        let mut off = self.size;
        for o in (0..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::default();
            self.read_kernel(kernel, &mut de, o).expect("dirlink read");
            if de.inum == 0 {
                off = o;
                break;
            }
        }

        let mut de = Dirent::default();
        de.inum = inum as u16;
        de.set_name(name);
        self.write_kernel(kernel, tx, &de, off)
    }

    /// Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self, kernel: &Kernel) -> bool {
        for off in ((2 * DIRENT_SIZE as u32)..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::default();
            self.read_kernel(kernel, &mut de, off)
                .expect("is_dir_empty read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

/// The indirect block's contents as block addresses.
fn indirect_entry(data: &crate::bio::BufData) -> &[u32] {
    // SAFETY: u32 has no internal structure, and BufData is 4-aligned.
    let (prefix, addrs, _) = unsafe { data[..].align_to::<u32>() };
    debug_assert!(prefix.is_empty(), "indirect block unaligned");
    addrs
}

fn indirect_entry_mut(data: &mut crate::bio::BufData) -> &mut [u32] {
    // SAFETY: u32 has no internal structure, and BufData is 4-aligned.
    let (prefix, addrs, _) = unsafe { data[..].align_to_mut::<u32>() };
    debug_assert!(prefix.is_empty(), "indirect block unaligned");
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ROOTDEV;
    use crate::test_util::TestKernel;

    #[test]
    fn get_and_dup_count_references() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let tx = k.begin_tx();

        let a = k.itable().get(ROOTDEV, ROOTINO);
        let base = k.itable().refcnt(&a);
        let b = k.itable().get(ROOTDEV, ROOTINO);
        let c = k.itable().dup(&b);
        assert_eq!(k.itable().refcnt(&a), base + 2);
        k.itable().put(k, &tx, c);
        k.itable().put(k, &tx, b);
        assert_eq!(k.itable().refcnt(&a), base);
        k.itable().put(k, &tx, a);
    }

    #[test]
    fn alloc_inode_marks_type_on_disk() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let tx = k.begin_tx();
        let ip = k
            .itable()
            .alloc_inode(k, &tx, ROOTDEV, InodeType::File)
            .unwrap();
        let inum = ip.inum;
        {
            let guard = k.itable().lock(k, &ip);
            assert_eq!(guard.typ, InodeType::File);
            assert_eq!(guard.size, 0);
        }
        // A second allocation picks a different inum.
        let ip2 = k
            .itable()
            .alloc_inode(k, &tx, ROOTDEV, InodeType::File)
            .unwrap();
        assert_ne!(ip2.inum, inum);
        k.itable().put(k, &tx, ip2);
        k.itable().put(k, &tx, ip);
    }

    #[test]
    fn write_and_read_round_trip() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let tx = k.begin_tx();
        let ip = k
            .itable()
            .alloc_inode(k, &tx, ROOTDEV, InodeType::File)
            .unwrap();
        let mut guard = k.itable().lock(k, &ip);
        guard.nlink = 1;
        guard.update(k, &tx);

        let msg = b"hello";
        assert_eq!(
            guard.write_bytes_kernel(k, &tx, msg, 0).unwrap(),
            msg.len()
        );
        assert_eq!(guard.size, msg.len() as u32);

        let mut back = [0u8; 5];
        assert_eq!(guard.read_bytes_kernel(k, &mut back, 0), 5);
        assert_eq!(&back, msg);

        // Reads past the end are cut short.
        let mut over = [0u8; 16];
        assert_eq!(guard.read_bytes_kernel(k, &mut over, 3), 2);
        assert_eq!(&over[..2], b"lo");
        drop(guard);
        k.itable().put(k, &tx, ip);
    }

    #[test]
    fn bmap_reaches_the_indirect_range() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let ip = {
            let tx = k.begin_tx();
            let ip = k
                .itable()
                .alloc_inode(k, &tx, ROOTDEV, InodeType::File)
                .unwrap();
            let mut guard = k.itable().lock(k, &ip);
            guard.nlink = 1;
            guard.update(k, &tx);
            drop(guard);
            ip
        };

        // Extend the file one block per transaction until it crosses
        // into the indirect range.
        let blocks = NDIRECT + 3;
        for bn in 0..blocks {
            let tx = k.begin_tx();
            let mut guard = k.itable().lock(k, &ip);
            let chunk = [bn as u8; BSIZE];
            guard
                .write_bytes_kernel(k, &tx, &chunk, (bn * BSIZE) as u32)
                .unwrap();
        }

        let mut guard = k.itable().lock(k, &ip);
        assert_ne!(guard.addr_indirect, 0);
        assert_eq!(guard.size as usize, blocks * BSIZE);
        let mut back = [0u8; BSIZE];
        let off = ((NDIRECT + 2) * BSIZE) as u32;
        assert_eq!(guard.read_bytes_kernel(k, &mut back, off), BSIZE);
        assert!(back.iter().all(|&b| b == (NDIRECT + 2) as u8));
        drop(guard);

        let tx = k.begin_tx();
        k.itable().put(k, &tx, ip);
    }

    #[test]
    fn itrunc_frees_every_block() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let ip = {
            let tx = k.begin_tx();
            let ip = k
                .itable()
                .alloc_inode(k, &tx, ROOTDEV, InodeType::File)
                .unwrap();
            let mut guard = k.itable().lock(k, &ip);
            guard.nlink = 1;
            guard.update(k, &tx);
            guard
                .write_bytes_kernel(k, &tx, &[1u8; 2 * BSIZE], 0)
                .unwrap();
            assert!(guard.addr_direct[0] != 0 && guard.addr_direct[1] != 0);
            drop(guard);
            ip
        };
        let tx = k.begin_tx();
        let mut guard = k.itable().lock(k, &ip);
        let freed = [guard.addr_direct[0], guard.addr_direct[1]];
        guard.itrunc(k, &tx);
        assert_eq!(guard.size, 0);
        assert_eq!(guard.addr_direct[0], 0);
        drop(guard);
        drop(tx);

        // The bitmap bits are clear again: a fresh balloc hands the
        // lowest freed block back.
        let tx = k.begin_tx();
        let got = tx.balloc(ROOTDEV).unwrap();
        assert_eq!(got, freed[0].min(freed[1]));
        tx.bfree(ROOTDEV, got);
        drop(tx);

        let tx = k.begin_tx();
        k.itable().put(k, &tx, ip);
    }

    #[test]
    fn dirlink_and_dirlookup() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let tx = k.begin_tx();
        let root = k.itable().get(ROOTDEV, ROOTINO);
        let file = k
            .itable()
            .alloc_inode(k, &tx, ROOTDEV, InodeType::File)
            .unwrap();
        {
            let mut fg = k.itable().lock(k, &file);
            fg.nlink = 1;
            fg.update(k, &tx);
        }

        let name = FileName::from_bytes(b"alpha");
        let mut dg = k.itable().lock(k, &root);
        dg.dirlink(k, &tx, &name, file.inum).unwrap();
        // Duplicate names are rejected.
        assert!(dg.dirlink(k, &tx, &name, file.inum).is_err());

        let (found, _off) = dg.dirlookup(k, &name).unwrap();
        assert_eq!(found.inum, file.inum);
        drop(dg);
        k.itable().put(k, &tx, found);
        k.itable().put(k, &tx, root);
        k.itable().put(k, &tx, file);
    }

    #[test]
    fn namei_walks_directories() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let proc = t.proc();
        let tx = k.begin_tx();

        let dir = k
            .create(&tx, proc.cwd(), &Path::from_bytes(b"/sub"), InodeType::Dir)
            .unwrap();
        let file = k
            .create(
                &tx,
                proc.cwd(),
                &Path::from_bytes(b"/sub/leaf"),
                InodeType::File,
            )
            .unwrap();

        let found = k
            .itable()
            .namei(k, &tx, proc.cwd(), &Path::from_bytes(b"/sub/leaf"))
            .unwrap();
        assert_eq!(found.inum, file.inum);

        let (parent, name) = k
            .itable()
            .nameiparent(k, &tx, proc.cwd(), &Path::from_bytes(b"/sub/leaf"))
            .unwrap();
        assert_eq!(parent.inum, dir.inum);
        assert_eq!(name.as_bytes(), b"leaf");

        // Looking up through a non-directory fails.
        assert!(k
            .itable()
            .namei(k, &tx, proc.cwd(), &Path::from_bytes(b"/sub/leaf/deeper"))
            .is_err());

        k.itable().put(k, &tx, found);
        k.itable().put(k, &tx, parent);
        k.itable().put(k, &tx, file);
        k.itable().put(k, &tx, dir);
    }
}
