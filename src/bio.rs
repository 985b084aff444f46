//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching
//! disk blocks in memory reduces the number of disk reads and also
//! provides a synchronization point for blocks used by multiple
//! processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `Kernel::bread`.
//! * After changing buffer data, call `Buf::write` to write it to disk.
//! * Dropping the `Buf` releases it; do not keep buffers longer than
//!   necessary.
//!
//! The cache spinlock guards identity (dev, blockno), reference counts,
//! and the LRU list; the per-buffer sleep-lock serializes access to the
//! contents. The `dirty` flag is atomic because the eviction scan reads
//! it without the sleep-lock: a dirty buffer is pinned until the log
//! writes it home.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::kernel::Kernel;
use crate::lock::{SleepLock, SleepLockGuard, Spinlock};
use crate::param::{BSIZE, NBUF};
use crate::proc::WaitChannel;

/// Block contents. Aligned so on-disk structures (inodes, the log
/// header, the superblock) can be read in place.
#[repr(align(4))]
pub struct BufData {
    inner: [u8; BSIZE],
}

impl BufData {
    pub const fn zeroed() -> Self {
        Self { inner: [0; BSIZE] }
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub struct BufInner {
    /// Has data been read from disk?
    pub(crate) valid: bool,

    data: BufData,
}

pub struct BufEntry {
    inner: SleepLock<BufInner>,

    /// Contents newer than disk; also the log's pin against eviction.
    dirty: AtomicBool,

    /// WaitChannel saying the disk request is done.
    pub disk_chan: WaitChannel,
}

impl BufEntry {
    const fn new() -> Self {
        Self {
            inner: SleepLock::new("buffer", BufInner {
                valid: false,
                data: BufData { inner: [0; BSIZE] },
            }),
            dirty: AtomicBool::new(false),
            disk_chan: WaitChannel::new(),
        }
    }

    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// The buffer contents, bypassing the sleep-lock.
    ///
    /// # Safety
    ///
    /// Only for the disk driver completing a request: the holder of the
    /// sleep-lock has lent the buffer to the disk and sleeps until the
    /// driver wakes `disk_chan`.
    pub unsafe fn inner_raw(&self) -> *mut BufInner {
        self.inner.get_mut_raw()
    }
}

struct BufInfo {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    /// LRU list links; indices into `info`, `NBUF` is the head sentinel.
    prev: usize,
    next: usize,
}

struct BcacheCtl {
    info: [BufInfo; NBUF + 1],
}

impl BcacheCtl {
    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.info[i].prev, self.info[i].next);
        self.info[prev].next = next;
        self.info[next].prev = prev;
    }

    /// Insert right after the head: most recently used.
    fn push_front(&mut self, i: usize) {
        let first = self.info[NBUF].next;
        self.info[i].prev = NBUF;
        self.info[i].next = first;
        self.info[first].prev = i;
        self.info[NBUF].next = i;
    }
}

pub struct Bcache {
    ctl: Spinlock<BcacheCtl>,
    entries: [BufEntry; NBUF],
}

impl Bcache {
    pub const fn new() -> Self {
        Self {
            ctl: Spinlock::new("bcache", BcacheCtl {
                info: array![_ => BufInfo { dev: 0, blockno: 0, refcnt: 0, prev: 0, next: 0 }; NBUF + 1],
            }),
            entries: array![_ => BufEntry::new(); NBUF],
        }
    }

    /// Link the LRU list. Called once before the cache is shared.
    pub fn init(&mut self) {
        let ctl = self.ctl.get_mut();
        ctl.info[NBUF].prev = NBUF;
        ctl.info[NBUF].next = NBUF;
        for i in 0..NBUF {
            ctl.push_front(i);
        }
    }

    pub fn entry(&self, idx: usize) -> &BufEntry {
        &self.entries[idx]
    }

    /// Look through the cache for block `blockno` on device `dev`; if
    /// not found, recycle the least recently used unreferenced, clean
    /// buffer. Returns the chosen slot with its reference taken.
    fn get(&self, dev: u32, blockno: u32) -> usize {
        let mut ctl = self.ctl.lock();

        // Is the block already cached?
        let mut i = ctl.info[NBUF].next;
        while i != NBUF {
            if ctl.info[i].dev == dev && ctl.info[i].blockno == blockno {
                ctl.info[i].refcnt += 1;
                return i;
            }
            i = ctl.info[i].next;
        }

        // Not cached; recycle from the cold end of the list. A dirty
        // buffer holds a committed-but-uninstalled block, so it stays.
        let mut i = ctl.info[NBUF].prev;
        while i != NBUF {
            if ctl.info[i].refcnt == 0 && !self.entries[i].dirty() {
                ctl.info[i].dev = dev;
                ctl.info[i].blockno = blockno;
                ctl.info[i].refcnt = 1;
                // SAFETY: refcnt was 0 and the cache lock is held, so no
                // one holds or can acquire this buffer's sleep-lock.
                unsafe { (*self.entries[i].inner_raw()).valid = false };
                return i;
            }
            i = ctl.info[i].prev;
        }

        panic!("bget: no buffers");
    }

    /// Drop a reference; an unreferenced buffer moves to the MRU end.
    fn release(&self, idx: usize) {
        let mut ctl = self.ctl.lock();
        assert!(ctl.info[idx].refcnt >= 1, "brelse");
        ctl.info[idx].refcnt -= 1;
        if ctl.info[idx].refcnt == 0 {
            ctl.unlink(idx);
            ctl.push_front(idx);
        }
    }
}

/// A locked buffer: the holder may read and modify the contents.
/// Dropping it unlocks the buffer and drops the cache reference.
pub struct Buf<'s> {
    pub dev: u32,
    pub blockno: u32,
    idx: usize,
    kernel: &'s Kernel,
    guard: ManuallyDrop<SleepLockGuard<'s, BufInner>>,
}

impl<'s> Buf<'s> {
    pub fn entry(&self) -> &'s BufEntry {
        self.kernel.bcache().entry(self.idx)
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn data(&self) -> &BufData {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.guard.data
    }

    pub fn is_valid(&self) -> bool {
        self.guard.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.guard.valid = valid;
    }

    pub fn dirty(&self) -> bool {
        self.entry().dirty()
    }

    /// Write the buffer's contents to disk, synchronously. The log owns
    /// every write inside a transaction; only the log itself and
    /// recovery call this.
    pub fn write(&mut self) {
        self.entry().set_dirty(true);
        let kernel = self.kernel;
        kernel.disk().rw(self, kernel);
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // Unlock before the reference is dropped.
        // SAFETY: the guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.kernel.bcache().release(self.idx);
    }
}

/// The block device under the buffer cache. `rw` synchronizes one
/// buffer: a dirty buffer is written out (clearing `dirty`), otherwise
/// the block is read in; either way the buffer is valid on return.
pub trait Disk: Sync {
    fn rw(&self, b: &mut Buf<'_>, kernel: &Kernel);

    /// Device interrupt; drivers with a request queue complete the head
    /// request here.
    fn intr(&self, _kernel: &Kernel) {}
}

impl Kernel {
    /// Return a locked buf with the contents of the indicated block.
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let idx = self.bcache().get(dev, blockno);
        let guard = self.bcache().entry(idx).inner.lock(self);
        let mut b = Buf {
            dev,
            blockno,
            idx,
            kernel: self,
            guard: ManuallyDrop::new(guard),
        };
        if !b.is_valid() {
            self.disk().rw(&mut b, self);
            assert!(b.is_valid(), "bread");
        }
        b
    }
}
