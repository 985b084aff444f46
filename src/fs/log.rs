//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls.
//! The logging system only commits when there are no FS system calls
//! active. Thus there is never any reasoning required about whether a
//! commit might write an uncommitted system call's updates to disk.
//!
//! A system call should call begin_op()/end_op() to mark its start and
//! end. Usually begin_op() just increments the count of in-progress FS
//! system calls and returns. But if it thinks the log is close to
//! running out, it sleeps until the last outstanding end_op() commits.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk
//! log format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous.

use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::Buf;
use crate::kernel::Kernel;
use crate::lock::Sleepablelock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

pub struct Log {
    dev: u32,
    start: u32,
    size: u32,

    /// How many FS sys calls are executing?
    outstanding: i32,

    /// In commit(), please wait.
    committing: bool,

    /// Block numbers logged by the current transaction. Their buffers
    /// stay dirty, which pins them in the cache until installed.
    blocks: ArrayVec<u32, LOGSIZE>,
}

/// Contents of the on-disk header block.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);

impl Log {
    /// Build the log over `[start, start + size)` of `dev` and run
    /// recovery: a committed but uninstalled transaction finishes now.
    pub fn new(dev: u32, start: u32, size: u32, kernel: &Kernel) -> Self {
        let mut log = Self {
            dev,
            start,
            size,
            outstanding: 0,
            committing: false,
            blocks: ArrayVec::new(),
        };
        log.recover_from_log(kernel);
        log
    }

    /// Copy committed blocks from the log to their home locations.
    fn install_trans(&mut self, kernel: &Kernel) {
        for (tail, &blockno) in self.blocks.iter().enumerate() {
            // Read log block.
            let lbuf = kernel.bread(self.dev, self.start + tail as u32 + 1);

            // Read dst.
            let mut dbuf = kernel.bread(self.dev, blockno);

            // Copy block to dst, then write dst to disk; completion
            // clears the dirty pin.
            dbuf.data_mut().copy_from_slice(&lbuf.data()[..]);
            dbuf.write();
        }
    }

    /// Read the log header from disk into the in-memory log header.
    fn read_head(&mut self, kernel: &Kernel) {
        let buf = kernel.bread(self.dev, self.start);
        let (lh, _) = LayoutVerified::<&[u8], LogHeader>::new_from_prefix(&buf.data()[..])
            .expect("read_head");
        self.blocks.clear();
        for &b in &lh.block[..lh.n as usize] {
            self.blocks.push(b);
        }
    }

    /// Write the in-memory log header to disk. This is the true point at
    /// which the current transaction commits.
    fn write_head(&mut self, kernel: &Kernel) {
        let mut buf = kernel.bread(self.dev, self.start);
        {
            let (mut lh, _) =
                LayoutVerified::<&mut [u8], LogHeader>::new_from_prefix(&mut buf.data_mut()[..])
                    .expect("write_head");
            lh.n = self.blocks.len() as u32;
            for (db, b) in izip!(&mut lh.block, &self.blocks) {
                *db = *b;
            }
        }
        buf.write();
    }

    fn recover_from_log(&mut self, kernel: &Kernel) {
        self.read_head(kernel);

        // If committed, copy from log to disk.
        self.install_trans(kernel);
        self.blocks.clear();

        // Clear the log.
        self.write_head(kernel);
    }

    /// Copy modified blocks from the cache to the log region.
    fn write_log(&mut self, kernel: &Kernel) {
        for (tail, &blockno) in self.blocks.iter().enumerate() {
            // Log block.
            let mut to = kernel.bread(self.dev, self.start + tail as u32 + 1);

            // Cache block.
            let from = kernel.bread(self.dev, blockno);

            to.data_mut().copy_from_slice(&from.data()[..]);

            // Write the log.
            to.write();
        }
    }

    fn commit(&mut self, kernel: &Kernel) {
        if !self.blocks.is_empty() {
            // Write modified blocks from cache to log.
            self.write_log(kernel);

            // Write header to disk -- the real commit.
            self.write_head(kernel);

            // Now install writes to home locations.
            self.install_trans(kernel);
            self.blocks.clear();

            // Erase the transaction from the log.
            self.write_head(kernel);
        }
    }

    /// Caller has modified `b.data()` and is done with the buffer.
    /// Record the block number, coalescing duplicates, and pin the
    /// buffer by marking it dirty; commit()/write_log() will do the disk
    /// write.
    ///
    /// log_write() replaces `Buf::write()`; a typical use is:
    ///   let mut bp = kernel.bread(...);
    ///   modify bp.data_mut();
    ///   tx.write(bp);
    fn append(&mut self, b: Buf<'_>) {
        assert!(
            self.blocks.len() < LOGSIZE && (self.blocks.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        assert!(self.outstanding >= 1, "log_write outside of trans");

        b.entry().set_dirty(true);
        if !self.blocks.iter().any(|&x| x == b.blockno) {
            self.blocks.push(b.blockno);
        }
    }
}

impl Sleepablelock<Log> {
    /// Called at the start of each FS system call.
    pub fn begin_op(&self, kernel: &Kernel) {
        let mut guard = self.lock();
        loop {
            if guard.committing
                // This op might exhaust log space; wait for commit.
                || guard.blocks.len() + (guard.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
            {
                guard.sleep(kernel);
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call.
    /// Commits if this was the last outstanding operation.
    pub fn end_op(&self, kernel: &Kernel) {
        let mut guard = self.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "log.committing");

        if guard.outstanding == 0 {
            // No transaction is in flight and the lock is held, so no
            // new one can start until committing is cleared.
            guard.committing = true;

            // Call commit without holding the lock, since it sleeps on
            // disk I/O.
            guard.reacquire_after(|| {
                // SAFETY: `committing` keeps every other op out.
                unsafe { &mut *self.get_mut_raw() }.commit(kernel);
            });

            guard.committing = false;
        }

        // begin_op() may be waiting for log space, and decrementing
        // outstanding has decreased the amount of reserved space.
        guard.wakeup(kernel);
    }

    pub fn log_write(&self, b: Buf<'_>) {
        self.lock().append(b);
    }
}

/// A file-system transaction: the work between begin_op and end_op.
/// Dropping it ends the op, committing once no op is outstanding.
pub struct Tx<'s> {
    kernel: &'s Kernel,
}

impl Kernel {
    pub fn begin_tx(&self) -> Tx<'_> {
        self.fs().log().begin_op(self);
        Tx { kernel: self }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.kernel.fs().log().end_op(self.kernel);
    }
}

impl Tx<'_> {
    /// Route a modified buffer through the log instead of writing it.
    pub fn write(&self, b: Buf<'_>) {
        self.kernel.fs().log().log_write(b);
    }

    /// Zero a block through the log.
    fn bzero(&self, dev: u32, bno: u32) {
        let mut buf = self.kernel.bread(dev, bno);
        buf.data_mut().fill(0);
        self.write(buf);
    }

    /// Allocate a zeroed disk block. Errors when every bitmap bit is
    /// taken, which surfaces to user space as -1.
    pub fn balloc(&self, dev: u32) -> Result<u32, ()> {
        let sb = *self.kernel.fs().superblock();
        for b in num_iter::range_step(0, sb.size, super::BPB) {
            let mut bp = self.kernel.bread(dev, sb.bblock(b));
            for bi in 0..core::cmp::min(super::BPB, sb.size - b) {
                let m = 1u8 << (bi % 8);
                if bp.data()[(bi / 8) as usize] & m == 0 {
                    // Block is free.
                    bp.data_mut()[(bi / 8) as usize] |= m;
                    self.write(bp);
                    self.bzero(dev, b + bi);
                    return Ok(b + bi);
                }
            }
        }
        Err(())
    }

    /// Free a disk block.
    pub fn bfree(&self, dev: u32, b: u32) {
        let sb = *self.kernel.fs().superblock();
        let mut bp = self.kernel.bread(dev, sb.bblock(b));
        let bi = b as usize % super::BPB as usize;
        let m = 1u8 << (bi % 8);
        assert_ne!(bp.data()[bi / 8] & m, 0, "freeing free block");
        bp.data_mut()[bi / 8] &= !m;
        self.write(bp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ROOTDEV;
    use crate::test_util::{TestKernel};

    /// A data block in the free area we can scribble on directly.
    fn scratch_block(k: &crate::kernel::Kernel) -> u32 {
        let sb = *k.fs().superblock();
        sb.size - 2
    }

    #[test]
    fn nothing_reaches_home_before_end_op() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let bno = scratch_block(k);
        let before = t.disk().block(bno);

        let tx = k.begin_tx();
        let mut b = k.bread(ROOTDEV, bno);
        b.data_mut().fill(0x7E);
        tx.write(b);

        // Still inside the op: the home location is untouched.
        assert_eq!(t.disk().block(bno), before);
        drop(tx);
        // Committed and installed.
        assert_eq!(t.disk().block(bno), vec![0x7E; crate::param::BSIZE]);
    }

    #[test]
    fn repeated_writes_are_absorbed() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let bno = scratch_block(k);

        let tx = k.begin_tx();
        for byte in [1u8, 2, 3] {
            let mut b = k.bread(ROOTDEV, bno);
            b.data_mut().fill(byte);
            tx.write(b);
        }
        {
            let log = k.fs().log().lock();
            assert_eq!(
                log.blocks.iter().filter(|&&x| x == bno).count(),
                1,
                "absorption"
            );
        }
        drop(tx);
        assert_eq!(t.disk().block(bno), vec![3u8; crate::param::BSIZE]);
    }

    #[test]
    fn commit_point_is_the_header_write() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let sb = *k.fs().superblock();
        let bno = scratch_block(k);

        {
            let tx = k.begin_tx();
            let mut b = k.bread(ROOTDEV, bno);
            b.data_mut().fill(0x5C);
            tx.write(b);
        }

        // Find the header write that committed the transaction.
        let writes = t.disk().writes();
        let commit = writes
            .iter()
            .position(|(b, data)| *b == sb.logstart && data[..4] != [0, 0, 0, 0])
            .expect("no commit record");

        // Crash right before the header write: recovery sees an empty
        // log and the home block is unchanged.
        let t2 = TestKernel::boot(t.disk().image_at(commit));
        assert_ne!(t2.disk().block(bno), vec![0x5C; crate::param::BSIZE]);

        // Crash right after the header write: recovery installs the
        // logged block.
        let t3 = TestKernel::boot(t.disk().image_at(commit + 1));
        assert_eq!(t3.disk().block(bno), vec![0x5C; crate::param::BSIZE]);
    }

    #[test]
    fn recovery_is_idempotent() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let sb = *k.fs().superblock();
        let bno = scratch_block(k);

        {
            let tx = k.begin_tx();
            let mut b = k.bread(ROOTDEV, bno);
            b.data_mut().fill(0x42);
            tx.write(b);
        }
        let writes = t.disk().writes();
        let commit = writes
            .iter()
            .position(|(b, data)| *b == sb.logstart && data[..4] != [0, 0, 0, 0])
            .unwrap();

        // Recover once from the crash image, then "crash" again before
        // the recovery finished clearing the log and recover again.
        let t2 = TestKernel::boot(t.disk().image_at(commit + 1));
        let after_first = t2.disk().image();
        let t3 = TestKernel::boot(after_first.clone());
        assert_eq!(t3.disk().image(), after_first);
        assert_eq!(t3.disk().block(bno), vec![0x42; crate::param::BSIZE]);
    }

    #[test]
    #[should_panic(expected = "log_write outside of trans")]
    fn log_write_outside_transaction_panics() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let bno = scratch_block(k);
        let mut b = k.bread(ROOTDEV, bno);
        b.data_mut().fill(1);
        k.fs().log().log_write(b);
    }
}
