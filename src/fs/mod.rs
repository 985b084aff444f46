//! File system implementation. Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inode with special contents (list of other inodes!)
//!   + Names: paths like /home/alice/notes.txt for convenient naming.
//!
//! This module contains the low-level file system manipulation routines.
//! The (higher-level) system call implementations are in syscall/file.rs.

use spin::Once;

use crate::kernel::Kernel;
use crate::lock::Sleepablelock;

mod inode;
mod log;
mod path;
mod stat;
mod superblock;

pub use inode::{
    Dinode, Dirent, InodeGuard, InodeInner, InodeRef, InodeType, Itable, DIRENT_SIZE, DIRSIZ,
    MAXFILE, NDIRECT, NINDIRECT, ROOTINO,
};
pub use log::{Log, Tx};
pub use path::{FileName, Path};
pub use stat::{Stat, T_DEV, T_DIR, T_FILE};
pub use superblock::{Superblock, BPB, IPB};

pub struct FileSystem {
    /// There is one superblock per disk device, but we run with only one
    /// device; read once at initialization.
    superblock: Once<Superblock>,

    log: Once<Sleepablelock<Log>>,

    pub itable: Itable,
}

impl FileSystem {
    pub const fn new() -> Self {
        Self {
            superblock: Once::new(),
            log: Once::new(),
            itable: Itable::new(),
        }
    }

    /// Read the super block and set up the log, running recovery.
    /// Idempotent; the first caller wins.
    pub fn init(&self, dev: u32, kernel: &Kernel) {
        if !self.superblock.is_completed() {
            let sb = {
                let buf = kernel.bread(dev, 1);
                Superblock::new(&buf)
            };
            let sb = *self.superblock.call_once(|| sb);
            self.log.call_once(|| {
                Sleepablelock::new("log", Log::new(dev, sb.logstart, sb.nlog, kernel))
            });
        }
    }

    pub fn superblock(&self) -> &Superblock {
        self.superblock.get().expect("superblock")
    }

    pub fn log(&self) -> &Sleepablelock<Log> {
        self.log.get().expect("log")
    }
}

impl Kernel {
    /// Create the file `path` with the given type, or for a plain file
    /// return it if it already exists. Returns an unlocked, referenced
    /// inode.
    pub fn create(
        &self,
        tx: &Tx<'_>,
        cwd: &InodeRef,
        path: &Path<'_>,
        typ: InodeType,
    ) -> Result<InodeRef, ()> {
        let itable = self.itable();
        let (dp_ref, name) = itable.nameiparent(self, tx, cwd, path)?;
        let mut dp = itable.lock(self, &dp_ref);

        if let Ok((ip_ref, _)) = dp.dirlookup(self, &name) {
            drop(dp);
            itable.put(self, tx, dp_ref);
            let ip = itable.lock(self, &ip_ref);
            if typ == InodeType::File
                && matches!(ip.typ, InodeType::File | InodeType::Device { .. })
            {
                drop(ip);
                return Ok(ip_ref);
            }
            drop(ip);
            itable.put(self, tx, ip_ref);
            return Err(());
        }

        let ip_ref = match itable.alloc_inode(self, tx, dp.dev, typ) {
            Ok(ip_ref) => ip_ref,
            Err(()) => {
                drop(dp);
                itable.put(self, tx, dp_ref);
                return Err(());
            }
        };
        let mut ip = itable.lock(self, &ip_ref);
        ip.nlink = 1;
        ip.update(self, tx);

        // Create . and .. entries.
        if typ == InodeType::Dir {
            // for ".."
            dp.nlink += 1;
            dp.update(self, tx);

            let inum = ip.inum;
            let dp_inum = dp.inum;
            // No nlink++ for ".": avoid a cyclic reference count.
            ip.dirlink(self, tx, &FileName::from_bytes(b"."), inum)
                .and_then(|_| ip.dirlink(self, tx, &FileName::from_bytes(b".."), dp_inum))
                .expect("create dots");
        }

        dp.dirlink(self, tx, &name, ip.inum).expect("create: dirlink");
        drop(ip);
        drop(dp);
        itable.put(self, tx, dp_ref);
        Ok(ip_ref)
    }

    /// Create the link `new` pointing at the same inode as `old`.
    pub fn link(
        &self,
        tx: &Tx<'_>,
        cwd: &InodeRef,
        old: &Path<'_>,
        new: &Path<'_>,
    ) -> Result<(), ()> {
        let itable = self.itable();
        let ip_ref = itable.namei(self, tx, cwd, old)?;

        let mut ip = itable.lock(self, &ip_ref);
        if ip.typ == InodeType::Dir {
            drop(ip);
            itable.put(self, tx, ip_ref);
            return Err(());
        }
        ip.nlink += 1;
        ip.update(self, tx);
        drop(ip);

        if let Ok((dp_ref, name)) = itable.nameiparent(self, tx, cwd, new) {
            let mut dp = itable.lock(self, &dp_ref);
            let ok = dp.dev == ip_ref.dev && dp.dirlink(self, tx, &name, ip_ref.inum).is_ok();
            drop(dp);
            itable.put(self, tx, dp_ref);
            if ok {
                itable.put(self, tx, ip_ref);
                return Ok(());
            }
        }

        // Undo the link count.
        let mut ip = itable.lock(self, &ip_ref);
        ip.nlink -= 1;
        ip.update(self, tx);
        drop(ip);
        itable.put(self, tx, ip_ref);
        Err(())
    }

    /// Remove the directory entry `path`; the inode itself is freed by
    /// the last put once every reference is gone.
    pub fn unlink(&self, tx: &Tx<'_>, cwd: &InodeRef, path: &Path<'_>) -> Result<(), ()> {
        let itable = self.itable();
        let (dp_ref, name) = itable.nameiparent(self, tx, cwd, path)?;
        let mut dp = itable.lock(self, &dp_ref);

        // Cannot unlink "." or "..".
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            drop(dp);
            itable.put(self, tx, dp_ref);
            return Err(());
        }

        let (ip_ref, off) = match dp.dirlookup(self, &name) {
            Ok(found) => found,
            Err(()) => {
                drop(dp);
                itable.put(self, tx, dp_ref);
                return Err(());
            }
        };
        let mut ip = itable.lock(self, &ip_ref);
        assert!(ip.nlink >= 1, "unlink: nlink < 1");

        if ip.typ == InodeType::Dir && !ip.is_dir_empty(self) {
            drop(ip);
            itable.put(self, tx, ip_ref);
            drop(dp);
            itable.put(self, tx, dp_ref);
            return Err(());
        }

        dp.write_kernel(self, tx, &Dirent::default(), off)
            .expect("unlink: writei");
        if ip.typ == InodeType::Dir {
            dp.nlink -= 1;
            dp.update(self, tx);
        }
        drop(dp);
        itable.put(self, tx, dp_ref);

        ip.nlink -= 1;
        ip.update(self, tx);
        drop(ip);
        itable.put(self, tx, ip_ref);
        Ok(())
    }
}
