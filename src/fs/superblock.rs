use core::mem;

use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::Buf;
use crate::param::BSIZE;

use super::Dinode;

/// Disk layout:
/// [ boot block | super block | log | inode blocks |
///                                          free bit map | data blocks ]
///
/// mkfs computes the super block and builds an initial file system. The
/// super block describes the disk layout:
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Superblock {
    /// Size of file system image (blocks)
    pub size: u32,

    /// Number of data blocks
    pub nblocks: u32,

    /// Number of inodes
    pub ninodes: u32,

    /// Number of log blocks
    pub nlog: u32,

    /// Block number of first log block
    pub logstart: u32,

    /// Block number of first inode block
    pub inodestart: u32,

    /// Block number of first free map block
    pub bmapstart: u32,
}

/// Inodes per block.
pub const IPB: usize = BSIZE / mem::size_of::<Dinode>();

/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

impl Superblock {
    /// Read the super block from block 1.
    pub fn new(buf: &Buf<'_>) -> Self {
        let (sb, _) = LayoutVerified::<&[u8], Superblock>::new_from_prefix(&buf.data()[..])
            .expect("invalid super block");
        *sb
    }

    /// Block containing inode `i`.
    pub const fn iblock(&self, i: u32) -> u32 {
        i / IPB as u32 + self.inodestart
    }

    /// Block of free map containing bit for block `b`.
    pub const fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}
