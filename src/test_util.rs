//! Shared test fixtures: an in-memory disk that records every write (so
//! crashes can be replayed to any instant), a minimal mkfs, and a kernel
//! instance booted over simulated physical memory with one installed
//! process.

use std::sync::Mutex;

use zerocopy::AsBytes;

use crate::bio::{Buf, Disk};
use crate::cpu::current_cpu;
use crate::fs::{Dinode, Dirent, Superblock, DIRENT_SIZE, IPB, NDIRECT, ROOTINO, T_DIR};
use crate::kalloc::MemRegion;
use crate::kernel::Kernel;
use crate::param::{BSIZE, LOGSIZE, ROOTDEV};
use crate::proc::{CurrentProc, ProcState};
use crate::trap::{trap, T_SYSCALL};
use crate::vm::{UserMemory, PGSIZE};

/// RAM-backed disk. Reads serve the current image; each write applies to
/// the image and is appended to a trace, so a test can rebuild the disk
/// as it stood after any prefix of writes — i.e. crash at any instant.
pub struct MemDisk {
    state: Mutex<MemDiskState>,
}

struct MemDiskState {
    base: Vec<u8>,
    image: Vec<u8>,
    writes: Vec<(u32, Vec<u8>)>,
}

impl MemDisk {
    pub fn new(image: Vec<u8>) -> Self {
        assert_eq!(image.len() % BSIZE, 0);
        Self {
            state: Mutex::new(MemDiskState {
                base: image.clone(),
                image,
                writes: Vec::new(),
            }),
        }
    }

    /// Block numbers and contents of every write so far, in order.
    pub fn writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    /// The disk as it stood after the first `upto` writes.
    pub fn image_at(&self, upto: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let mut img = state.base.clone();
        for (bno, data) in state.writes.iter().take(upto) {
            let off = *bno as usize * BSIZE;
            img[off..off + BSIZE].copy_from_slice(data);
        }
        img
    }

    pub fn image(&self) -> Vec<u8> {
        self.state.lock().unwrap().image.clone()
    }

    /// The current contents of one block.
    pub fn block(&self, bno: u32) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let off = bno as usize * BSIZE;
        state.image[off..off + BSIZE].to_vec()
    }
}

impl Disk for MemDisk {
    fn rw(&self, b: &mut Buf<'_>, _kernel: &Kernel) {
        let mut state = self.state.lock().unwrap();
        let off = b.blockno as usize * BSIZE;
        if b.dirty() {
            state.image[off..off + BSIZE].copy_from_slice(&b.data()[..]);
            let record = (b.blockno, b.data()[..].to_vec());
            state.writes.push(record);
            b.entry().set_dirty(false);
        } else {
            b.data_mut().copy_from_slice(&state.image[off..off + BSIZE]);
        }
        b.set_valid(true);
    }
}

/// Build a fresh file system image: boot block, superblock, log, inode
/// blocks, bitmap, and a root directory with "." and "..".
pub fn mkfs(size: usize) -> Vec<u8> {
    let nlog = LOGSIZE;
    let ninodes = 200u32;
    let ninodeblocks = ninodes as usize / IPB + 1;
    let nbitmap = size / (BSIZE * 8) + 1;
    let nmeta = 2 + nlog + ninodeblocks + nbitmap;
    assert!(nmeta < size, "mkfs: disk too small");

    let sb = Superblock {
        size: size as u32,
        nblocks: (size - nmeta) as u32,
        ninodes,
        nlog: nlog as u32,
        logstart: 2,
        inodestart: (2 + nlog) as u32,
        bmapstart: (2 + nlog + ninodeblocks) as u32,
    };

    let mut img = vec![0u8; size * BSIZE];
    img[BSIZE..BSIZE + core::mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());

    // Root directory: one data block holding "." and "..".
    let first_data = nmeta as u32;
    let mut root = Dinode {
        typ: T_DIR,
        major: 0,
        minor: 0,
        nlink: 1,
        size: (2 * DIRENT_SIZE) as u32,
        addr_direct: [0; NDIRECT],
        addr_indirect: 0,
    };
    root.addr_direct[0] = first_data;
    let ioff = sb.iblock(ROOTINO) as usize * BSIZE
        + (ROOTINO as usize % IPB) * core::mem::size_of::<Dinode>();
    img[ioff..ioff + core::mem::size_of::<Dinode>()].copy_from_slice(root.as_bytes());

    let mut dot = Dirent {
        inum: ROOTINO as u16,
        name: [0; 14],
    };
    dot.name[0] = b'.';
    let doff = first_data as usize * BSIZE;
    img[doff..doff + DIRENT_SIZE].copy_from_slice(dot.as_bytes());
    dot.name[1] = b'.';
    img[doff + DIRENT_SIZE..doff + 2 * DIRENT_SIZE].copy_from_slice(dot.as_bytes());

    // Mark the metadata and the root block in use.
    for b in 0..=nmeta {
        img[sb.bmapstart as usize * BSIZE + b / 8] |= 1u8 << (b % 8);
    }

    img
}

/// A booted kernel instance over simulated memory and a MemDisk, with
/// one process installed as current on this CPU so sleep-locks and
/// syscalls have a context.
pub struct TestKernel {
    kernel: &'static Kernel,
    disk: &'static MemDisk,
}

/// Pages of simulated physical memory per kernel.
const MEM_PAGES: usize = 512;

impl TestKernel {
    pub fn boot(image: Vec<u8>) -> Self {
        let disk: &'static MemDisk = Box::leak(Box::new(MemDisk::new(image)));

        // Page tables index this window directly, so it must be
        // page-aligned; a plain `Vec<u8>` only guarantees `u8` alignment.
        let layout = std::alloc::Layout::from_size_align(MEM_PAGES * PGSIZE, PGSIZE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        // SAFETY: the buffer is leaked and used only through this
        // kernel's window.
        let region = unsafe { MemRegion::new(base, layout.size()) };

        let mut k = Kernel::new(disk);
        k.init_early(region, PGSIZE as u32, (MEM_PAGES * PGSIZE) as u32);
        let kernel: &'static Kernel = Box::leak(Box::new(k));

        let t = Self { kernel, disk };
        t.install_proc();
        kernel.fs_init(ROOTDEV);
        t
    }

    pub fn boot_default() -> Self {
        Self::boot(mkfs(2000))
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    pub fn disk(&self) -> &'static MemDisk {
        self.disk
    }

    /// The installed current process.
    pub fn proc(&self) -> CurrentProc<'static> {
        self.kernel.current_proc().expect("no harness process")
    }

    fn install_proc(&self) {
        let k = self.kernel;
        let idx = k.procs().alloc(k).expect("install_proc: alloc");
        // SAFETY: embryo slot; nothing else touches it yet.
        let data = unsafe { &mut *k.procs().proc(idx).data.get() };
        data.memory = Some(UserMemory::new(k, None).expect("install_proc: memory"));
        data.cwd = Some(k.itable().get(ROOTDEV, ROOTINO));
        data.name[..4].copy_from_slice(b"test");
        k.procs().table().lock().info[idx].state = ProcState::Running;
        // SAFETY: single-threaded per-test CPU.
        unsafe { (*current_cpu()).proc_idx = Some(idx) };
    }

    pub fn uninstall_proc(&self) {
        // SAFETY: single-threaded per-test CPU.
        unsafe { (*current_cpu()).proc_idx = None };
    }

    /// Invoke a system call the way user code would: arguments on the
    /// user stack, the number in %eax, dispatch through the trap path.
    /// Returns the value that lands back in %eax.
    pub fn syscall(&self, num: i32, args: &[i32]) -> i32 {
        let k = self.kernel;
        let mut proc = self.proc();

        // A scratch page at the top of the current image holds the fake
        // user stack.
        let sz = proc.memory().size();
        let stack_top = sz.max(PGSIZE);
        if sz < stack_top {
            proc.memory_mut().alloc(k, stack_top).expect("syscall stack");
        }
        let arg_base = stack_top - 64;
        for (i, a) in args.iter().enumerate() {
            proc.memory_mut()
                .copy_out(k, crate::vm::UVAddr::new(arg_base + 4 + 4 * i), a)
                .expect("syscall args");
        }

        let mut tf = crate::proc::TrapFrame::zero();
        tf.trapno = T_SYSCALL;
        tf.cs = (crate::arch::SEG_UCODE << 3) | crate::arch::DPL_USER;
        tf.eax = num as u32;
        tf.esp = arg_base as u32;
        drop(proc);
        trap(k, &mut tf);
        tf.eax as i32
    }
}
