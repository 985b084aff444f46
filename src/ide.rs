//! Simple PIO-based (non-DMA) IDE driver.
//!
//! One request is in flight at a time; the rest wait in a FIFO of buffer
//! cache slots. `rw` enqueues and sleeps on the buffer; the interrupt
//! handler finishes the head request, wakes its sleeper, and starts the
//! next.

use arrayvec::ArrayVec;

use crate::bio::{Buf, BufData, Disk};
use crate::kernel::Kernel;
use crate::lock::Spinlock;
use crate::param::{BSIZE, FSSIZE, NBUF};

const SECTOR_SIZE: usize = 512;

const IDE_BSY: u8 = 0x80;
const IDE_DRDY: u8 = 0x40;
const IDE_DF: u8 = 0x20;
const IDE_ERR: u8 = 0x01;

const IDE_CMD_READ: u8 = 0x20;
const IDE_CMD_WRITE: u8 = 0x30;
const IDE_CMD_RDMUL: u8 = 0xC4;
const IDE_CMD_WRMUL: u8 = 0xC5;

/// The controller's I/O port surface, so the driver logic is independent
/// of how the ports are reached.
pub trait IdePorts: Sync {
    fn inb(&self, port: u16) -> u8;
    fn outb(&self, port: u16, data: u8);

    /// Read `cnt` dwords from `port` into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `cnt` dword writes.
    unsafe fn insl(&self, port: u16, dst: *mut u32, cnt: usize);

    /// Write `cnt` dwords from `src` to `port`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `cnt` dword reads.
    unsafe fn outsl(&self, port: u16, src: *const u32, cnt: usize);
}

/// Real port I/O, available on bare-metal x86 only.
pub struct Pio;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        impl IdePorts for Pio {
            fn inb(&self, port: u16) -> u8 {
                unsafe { crate::arch::x86::inb(port) }
            }

            fn outb(&self, port: u16, data: u8) {
                unsafe { crate::arch::x86::outb(port, data) }
            }

            unsafe fn insl(&self, port: u16, dst: *mut u32, cnt: usize) {
                crate::arch::x86::insl(port, dst, cnt)
            }

            unsafe fn outsl(&self, port: u16, src: *const u32, cnt: usize) {
                crate::arch::x86::outsl(port, src, cnt)
            }
        }
    } else {
        impl IdePorts for Pio {
            fn inb(&self, _port: u16) -> u8 {
                unimplemented!("port I/O requires bare-metal x86")
            }

            fn outb(&self, _port: u16, _data: u8) {
                unimplemented!("port I/O requires bare-metal x86")
            }

            unsafe fn insl(&self, _port: u16, _dst: *mut u32, _cnt: usize) {
                unimplemented!("port I/O requires bare-metal x86")
            }

            unsafe fn outsl(&self, _port: u16, _src: *const u32, _cnt: usize) {
                unimplemented!("port I/O requires bare-metal x86")
            }
        }
    }
}

/// A queued request. The buffer's contents are lent to the driver while
/// its holder sleeps, so a raw pointer is what actually changes hands.
struct Request {
    idx: usize,
    dev: u32,
    blockno: u32,
    write: bool,
    data: *mut BufData,
}

// Requests move between the enqueuing process and the interrupt handler;
// the pointee is owned by the driver for the life of the request.
unsafe impl Send for Request {}

pub struct Ide<P: IdePorts> {
    ports: P,
    queue: Spinlock<ArrayVec<Request, NBUF>>,
    have_disk1: Spinlock<bool>,
}

impl<P: IdePorts> Ide<P> {
    pub const fn new(ports: P) -> Self {
        Self {
            ports,
            queue: Spinlock::new("ide", ArrayVec::new_const()),
            have_disk1: Spinlock::new("ide1", false),
        }
    }

    /// Wait for the disk to become ready.
    fn wait(&self, check_err: bool) -> Result<(), ()> {
        let mut r = self.ports.inb(0x1F7);
        while r & (IDE_BSY | IDE_DRDY) != IDE_DRDY {
            r = self.ports.inb(0x1F7);
        }
        if check_err && r & (IDE_DF | IDE_ERR) != 0 {
            return Err(());
        }
        Ok(())
    }

    /// Probe for disk 1. The interrupt controller setup belongs to the
    /// machine bring-up collaborator.
    pub fn init(&self) {
        let _ = self.wait(false);

        // Check if disk 1 is present.
        self.ports.outb(0x1F6, 0xE0 | (1 << 4));
        let mut present = false;
        for _ in 0..1000 {
            if self.ports.inb(0x1F7) != 0 {
                present = true;
                break;
            }
        }
        *self.have_disk1.lock() = present;

        // Switch back to disk 0.
        self.ports.outb(0x1F6, 0xE0);
    }

    /// Issue a request to the hardware. The caller holds the queue lock.
    fn start(&self, req: &Request) {
        assert!((req.blockno as usize) < FSSIZE, "incorrect blockno");
        let sector_per_block = BSIZE / SECTOR_SIZE;
        let sector = req.blockno as usize * sector_per_block;
        let read_cmd = if sector_per_block == 1 { IDE_CMD_READ } else { IDE_CMD_RDMUL };
        let write_cmd = if sector_per_block == 1 { IDE_CMD_WRITE } else { IDE_CMD_WRMUL };
        assert!(sector_per_block <= 7, "idestart");

        let _ = self.wait(false);
        // Generate interrupt.
        self.ports.outb(0x3F6, 0);
        self.ports.outb(0x1F2, sector_per_block as u8);
        self.ports.outb(0x1F3, (sector & 0xFF) as u8);
        self.ports.outb(0x1F4, ((sector >> 8) & 0xFF) as u8);
        self.ports.outb(0x1F5, ((sector >> 16) & 0xFF) as u8);
        self.ports
            .outb(0x1F6, 0xE0 | (((req.dev & 1) << 4) as u8) | (((sector >> 24) & 0x0F) as u8));
        if req.write {
            self.ports.outb(0x1F7, write_cmd);
            // SAFETY: the buffer is lent to the driver for the life of
            // the request.
            unsafe {
                self.ports
                    .outsl(0x1F0, req.data as *const u32, BSIZE / 4);
            }
        } else {
            self.ports.outb(0x1F7, read_cmd);
        }
    }
}

impl<P: IdePorts> Disk for Ide<P> {
    /// Synchronize a buffer with disk: write it out if dirty, read it in
    /// if not valid.
    fn rw(&self, b: &mut Buf<'_>, kernel: &Kernel) {
        assert!(
            !(b.is_valid() && !b.dirty()),
            "iderw: nothing to do"
        );
        assert!(b.dev == 0 || *self.have_disk1.lock(), "iderw: ide disk 1 not present");

        let mut queue = self.queue.lock();
        queue.push(Request {
            idx: b.index(),
            dev: b.dev,
            blockno: b.blockno,
            write: b.dirty(),
            data: b.data_mut() as *mut BufData,
        });

        // Start disk if necessary.
        if queue.len() == 1 {
            self.start(&queue[0]);
        }

        // Wait for the request to finish.
        while !(b.is_valid() && !b.dirty()) {
            b.entry().disk_chan.sleep(&mut queue, kernel);
        }
    }

    /// Completion: the head request is done.
    fn intr(&self, kernel: &Kernel) {
        let mut queue = self.queue.lock();
        let req = match queue.first() {
            Some(_) => queue.remove(0),
            None => return,
        };

        // Read data if needed.
        if !req.write && self.wait(true).is_ok() {
            // SAFETY: the buffer was lent to the driver by `rw`.
            unsafe { self.ports.insl(0x1F0, req.data as *mut u32, BSIZE / 4) };
        }

        let entry = kernel.bcache().entry(req.idx);
        // SAFETY: the requesting process holds the sleep-lock and sleeps
        // until we wake it; the contents are ours until then.
        unsafe { (*entry.inner_raw()).valid = true };
        entry.set_dirty(false);
        entry.disk_chan.wakeup(kernel);

        // Start disk on next buf in queue.
        if let Some(next) = queue.first() {
            self.start(next);
        }
    }
}
