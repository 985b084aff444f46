//! The kernel value: every process-wide singleton, constructed in a
//! deterministic order (locks → kmem → VM → procs → buffer cache → disk
//! → log → inodes → file table → first user process).
//!
//! On the machine itself a single `Kernel` lives in a `spin::Once`
//! static; the test harness builds private instances over simulated
//! memory and an in-memory disk.

use spin::Once;

use crate::bio::{Bcache, Disk};
use crate::cpu::current_cpu;
use crate::file::{new_devsw_table, Devsw, DevswTable, Ftable};
use crate::fs::{FileSystem, Itable};
use crate::kalloc::{Kmem, MemRegion};
use crate::lock::{pop_off, push_off, Sleepablelock, Spinlock};
use crate::param::KSTACKSIZE;
use crate::proc::{CurrentProc, Pid, Proc, Procs};
use crate::vm::KernelMemory;

use crate::arch::{interface::Arch, TargetArch};

pub struct Kernel {
    /// Window onto physical memory; fixed after early init.
    mem: MemRegion,

    kmem: Spinlock<Kmem>,

    /// Timer ticks since boot; sleepers wait on its channel.
    pub ticks: Sleepablelock<u32>,

    procs: Procs,

    bcache: Bcache,

    disk: &'static dyn Disk,

    fs: FileSystem,

    ftable: Ftable,

    devsw: DevswTable,

    kvm: Once<KernelMemory>,
}

impl Kernel {
    pub fn new(disk: &'static dyn Disk) -> Self {
        Self {
            mem: MemRegion::empty(),
            kmem: Spinlock::new("kmem", Kmem::new()),
            ticks: Sleepablelock::new("time", 0),
            procs: Procs::new(),
            bcache: Bcache::new(),
            disk,
            fs: FileSystem::new(),
            ftable: Ftable::new(),
            devsw: new_devsw_table(),
            kvm: Once::new(),
        }
    }

    /// Early single-threaded initialization: adopt the memory window,
    /// free `[free_lo, free_hi)` into the page allocator, link the
    /// buffer cache, and build the kernel page table.
    pub fn init_early(&mut self, region: MemRegion, free_lo: u32, free_hi: u32) {
        self.mem = region;
        self.kmem.get_mut().init_phase1(region, free_lo, free_hi);
        self.bcache.init();

        let this: &Kernel = self;
        this.kvm
            .call_once(|| KernelMemory::new(this).expect("kvmalloc"));
    }

    /// Late phase of memory initialization: donate the rest of physical
    /// memory, through the lock.
    pub fn kinit2(&self, start: u32, end: u32) {
        self.kmem.lock().free_range(start, end);
    }

    /// Read the superblock and recover the log. Must run in a process
    /// context because recovery does disk I/O.
    pub fn fs_init(&self, dev: u32) {
        self.fs.init(dev, self);
    }

    pub fn mem(&self) -> MemRegion {
        self.mem
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub fn disk(&self) -> &'static dyn Disk {
        self.disk
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn itable(&self) -> &Itable {
        &self.fs.itable
    }

    pub fn ftable(&self) -> &Ftable {
        &self.ftable
    }

    pub fn devsw(&self) -> &DevswTable {
        &self.devsw
    }

    /// Install a device driver's read/write entry points.
    pub fn register_device(&self, major: usize, devsw: Devsw) {
        self.devsw.lock()[major] = devsw;
    }

    pub fn alloc_page(&self) -> Option<u32> {
        self.kmem.lock().alloc()
    }

    pub fn free_page(&self, pa: u32) {
        self.kmem.lock().free(pa);
    }

    /// Index of the process running on this CPU, if any.
    pub fn current_proc_idx(&self) -> Option<usize> {
        push_off();
        // SAFETY: interrupts are off.
        let idx = unsafe { (*current_cpu()).proc_idx };
        pop_off();
        idx
    }

    /// The process running on this CPU.
    pub fn current_proc(&self) -> Option<CurrentProc<'_>> {
        let idx = self.current_proc_idx()?;
        let pid = self.procs.table().lock().info[idx].pid;
        // SAFETY: `idx` is installed on this CPU.
        Some(unsafe { CurrentProc::new(self, idx, pid) })
    }

    pub fn current_pid(&self) -> Pid {
        self.current_proc_idx()
            .map(|idx| self.procs.table().lock().info[idx].pid)
            .expect("no current process")
    }

    /// Switch the hardware to `proc`'s address space and point kernel
    /// entry at its stack. Interrupts stay off across the CR3/TSS
    /// window.
    pub fn switch_user_vm(&self, proc: &Proc) {
        push_off();
        // SAFETY: the process is not running (the scheduler holds the
        // table lock), so reading its data cannot race.
        let data = unsafe { &*proc.data.get() };
        assert_ne!(data.kstack, 0, "switchuvm: no kstack");
        let memory = data.memory.as_ref().expect("switchuvm: no pgdir");
        // SAFETY: the page directory is valid and includes the kernel
        // map; interrupts are off.
        unsafe {
            TargetArch::load_kernel_stack(self.mem.p2v(data.kstack) as usize + KSTACKSIZE);
            TargetArch::load_page_dir(memory.pgdir_addr());
        }
        pop_off();
    }

    /// Switch the hardware back to the kernel-only page table.
    pub fn switch_kernel_vm(&self) {
        let kvm = self.kvm.get().expect("switchkvm");
        // SAFETY: the kernel page table is valid.
        unsafe { TargetArch::load_page_dir(kvm.pgdir_addr()) };
    }
}

static KERNEL: Once<Kernel> = Once::new();

/// The global kernel. Valid after boot has run `install_kernel`; paths
/// that run only on the machine (forkret) use this, everything else
/// passes `&Kernel` explicitly.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel is not initialized")
}

/// Place the kernel value into its static home.
pub fn install_kernel(kernel: Kernel) -> &'static Kernel {
    KERNEL.call_once(|| kernel)
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        use crate::ide::{Ide, Pio};
        use crate::memlayout::{KERNBASE, PHYSTOP};
        use crate::vm::UVAddr;

        static IDE_DISK: Ide<Pio> = Ide::new(Pio);

        extern "C" {
            // Machine bring-up collaborators.
            fn mpinit();
            fn lapicinit();
            fn seginit();
            fn picinit();
            fn ioapicinit();
            fn consoleinit();
            fn uartinit();
            fn tvinit();
            fn idtinit();
            fn startothers();

            // Console collaborator I/O on kernel buffers.
            fn consoleread(dst: *mut u8, n: i32) -> i32;
            fn consolewrite(src: *const u8, n: i32) -> i32;

            // First address after kernel loaded from ELF file, defined
            // by the linker script.
            static end: [u8; 0];
        }

        /// Console major device number.
        const CONSOLE: usize = 1;

        fn console_dev_read(
            k: &Kernel,
            proc: &mut CurrentProc<'_>,
            addr: UVAddr,
            n: usize,
        ) -> Result<usize, ()> {
            let mut buf = [0u8; 128];
            let n = n.min(buf.len());
            // SAFETY: buf outlives the call.
            let r = unsafe { consoleread(buf.as_mut_ptr(), n as i32) };
            if r < 0 {
                return Err(());
            }
            proc.memory_mut().copy_out_bytes(k, addr, &buf[..r as usize])?;
            Ok(r as usize)
        }

        fn console_dev_write(
            k: &Kernel,
            proc: &mut CurrentProc<'_>,
            addr: UVAddr,
            n: usize,
        ) -> Result<usize, ()> {
            let mut written = 0;
            let mut buf = [0u8; 128];
            while written < n {
                let m = (n - written).min(buf.len());
                proc.memory_mut()
                    .copy_in_bytes(k, &mut buf[..m], addr + written)?;
                // SAFETY: buf outlives the call.
                let r = unsafe { consolewrite(buf.as_ptr(), m as i32) };
                if r < 0 {
                    return Err(());
                }
                written += r as usize;
            }
            Ok(written)
        }

        /// The boot processor lands here from the entry assembly with a
        /// minimal stack and the boot page directory.
        ///
        /// # Safety
        ///
        /// Called exactly once, by the boot loader's entry path.
        #[no_mangle]
        pub unsafe extern "C" fn kernel_main() -> ! {
            // Phase one of the allocator can only use the memory mapped
            // by the boot page directory.
            let region = MemRegion::new(KERNBASE as *mut u8, PHYSTOP as usize);
            let end_pa = (end.as_ptr() as usize - KERNBASE) as u32;
            const BOOT_MAPPED: u32 = 4 * 1024 * 1024;

            let k = install_kernel({
                let mut k = Kernel::new(&IDE_DISK);
                k.init_early(region, end_pa, BOOT_MAPPED);
                k
            });

            mpinit();
            lapicinit();
            seginit();
            picinit();
            ioapicinit();
            consoleinit();
            uartinit();
            k.register_device(
                CONSOLE,
                Devsw {
                    read: Some(console_dev_read),
                    write: Some(console_dev_write),
                },
            );
            println!();
            println!("ox6 kernel is booting");
            println!();
            tvinit();
            IDE_DISK.init();
            startothers();
            k.kinit2(BOOT_MAPPED, PHYSTOP);
            // The file system itself comes up in forkret, once the first
            // process runs.
            k.procs().user_init(k);
            main_common(k)
        }

        /// Other CPUs jump here from their entry stub.
        ///
        /// # Safety
        ///
        /// Called once per application processor.
        #[no_mangle]
        pub unsafe extern "C" fn mp_enter() -> ! {
            let k = kernel();
            k.switch_kernel_vm();
            seginit();
            lapicinit();
            main_common(k)
        }

        unsafe fn main_common(k: &'static Kernel) -> ! {
            println!("cpu{}: starting", TargetArch::cpu_id());
            idtinit();
            k.procs().scheduler(k)
        }
    }
}
