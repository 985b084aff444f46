//! Virtual memory: two-level x86 page tables (1024 × 1024 × 4 KiB), the
//! kernel map shared by every page directory, and per-process user
//! memory.
//!
//! Page-table pages store physical addresses; all access to them and to
//! mapped frames goes through the kernel's [`MemRegion`] window, so the
//! same code runs over the KERNBASE direct map on x86 and over a
//! simulated region on hosted builds.

use core::cmp;
use core::mem;

use arrayvec::ArrayVec;
use bitflags::bitflags;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::InodeGuard;
use crate::kernel::Kernel;
use crate::memlayout::KERNBASE;

pub const PGSIZE: usize = 4096;

/// Entries per page directory or page table.
const NPTENTRIES: usize = 1024;

pub fn pgroundup(a: usize) -> usize {
    (a + PGSIZE - 1) & !(PGSIZE - 1)
}

pub fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

/// Page-directory index of a virtual address.
fn pdx(va: usize) -> usize {
    (va >> 22) & 0x3FF
}

/// Page-table index of a virtual address.
fn ptx(va: usize) -> usize {
    (va >> 12) & 0x3FF
}

bitflags! {
    /// PDE/PTE permission bits.
    pub struct PteFlags: u32 {
        /// Present.
        const P = 0x001;
        /// Writeable.
        const W = 0x002;
        /// User-accessible.
        const U = 0x004;
    }
}

/// A user virtual address. Always below KERNBASE when valid; never
/// dereferenced directly, only translated through a page table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UVAddr(usize);

impl UVAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn value(self) -> usize {
        self.0
    }

    pub fn is_page_aligned(self) -> bool {
        self.0 % PGSIZE == 0
    }
}

impl core::ops::Add<usize> for UVAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// # Safety
///
/// If the P flag is set and W/U mark it as an interior node, `pa()` is a
/// page-table page allocated from the kernel allocator.
#[derive(Copy, Clone, Default)]
struct PageTableEntry {
    inner: u32,
}

impl PageTableEntry {
    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.inner)
    }

    fn pa(&self) -> u32 {
        self.inner & !0xFFF
    }

    fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    fn is_user(&self) -> bool {
        self.flags().contains(PteFlags::P | PteFlags::U)
    }

    fn set_entry(&mut self, pa: u32, perm: PteFlags) {
        assert_eq!(pa & 0xFFF, 0, "PageTableEntry::set_entry");
        self.inner = pa | (perm | PteFlags::P).bits();
    }

    /// Make the entry inaccessible to user mode by clearing PteFlags::U.
    fn clear_user(&mut self) {
        self.inner &= !PteFlags::U.bits();
    }

    fn invalidate(&mut self) {
        self.inner = 0;
    }
}

/// One page of 1024 entries: a page directory or a page table.
#[repr(C, align(4096))]
struct RawPageTable {
    inner: [PageTableEntry; NPTENTRIES],
}

const_assert!(mem::size_of::<RawPageTable>() == PGSIZE);

impl RawPageTable {
    /// The table page at physical address `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must be a page-table page owned by the caller's directory;
    /// the returned reference must not outlive that ownership.
    unsafe fn from_pa<'a>(pa: u32, kernel: &Kernel) -> &'a mut RawPageTable {
        &mut *(kernel.mem().p2v(pa) as *mut RawPageTable)
    }
}

/// A two-level page table rooted at a page directory.
///
/// # Safety
///
/// `dir` uniquely refers to a valid page directory whose interior
/// entries point at page-table pages owned by this value.
pub struct PageTable {
    /// Physical address of the page directory.
    dir: u32,
}

impl PageTable {
    /// Allocate an empty page directory.
    fn new(kernel: &Kernel) -> Option<Self> {
        let dir = kernel.alloc_page()?;
        // SAFETY: freshly allocated, so no aliases.
        unsafe { kernel.mem().page_slice_mut(dir) }.fill(0);
        Some(Self { dir })
    }

    pub fn addr(&self) -> u32 {
        self.dir
    }

    /// Return the PTE in this page table that corresponds to virtual
    /// address `va`. If `alloc` is true, create any required page-table
    /// page.
    fn walk(&mut self, kernel: &Kernel, va: usize, alloc: bool) -> Option<&mut PageTableEntry> {
        // SAFETY: `dir` is this table's directory page.
        let dir = unsafe { RawPageTable::from_pa(self.dir, kernel) };
        let pde = &mut dir.inner[pdx(va)];
        let table_pa = if pde.is_present() {
            pde.pa()
        } else {
            if !alloc {
                return None;
            }
            let pa = kernel.alloc_page()?;
            // SAFETY: freshly allocated, so no aliases.
            unsafe { kernel.mem().page_slice_mut(pa) }.fill(0);
            // Permissions on the leaf PTE govern access; the directory
            // entry stays maximally permissive.
            pde.set_entry(pa, PteFlags::W | PteFlags::U);
            pa
        };
        // SAFETY: interior entries point at pages owned by this table.
        let table = unsafe { RawPageTable::from_pa(table_pa, kernel) };
        Some(&mut table.inner[ptx(va)])
    }

    /// Create PTEs for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`. `va` and `size` might not be
    /// page-aligned.
    fn insert_range(
        &mut self,
        kernel: &Kernel,
        va: usize,
        size: usize,
        pa: u32,
        perm: PteFlags,
    ) -> Result<(), ()> {
        let first = pgrounddown(va);
        let last = pgrounddown(va + size - 1);
        for off in num_iter::range_step_inclusive(0usize, last - first, PGSIZE) {
            let pte = self.walk(kernel, first + off, true).ok_or(())?;
            assert!(!pte.is_present(), "remap");
            pte.set_entry(pa + off as u32, perm);
        }
        Ok(())
    }

    /// Free every page-table page and the directory itself. Leaf frames
    /// must already have been removed by the caller.
    fn free_tables(self, kernel: &Kernel) {
        // SAFETY: `dir` is this table's directory page, being consumed.
        let dir = unsafe { RawPageTable::from_pa(self.dir, kernel) };
        for pde in dir.inner.iter_mut() {
            if pde.is_present() {
                kernel.free_page(pde.pa());
                pde.invalidate();
            }
        }
        kernel.free_page(self.dir);
    }
}

/// A fixed virtual-to-physical range of the kernel map.
struct Kmap {
    virt: usize,
    start: u32,
    end: u64,
    perm: PteFlags,
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        fn kvm_mappings(_kernel: &Kernel) -> ArrayVec<Kmap, 4> {
            use crate::memlayout::{DEVSPACE, EXTMEM, KERNLINK, PHYSTOP};

            extern "C" {
                // kernel.ld sets this to the start of writable kernel data.
                static data: [u8; 0];
            }

            // SAFETY: only the address of the linker symbol is taken.
            let data_va = unsafe { data.as_ptr() as usize };
            let data_pa = (data_va - KERNBASE) as u32;

            let mut maps = ArrayVec::new();
            // I/O space.
            maps.push(Kmap { virt: KERNBASE, start: 0, end: EXTMEM as u64, perm: PteFlags::W });
            // Kernel text and read-only data.
            maps.push(Kmap { virt: KERNLINK, start: EXTMEM, end: data_pa as u64, perm: PteFlags::empty() });
            // Kernel data and free physical memory.
            maps.push(Kmap { virt: data_va, start: data_pa, end: PHYSTOP as u64, perm: PteFlags::W });
            // Devices, mapped in place.
            maps.push(Kmap { virt: DEVSPACE as usize, start: DEVSPACE, end: 1 << 32, perm: PteFlags::W });
            maps
        }
    } else {
        fn kvm_mappings(kernel: &Kernel) -> ArrayVec<Kmap, 4> {
            // The hosted window is one writable range.
            let mut maps = ArrayVec::new();
            maps.push(Kmap {
                virt: KERNBASE,
                start: 0,
                end: kernel.mem().size() as u64,
                perm: PteFlags::W,
            });
            maps
        }
    }
}

/// Build a page directory holding the kernel's fixed mappings. Every
/// process page directory starts from this.
fn setup_kvm(kernel: &Kernel) -> Option<PageTable> {
    let mut pt = PageTable::new(kernel)?;
    for m in kvm_mappings(kernel) {
        if pt
            .insert_range(
                kernel,
                m.virt,
                (m.end - m.start as u64) as usize,
                m.start,
                m.perm,
            )
            .is_err()
        {
            pt.free_tables(kernel);
            return None;
        }
    }
    Some(pt)
}

/// The kernel's own address space, used by the scheduler and while no
/// process runs.
pub struct KernelMemory {
    page_table: PageTable,
}

impl KernelMemory {
    pub fn new(kernel: &Kernel) -> Option<Self> {
        Some(Self {
            page_table: setup_kvm(kernel)?,
        })
    }

    pub fn pgdir_addr(&self) -> u32 {
        self.page_table.addr()
    }
}

/// UserMemory manages the page table and allocated frames of one
/// process. Every frame mapped below `size` came from the page
/// allocator, which is what makes `copy_in`/`copy_out` and `free` sound.
pub struct UserMemory {
    page_table: PageTable,
    /// Size of process memory (bytes).
    size: usize,
}

impl UserMemory {
    /// Create an address space holding only the kernel map. If `src` is
    /// given, copy it into a fresh page mapped user-read-write at
    /// virtual address 0; it must fit in one page.
    pub fn new(kernel: &Kernel, src: Option<&[u8]>) -> Option<Self> {
        let page_table = setup_kvm(kernel)?;
        let mut memory = Self {
            page_table,
            size: 0,
        };

        if let Some(src) = src {
            assert!(src.len() < PGSIZE, "UserMemory::new: more than a page");
            let pa = match kernel.alloc_page() {
                Some(pa) => pa,
                None => {
                    memory.free(kernel);
                    return None;
                }
            };
            // SAFETY: freshly allocated, so no aliases.
            let page = unsafe { kernel.mem().page_slice_mut(pa) };
            page.fill(0);
            page[..src.len()].copy_from_slice(src);
            if memory.push_page(kernel, pa, PteFlags::W | PteFlags::U).is_err() {
                kernel.free_page(pa);
                memory.free(kernel);
                return None;
            }
        }

        Some(memory)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pgdir_addr(&self) -> u32 {
        self.page_table.addr()
    }

    /// Allocate page-table entries and physical memory to grow the
    /// process to `newsz`, which need not be page-aligned. On failure
    /// every page this call added is released and `size` is unchanged.
    pub fn alloc(&mut self, kernel: &Kernel, newsz: usize) -> Result<usize, ()> {
        if newsz >= KERNBASE {
            return Err(());
        }
        if newsz <= self.size {
            return Ok(self.size);
        }

        let oldsz = self.size;
        let mut this = scopeguard::guard(self, |this| {
            let _ = this.dealloc(kernel, oldsz);
        });
        while pgroundup(this.size) < pgroundup(newsz) {
            let pa = kernel.alloc_page().ok_or(())?;
            // SAFETY: freshly allocated, so no aliases.
            unsafe { kernel.mem().page_slice_mut(pa) }.fill(0);
            this.push_page(kernel, pa, PteFlags::W | PteFlags::U)
                .map_err(|_| kernel.free_page(pa))?;
        }
        let this = scopeguard::ScopeGuard::into_inner(this);
        this.size = newsz;
        Ok(newsz)
    }

    /// Deallocate user pages to bring the process size to `newsz`.
    /// Returns the new size. A page-directory entry that was never
    /// filled in skips the walk to the next directory boundary.
    pub fn dealloc(&mut self, kernel: &Kernel, newsz: usize) -> usize {
        if self.size <= newsz {
            return self.size;
        }

        let mut va = pgroundup(newsz);
        while va < pgroundup(self.size) {
            match self.page_table.walk(kernel, va, false) {
                None => {
                    // Missing interior table; step to the next 4 MiB
                    // boundary.
                    va = (pdx(va) + 1) << 22;
                }
                Some(pte) => {
                    if pte.is_present() {
                        let pa = pte.pa();
                        pte.invalidate();
                        kernel.free_page(pa);
                    }
                    va += PGSIZE;
                }
            }
        }
        self.size = newsz;
        newsz
    }

    /// Grow or shrink the process by `n` bytes. Returns the old size.
    pub fn resize(&mut self, kernel: &Kernel, n: i32) -> Result<usize, ()> {
        let size = self.size;
        match n.cmp(&0) {
            cmp::Ordering::Equal => {}
            cmp::Ordering::Greater => {
                self.alloc(kernel, size + n as usize)?;
            }
            cmp::Ordering::Less => {
                self.dealloc(kernel, size - (-n) as usize);
            }
        }
        Ok(size)
    }

    /// Deep-copy this address space for fork. Frees everything it
    /// allocated if any allocation fails.
    pub fn try_clone(&mut self, kernel: &Kernel) -> Option<Self> {
        let new = Self::new(kernel, None)?;
        let mut new = scopeguard::guard(new, |new| new.free(kernel));
        for va in num_iter::range_step(0, self.size, PGSIZE) {
            let pte = self
                .page_table
                .walk(kernel, va, false)
                .expect("try_clone: pte should exist");
            assert!(pte.is_present(), "try_clone: page not present");
            let (src_pa, flags) = (pte.pa(), pte.flags());

            let pa = kernel.alloc_page()?;
            // SAFETY: src_pa is a frame of this address space; pa is
            // fresh. The two never alias.
            unsafe {
                kernel
                    .mem()
                    .page_slice_mut(pa)
                    .copy_from_slice(kernel.mem().page_slice_mut(src_pa));
            }
            if new.push_page(kernel, pa, flags).is_err() {
                kernel.free_page(pa);
                return None;
            }
        }
        let mut new = scopeguard::ScopeGuard::into_inner(new);
        new.size = self.size;
        Some(new)
    }

    /// Release the user frames, the page-table pages, and the directory.
    pub fn free(mut self, kernel: &Kernel) {
        self.dealloc(kernel, 0);
        self.page_table.free_tables(kernel);
    }

    /// Load program bytes from `ip` into memory at `va`, which must be
    /// page-aligned. The pages from `va` to `va + sz` must already be
    /// mapped.
    pub fn load_file(
        &mut self,
        kernel: &Kernel,
        va: UVAddr,
        ip: &mut InodeGuard<'_>,
        offset: u32,
        sz: u32,
    ) -> Result<(), ()> {
        assert!(va.is_page_aligned(), "load_file: addr must be page aligned");
        for i in num_iter::range_step(0, sz, PGSIZE as u32) {
            let pte = self
                .page_table
                .walk(kernel, va.value() + i as usize, false)
                .expect("load_file: address should exist");
            assert!(pte.is_present(), "load_file: page not present");
            let pa = pte.pa();
            let n = cmp::min((sz - i) as usize, PGSIZE);
            // SAFETY: the frame belongs to this address space and no
            // other reference to it is live.
            let dst = unsafe { kernel.mem().page_slice_mut(pa) };
            if ip.read_bytes_kernel(kernel, &mut dst[..n], offset + i) != n {
                return Err(());
            }
        }
        Ok(())
    }

    /// Mark the page containing `va` inaccessible to user mode. Used by
    /// exec for the stack guard page.
    pub fn clear_user(&mut self, kernel: &Kernel, va: UVAddr) {
        self.page_table
            .walk(kernel, va.value(), false)
            .expect("clear_user")
            .clear_user();
    }

    /// Copy from kernel to user: `src` to virtual address `dstva`.
    pub fn copy_out_bytes(&mut self, kernel: &Kernel, dstva: UVAddr, src: &[u8]) -> Result<(), ()> {
        let mut dst = dstva.value();
        let mut offset = 0;
        while offset < src.len() {
            let va = pgrounddown(dst);
            let poffset = dst - va;
            let page = self.get_slice(kernel, UVAddr::new(va)).ok_or(())?;
            let n = cmp::min(PGSIZE - poffset, src.len() - offset);
            page[poffset..poffset + n].copy_from_slice(&src[offset..offset + n]);
            offset += n;
            dst += n;
        }
        Ok(())
    }

    pub fn copy_out<T: AsBytes>(&mut self, kernel: &Kernel, dstva: UVAddr, src: &T) -> Result<(), ()> {
        self.copy_out_bytes(kernel, dstva, src.as_bytes())
    }

    /// Copy from user to kernel: virtual address `srcva` into `dst`.
    pub fn copy_in_bytes(&mut self, kernel: &Kernel, dst: &mut [u8], srcva: UVAddr) -> Result<(), ()> {
        let mut src = srcva.value();
        let mut offset = 0;
        while offset < dst.len() {
            let va = pgrounddown(src);
            let poffset = src - va;
            let page = self.get_slice(kernel, UVAddr::new(va)).ok_or(())?;
            let n = cmp::min(PGSIZE - poffset, dst.len() - offset);
            dst[offset..offset + n].copy_from_slice(&page[poffset..poffset + n]);
            offset += n;
            src += n;
        }
        Ok(())
    }

    pub fn copy_in<T: AsBytes + FromBytes>(
        &mut self,
        kernel: &Kernel,
        dst: &mut T,
        srcva: UVAddr,
    ) -> Result<(), ()> {
        self.copy_in_bytes(kernel, dst.as_bytes_mut(), srcva)
    }

    /// Copy a NUL-terminated string from user to kernel, at most
    /// `dst.len()` bytes including the terminator. Errors if no NUL is
    /// found within the buffer or the address range is unmapped.
    pub fn copy_in_str(&mut self, kernel: &Kernel, dst: &mut [u8], srcva: UVAddr) -> Result<(), ()> {
        let mut src = srcva.value();
        let mut offset = 0;
        let mut max = dst.len();
        while max > 0 {
            let va = pgrounddown(src);
            let poffset = src - va;
            let page = self.get_slice(kernel, UVAddr::new(va)).ok_or(())?;
            let n = cmp::min(PGSIZE - poffset, max);

            let from = &page[poffset..poffset + n];
            match from.iter().position(|c| *c == 0) {
                Some(i) => {
                    dst[offset..offset + i + 1].copy_from_slice(&from[..i + 1]);
                    return Ok(());
                }
                None => {
                    dst[offset..offset + n].copy_from_slice(from);
                    max -= n;
                    offset += n;
                    src += n;
                }
            }
        }
        Err(())
    }

    /// The user page containing `va` as a slice. The translation
    /// requires a present, user-accessible mapping below KERNBASE.
    fn get_slice(&mut self, kernel: &Kernel, va: UVAddr) -> Option<&mut [u8]> {
        if va.value() >= KERNBASE {
            return None;
        }
        let pte = self.page_table.walk(kernel, va.value(), false)?;
        if !pte.is_user() {
            return None;
        }
        // SAFETY: frames below KERNBASE belong to this address space.
        Some(unsafe { kernel.mem().page_slice_mut(pte.pa()) })
    }

    /// Increase the size by appending a given frame with given flags.
    fn push_page(&mut self, kernel: &Kernel, pa: u32, perm: PteFlags) -> Result<(), ()> {
        let size = pgroundup(self.size);
        let pte = self.page_table.walk(kernel, size, true).ok_or(())?;
        assert!(!pte.is_present(), "push_page: remap");
        pte.set_entry(pa, perm);
        self.size = size + PGSIZE;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestKernel;

    #[test]
    fn alloc_maps_zeroed_user_pages() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut mem = UserMemory::new(k, None).unwrap();
        assert_eq!(mem.size(), 0);
        assert_eq!(mem.alloc(k, 3 * PGSIZE + 5).unwrap(), 3 * PGSIZE + 5);

        let mut byte = 0xFFu8;
        mem.copy_in(k, &mut byte, UVAddr::new(2 * PGSIZE + 7)).unwrap();
        assert_eq!(byte, 0);
        mem.free(k);
    }

    #[test]
    fn failed_growth_rolls_back() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut mem = UserMemory::new(k, None).unwrap();
        mem.alloc(k, 2 * PGSIZE).unwrap();

        // Drain the page allocator so that growth must fail part-way.
        let mut hoard = Vec::new();
        while let Some(pa) = k.alloc_page() {
            hoard.push(pa);
        }
        // Give back a single page: not enough for four more.
        k.free_page(hoard.pop().unwrap());

        assert!(mem.alloc(k, 6 * PGSIZE).is_err());
        assert_eq!(mem.size(), 2 * PGSIZE);
        // The one returned page is free again after rollback.
        let pa = k.alloc_page().expect("rollback returned pages");
        k.free_page(pa);

        for pa in hoard {
            k.free_page(pa);
        }
        mem.free(k);
    }

    #[test]
    fn copy_out_and_in_cross_page_boundaries() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut mem = UserMemory::new(k, None).unwrap();
        mem.alloc(k, 2 * PGSIZE).unwrap();

        let msg = b"boundary-crossing payload";
        let addr = UVAddr::new(PGSIZE - 7);
        mem.copy_out_bytes(k, addr, msg).unwrap();
        let mut back = [0u8; 25];
        mem.copy_in_bytes(k, &mut back, addr).unwrap();
        assert_eq!(&back, msg);
        mem.free(k);
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut mem = UserMemory::new(k, None).unwrap();
        mem.alloc(k, PGSIZE).unwrap();

        mem.copy_out_bytes(k, UVAddr::new(16), b"name\0junk").unwrap();
        let mut buf = [0xAAu8; 16];
        mem.copy_in_str(k, &mut buf, UVAddr::new(16)).unwrap();
        assert_eq!(&buf[..5], b"name\0");

        // No terminator within the buffer is an error.
        let mut tiny = [0u8; 3];
        assert!(mem.copy_in_str(k, &mut tiny, UVAddr::new(16)).is_err());
        mem.free(k);
    }

    #[test]
    fn copies_demand_user_accessible_mappings() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut mem = UserMemory::new(k, None).unwrap();
        mem.alloc(k, 2 * PGSIZE).unwrap();

        // An unmapped address fails.
        assert!(mem.copy_out_bytes(k, UVAddr::new(5 * PGSIZE), b"x").is_err());
        // A kernel address fails outright.
        assert!(mem
            .copy_out_bytes(k, UVAddr::new(crate::memlayout::KERNBASE), b"x")
            .is_err());
        // Clearing PTE_U (the exec stack guard) blocks user copies.
        mem.clear_user(k, UVAddr::new(PGSIZE));
        assert!(mem.copy_out_bytes(k, UVAddr::new(PGSIZE), b"x").is_err());
        assert!(mem.copy_out_bytes(k, UVAddr::new(0), b"x").is_ok());
        mem.free(k);
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut mem = UserMemory::new(k, None).unwrap();
        mem.alloc(k, PGSIZE).unwrap();
        mem.copy_out_bytes(k, UVAddr::new(40), b"parent").unwrap();

        let mut child = mem.try_clone(k).unwrap();
        assert_eq!(child.size(), mem.size());

        // Writes to the child are invisible to the parent.
        child.copy_out_bytes(k, UVAddr::new(40), b"child!").unwrap();
        let mut buf = [0u8; 6];
        mem.copy_in_bytes(k, &mut buf, UVAddr::new(40)).unwrap();
        assert_eq!(&buf, b"parent");
        child.copy_in_bytes(k, &mut buf, UVAddr::new(40)).unwrap();
        assert_eq!(&buf, b"child!");

        child.free(k);
        mem.free(k);
    }

    #[test]
    fn dealloc_skips_missing_tables() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut mem = UserMemory::new(k, None).unwrap();
        mem.alloc(k, 2 * PGSIZE).unwrap();
        // Pretend the size covered a range whose tables were never
        // built; dealloc steps directory-by-directory without touching
        // them.
        mem.size = 5 * 4 * 1024 * 1024;
        assert_eq!(mem.dealloc(k, 0), 0);
        mem.free(k);
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let t = TestKernel::boot_default();
        let k = t.kernel();
        let mut mem = UserMemory::new(k, None).unwrap();
        assert_eq!(mem.resize(k, (2 * PGSIZE) as i32).unwrap(), 0);
        assert_eq!(mem.size(), 2 * PGSIZE);
        assert_eq!(mem.resize(k, -(PGSIZE as i32)).unwrap(), 2 * PGSIZE);
        assert_eq!(mem.size(), PGSIZE);
        mem.free(k);
    }
}
