//! exec: replace a process image with a program loaded from the file
//! system, with its arguments laid out on the new user stack.

use core::mem;

use arrayvec::ArrayVec;

use crate::elf::{ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::Path;
use crate::kernel::Kernel;
use crate::param::{MAXARG, MAXPROCNAME};
use crate::proc::CurrentProc;
use crate::vm::{pgroundup, UVAddr, UserMemory, PGSIZE};

impl Kernel {
    /// Replace `proc`'s user image with the program at `path`. `args`
    /// holds one allocated page per argument, each a NUL-terminated
    /// string; the caller owns and frees those pages. On success the
    /// trap frame is retargeted at the new entry point and 0 lands in
    /// the return register on the way out.
    pub fn exec(
        &self,
        proc: &mut CurrentProc<'_>,
        path: &Path<'_>,
        args: &ArrayVec<u32, MAXARG>,
    ) -> Result<usize, ()> {
        let tx = self.begin_tx();
        let ip_ref = self.itable().namei(self, &tx, proc.cwd(), path)?;
        let mut ip = self.itable().lock(self, &ip_ref);

        // Check ELF header.
        let mut elf = ElfHdr::default();
        let memory = (|| {
            ip.read_kernel(self, &mut elf, 0).ok()?;
            if elf.magic != ELF_MAGIC {
                return None;
            }

            let memory = UserMemory::new(self, None)?;
            let mut memory = scopeguard::guard(memory, |m| m.free(self));

            // Load program into memory.
            for i in 0..elf.phnum as u32 {
                let off = elf.phoff + i * mem::size_of::<ProgHdr>() as u32;
                let mut ph = ProgHdr::default();
                ip.read_kernel(self, &mut ph, off).ok()?;
                if ph.typ != ELF_PROG_LOAD {
                    continue;
                }
                if ph.memsz < ph.filesz {
                    return None;
                }
                if ph.vaddr.checked_add(ph.memsz).is_none() {
                    return None;
                }
                if ph.vaddr as usize % PGSIZE != 0 {
                    return None;
                }
                memory
                    .alloc(self, (ph.vaddr + ph.memsz) as usize)
                    .ok()?;
                memory
                    .load_file(
                        self,
                        UVAddr::new(ph.vaddr as usize),
                        &mut ip,
                        ph.off,
                        ph.filesz,
                    )
                    .ok()?;
            }

            Some(scopeguard::ScopeGuard::into_inner(memory))
        })();
        drop(ip);
        self.itable().put(self, &tx, ip_ref);
        drop(tx);
        let memory = memory.ok_or(())?;
        let mut memory = scopeguard::guard(memory, |m| m.free(self));

        // Allocate two pages at the next page boundary: the first is a
        // stack guard, inaccessible to user code; the second is the user
        // stack.
        let sz = pgroundup(memory.size());
        memory.alloc(self, sz + 2 * PGSIZE).map_err(|_| ())?;
        memory.clear_user(self, UVAddr::new(sz));
        let mut sp = sz + 2 * PGSIZE;

        // Push argument strings, prepare rest of stack in ustack.
        let mut ustack = [0u32; 3 + MAXARG + 1];
        let argc = args.len();
        if argc > MAXARG {
            return Err(());
        }
        for (i, &page) in args.iter().enumerate() {
            // SAFETY: each argument page is owned by the caller for the
            // duration of exec.
            let bytes = unsafe { self.mem().page_slice_mut(page) };
            let len = bytes.iter().position(|c| *c == 0).ok_or(())? + 1;
            sp = (sp - len) & !3; // word-align the string start
            memory
                .copy_out_bytes(self, UVAddr::new(sp), &bytes[..len])
                .map_err(|_| ())?;
            ustack[3 + i] = sp as u32;
        }
        ustack[3 + argc] = 0;

        // Fake return program counter, argc, argv pointer.
        ustack[0] = 0xFFFF_FFFF;
        ustack[1] = argc as u32;
        let nbytes = (3 + argc + 1) * mem::size_of::<u32>();
        ustack[2] = (sp - nbytes + 3 * mem::size_of::<u32>()) as u32;

        sp -= nbytes;
        {
            use zerocopy::AsBytes;
            let words = ustack[..3 + argc + 1].as_bytes();
            memory
                .copy_out_bytes(self, UVAddr::new(sp), words)
                .map_err(|_| ())?;
        }

        // Save program name for debugging.
        let mut last = path.as_bytes();
        while let Some(pos) = last.iter().position(|c| *c == b'/') {
            last = &last[pos + 1..];
        }
        let name = &mut proc.data_mut().name;
        *name = [0; MAXPROCNAME];
        let n = last.len().min(MAXPROCNAME - 1);
        name[..n].copy_from_slice(&last[..n]);

        // Commit to the user image.
        let memory = scopeguard::ScopeGuard::into_inner(memory);
        let old = proc.data_mut().memory.replace(memory);
        if let Some(old) = old {
            old.free(self);
        }
        let entry = elf.entry;
        let tf = proc.trap_frame_mut();
        tf.eip = entry;
        tf.esp = sp as u32;
        Ok(0)
    }
}
