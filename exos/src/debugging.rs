//! Inspection of environments from outside.
//!
//! These helpers read an environment's page table and memory with the
//! kernel's view: they bypass the MMU, so they never fault and never set the
//! accessed or dirty bits. Errors in the request are reported as
//! [`KernelError`]s and never affect the inspected environment.
//!
//! ## Example: checking both sides of a fork
//!
//! ```
//! use exos::{EnvId, KernelBuilder, addressing::Va, memlayout::UTEXT,
//!            mm::page_table::PteFlags};
//!
//! let kernel = KernelBuilder::new().quiet(true).build();
//! let code = kernel.boot(|env| {
//!     let va = Va::new(UTEXT).unwrap();
//!     let urp = PteFlags::U | PteFlags::P;
//!     env.sys_page_alloc(EnvId::SELF, va, urp).unwrap();
//!     let child = env.sys_exofork(|_| 0).unwrap();
//!     env.sys_page_map(EnvId::SELF, va, child, va, urp).unwrap();
//!
//!     let parent = env.kernel().mappings(env.sys_getenvid(), va..va + 0x1000).unwrap();
//!     let child = env.kernel().mappings(child, va..va + 0x1000).unwrap();
//!     assert_eq!(parent[0].pa, child[0].pa);
//!     0
//! });
//! assert_eq!(code, 0);
//! ```
//!
//! ## Logging
//!
//! The kernel reports environment creation and teardown, and every fatal
//! fault, with `info!` and `warning!`. Pass `quiet(true)` to
//! [`KernelBuilder`](crate::KernelBuilder) to silence them.
use crate::{
    Kernel, KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    env::EnvId,
    mm::page_table::{Pte, PteFlags},
};
use core::ops::Range;

/// A single page mapping of an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// The virtual address of the page.
    pub va: Va,
    /// The physical address of the frame.
    pub pa: Pa,
    /// The flags of the mapping.
    pub flags: PteFlags,
}

impl core::fmt::Display for Mapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "virtual address {}: physical address {}; permissions: 0x{:03x}",
            self.va,
            self.pa,
            self.flags.bits()
        )
    }
}

impl Kernel {
    /// Read the page table entry of `id` that translates `va`.
    pub fn pte(&self, id: EnvId, va: Va) -> Result<Pte, KernelError> {
        let env = self.lookup(id).ok_or(KernelError::BadEnv)?;
        let pt = env.page_table.lock();
        let pte = pt.pte(va.page_down());
        pt.unlock();
        Ok(pte)
    }

    /// List the mappings of `id` whose page overlaps `range`.
    pub fn mappings(&self, id: EnvId, range: Range<Va>) -> Result<Vec<Mapping>, KernelError> {
        if range.start > range.end {
            return Err(KernelError::InvalidArgument);
        }
        let env = self.lookup(id).ok_or(KernelError::BadEnv)?;
        let start = range.start.page_down();
        let pt = env.page_table.lock();
        let out = pt
            .iter()
            .filter(|(va, _)| *va >= start && *va < range.end)
            .filter_map(|(va, pte)| {
                Some(Mapping {
                    va,
                    pa: pte.pa()?,
                    flags: pte.flags(),
                })
            })
            .collect();
        pt.unlock();
        Ok(out)
    }

    /// Copy the bytes of `range` out of the address space of `id`.
    ///
    /// Fails with [`KernelError::Fault`] if any page of the range is not
    /// mapped.
    pub fn dump_mem(&self, id: EnvId, range: Range<Va>) -> Result<Vec<u8>, KernelError> {
        if range.start > range.end {
            return Err(KernelError::InvalidArgument);
        }
        let env = self.lookup(id).ok_or(KernelError::BadEnv)?;
        let mut out = vec![0; range.end - range.start];
        let mut at = range.start;
        let pt = env.page_table.lock();
        let result = loop {
            if at >= range.end {
                break Ok(());
            }
            let n = (PAGE_SIZE - at.offset()).min(range.end - at);
            match pt.walk(at.page_down()) {
                Ok((page, _)) => {
                    let ofs = at - range.start;
                    page.read(at.offset(), &mut out[ofs..ofs + n]);
                }
                Err(_) => break Err(KernelError::Fault),
            }
            at += n;
        };
        pt.unlock();
        result.map(|_| out)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        EnvId, KernelBuilder, KernelError,
        addressing::{PAGE_SIZE, Va},
        memlayout::UTEXT,
        mm::page_table::PteFlags,
    };

    #[test]
    fn inspect_memory() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            let base = Va::new(UTEXT).unwrap();
            env.sys_page_alloc(EnvId::SELF, base, PteFlags::U | PteFlags::W | PteFlags::P)
                .unwrap();
            env.write(base + PAGE_SIZE - 2, &[1, 2]);
            let me = env.sys_getenvid();
            let kernel = env.kernel();

            assert_eq!(
                kernel.dump_mem(me, base + PAGE_SIZE - 2..base + PAGE_SIZE).unwrap(),
                [1, 2]
            );
            assert_eq!(
                kernel.dump_mem(me, base..base + PAGE_SIZE + 1),
                Err(KernelError::Fault)
            );
            assert_eq!(
                kernel.dump_mem(me, base + 1..base),
                Err(KernelError::InvalidArgument)
            );

            let maps = kernel.mappings(me, base + 0x10..base + 2 * PAGE_SIZE).unwrap();
            assert_eq!(maps.len(), 1);
            assert_eq!(maps[0].va, base);
            assert!(maps[0].flags.contains(PteFlags::D));
            assert_eq!(kernel.mappings(EnvId::from_raw(0x5000), base..base), Err(KernelError::BadEnv));
            0
        });
        assert_eq!(code, 0);
    }
}
