//! Page-fault delivery.
//!
//! When the simulated MMU cannot complete a user access, it raises a page
//! fault. exos does not resolve faults itself: it hands them to the
//! environment's page-fault upcall, running on the environment's exception
//! stack, the one page right below [`UXSTACKTOP`].
//!
//! Delivery proceeds as follows:
//!
//! 1. If the environment has no upcall, it is destroyed.
//! 2. If the environment is already running its upcall, the fault is a
//!    recursive one and the environment is destroyed.
//! 3. If the exception stack page is not mapped user-writable, the
//!    environment is destroyed.
//! 4. Otherwise the kernel writes a [`UTrapframe`] at the top of the
//!    exception stack, counts the fault, and calls the upcall. When the
//!    upcall returns, the faulting access is retried once. A fault that
//!    persists after the upcall returned is fatal.
use crate::{
    addressing::{PAGE_SIZE, Va},
    memlayout::UXSTACKTOP,
    mm::{Page, page_table::PteFlags},
    syscall::UserEnv,
};
use abyss::{PFErrorCode, UTrapframe};
use std::sync::atomic::Ordering;

impl UserEnv<'_> {
    /// Translate a user access to the page holding `va`.
    ///
    /// On success the accessed bit, and for a write the dirty bit, is set on
    /// the mapping. On failure the error code of the page fault the access
    /// raises is returned.
    pub(crate) fn translate(&self, va: Va, write: bool) -> Result<Page, PFErrorCode> {
        let mut err = PFErrorCode::USER;
        if write {
            err |= PFErrorCode::WRITE_ACCESS;
        }
        let env = self.current();
        let mut pt = env.page_table.lock();
        let result = match pt.walk(va.page_down()) {
            Ok((page, flags)) => {
                if !flags.contains(PteFlags::U) || (write && !flags.contains(PteFlags::W)) {
                    Err(err | PFErrorCode::PRESENT)
                } else {
                    let mut mark = PteFlags::A;
                    if write {
                        mark |= PteFlags::D;
                    }
                    pt.mark(va, mark);
                    Ok(page)
                }
            }
            Err(_) => Err(err),
        };
        pt.unlock();
        result
    }

    /// Run the access `f` against the page holding `va`, delivering a page
    /// fault to the upcall if the access faults.
    pub(crate) fn with_page<R>(&self, va: Va, write: bool, f: impl FnOnce(&Page) -> R) -> R {
        let err = match self.translate(va, write) {
            Ok(page) => return f(&page),
            Err(err) => err,
        };
        self.page_fault(va, err);
        match self.translate(va, write) {
            Ok(page) => f(&page),
            Err(_) => {
                warning!(
                    "[{}] page fault at {} persists after the upcall returned",
                    self.sys_getenvid(),
                    va
                );
                self.exit(-1)
            }
        }
    }

    /// Deliver a page fault at `va` to the environment's upcall.
    ///
    /// Returns once the upcall returns. Does not return if the fault cannot
    /// be delivered.
    fn page_fault(&self, va: Va, err: PFErrorCode) {
        let env = self.current();
        let Some(upcall) = env.upcall() else {
            warning!(
                "[{}] user fault va {} err {:?} with no handler",
                env.id,
                va,
                err
            );
            self.exit(-1)
        };
        if env.in_upcall.swap(true, Ordering::SeqCst) {
            warning!("[{}] recursive user fault va {} err {:?}", env.id, va, err);
            self.exit(-1)
        }

        let xstack = Va::new(UXSTACKTOP - PAGE_SIZE).map(|xs| {
            let pt = env.page_table.lock();
            let pte = pt.pte(xs);
            let page = pt.walk(xs).ok().map(|(page, _)| page);
            pt.unlock();
            (pte, page)
        });
        let stack = match xstack {
            Some((pte, Some(page)))
                if pte.flags().contains(PteFlags::P | PteFlags::U | PteFlags::W) =>
            {
                page
            }
            _ => {
                warning!(
                    "[{}] user_mem_check assertion failure for va {:08x}",
                    env.id,
                    UXSTACKTOP - UTrapframe::SIZE
                );
                self.exit(-1)
            }
        };

        let utf = UTrapframe {
            fault_va: va.into_usize(),
            err,
        };
        stack.write(PAGE_SIZE - UTrapframe::SIZE, &utf.to_bytes());
        drop(stack);
        env.count_pgfault();
        drop(env);

        upcall(self, &utf);

        self.current().in_upcall.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        EnvId, KernelBuilder,
        addressing::{PAGE_SIZE, Va},
        memlayout::{UTEXT, UXSTACKTOP},
        mm::page_table::PteFlags,
        syscall::UserEnv,
    };
    use abyss::UTrapframe;

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    const URW: PteFlags = PteFlags::from_bits_truncate(
        PteFlags::U.bits() | PteFlags::W.bits() | PteFlags::P.bits(),
    );

    fn map_on_fault(env: &UserEnv<'_>, utf: &UTrapframe) {
        let addr = Va::new(utf.fault_va).unwrap().page_down();
        env.sys_page_alloc(EnvId::SELF, addr, URW).unwrap();
    }

    fn ignore_fault(_env: &UserEnv<'_>, _utf: &UTrapframe) {}

    #[test]
    fn fault_without_handler_kills() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            env.write_u32(va(UTEXT), 1);
            0
        });
        assert_eq!(code, -1);
    }

    #[test]
    fn fault_without_xstack_kills() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            env.sys_env_set_pgfault_upcall(EnvId::SELF, map_on_fault)
                .unwrap();
            env.write_u32(va(UTEXT), 1);
            0
        });
        assert_eq!(code, -1);
    }

    #[test]
    fn upcall_resolves_fault() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            env.sys_page_alloc(EnvId::SELF, va(UXSTACKTOP - PAGE_SIZE), URW)
                .unwrap();
            env.sys_env_set_pgfault_upcall(EnvId::SELF, map_on_fault)
                .unwrap();
            env.write_u32(va(UTEXT + 0x10), 0xdead_beef);
            assert_eq!(env.read_u32(va(UTEXT + 0x10)), 0xdead_beef);
            assert_eq!(env.thisenv().pgfaults, 1);

            // The fault record sits at the top of the exception stack.
            let mut raw = [0; UTrapframe::SIZE];
            env.read(va(UXSTACKTOP - UTrapframe::SIZE), &mut raw);
            let utf = UTrapframe::from_bytes(&raw);
            assert_eq!(utf.fault_va, UTEXT + 0x10);
            assert!(utf.is_write());
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn unresolved_fault_kills() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            env.sys_page_alloc(EnvId::SELF, va(UXSTACKTOP - PAGE_SIZE), URW)
                .unwrap();
            env.sys_env_set_pgfault_upcall(EnvId::SELF, ignore_fault)
                .unwrap();
            env.read_u32(va(UTEXT));
            0
        });
        assert_eq!(code, -1);
    }

    #[test]
    fn accessed_and_dirty_bits() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            env.sys_page_alloc(EnvId::SELF, va(UTEXT), URW).unwrap();
            let pn = UTEXT >> 12;
            assert!(!env.uvpt(pn).flags().intersects(PteFlags::A | PteFlags::D));
            env.read_u32(va(UTEXT));
            assert!(env.uvpt(pn).flags().contains(PteFlags::A));
            assert!(!env.uvpt(pn).flags().contains(PteFlags::D));
            env.write_u32(va(UTEXT), 3);
            assert!(env.uvpt(pn).flags().contains(PteFlags::D));
            0
        });
        assert_eq!(code, 0);
    }
}
