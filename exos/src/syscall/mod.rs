//! System call infrastructure.
//!
//! User code reaches the kernel through a [`UserEnv`], the handle of the
//! environment it runs in. Every primitive the kernel offers is a method on
//! this handle:
//!
//! | System call                                | Effect                                            |
//! |--------------------------------------------|---------------------------------------------------|
//! | [`sys_getenvid`](UserEnv::sys_getenvid)     | id of the caller                                  |
//! | [`sys_page_alloc`](UserEnv::sys_page_alloc) | map a fresh zeroed frame                          |
//! | [`sys_page_map`](UserEnv::sys_page_map)     | map a frame of one address space into another     |
//! | [`sys_page_unmap`](UserEnv::sys_page_unmap) | remove a mapping                                  |
//! | [`sys_exofork`](UserEnv::sys_exofork)       | create a child with an empty address space        |
//! | [`sys_env_set_status`](UserEnv::sys_env_set_status) | make an environment (not) runnable        |
//! | [`sys_env_set_pgfault_upcall`](UserEnv::sys_env_set_pgfault_upcall) | register a fault handler  |
//! | [`sys_env_destroy`](UserEnv::sys_env_destroy) | destroy an environment                          |
//! | [`sys_yield`](UserEnv::sys_yield)           | let other environments run                        |
//!
//! ## Permissions
//!
//! An environment id of [`EnvId::SELF`] names the caller. Every other id must
//! name the caller itself or one of its immediate children; otherwise the
//! call fails with [`KernelError::BadEnv`].
//!
//! A permission passed to the memory calls must contain [`PteFlags::U`] and
//! [`PteFlags::P`] and nothing outside [`PteFlags::SYSCALL`]. Addresses must be
//! page-aligned and below [`UTOP`](crate::memlayout::UTOP). Violations fail with
//! [`KernelError::InvalidArgument`].
//!
//! ## Error Handling via `Result` Type
//!
//! Errors incured by user **MUST NOT** stop the kernel. Every system call
//! returns `Result<_, KernelError>`; the raw interface ([`UserEnv::syscall`])
//! folds the error into its negative code.
use crate::{
    Kernel, KernelError,
    addressing::Va,
    env::{Entry, Env, EnvId, EnvInfo, EnvStatus, Upcall},
    memlayout::is_user_page,
    mm::{
        Page,
        page_table::{PageTable, Pde, Pte, PteFlags},
    },
};
use std::sync::Arc;

pub mod uaccess;

/// A system call number of the raw interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// `sys_getenvid()`
    GetEnvId = 0,
    /// `sys_page_alloc(envid, va, perm)`
    PageAlloc = 1,
    /// `sys_page_map(srcenvid, srcva, dstenvid, dstva, perm)`
    PageMap = 2,
    /// `sys_page_unmap(envid, va)`
    PageUnmap = 3,
    /// `sys_env_set_status(envid, status)`
    EnvSetStatus = 4,
    /// `sys_env_destroy(envid)`
    EnvDestroy = 5,
    /// `sys_yield()`
    Yield = 6,
}

/// A struct representing the system call ABI (Application Binary Interface).
///
/// It stores the system call number and up to five arguments, each of the
/// machine word size. Environment ids travel as their raw `i32` encoding,
/// permissions as raw [`PteFlags`] bits and statuses as raw [`EnvStatus`]
/// values.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallAbi {
    /// The system call number that identifies the requested system service.
    pub sysno: usize,
    /// First argument for the system call.
    pub arg1: usize,
    /// Second argument for the system call.
    pub arg2: usize,
    /// Third argument for the system call.
    pub arg3: usize,
    /// Fourth argument for the system call.
    pub arg4: usize,
    /// Fifth argument for the system call.
    pub arg5: usize,
}

impl SyscallAbi {
    /// Build a request for `sysno` with `args`.
    pub fn new(sysno: SyscallNumber, args: &[usize]) -> Self {
        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        SyscallAbi {
            sysno: sysno as usize,
            arg1: arg(0),
            arg2: arg(1),
            arg3: arg(2),
            arg4: arg(3),
            arg5: arg(4),
        }
    }
}

fn raw_va(arg: usize) -> Result<Va, KernelError> {
    Va::new(arg).ok_or(KernelError::InvalidArgument)
}

fn raw_perm(arg: usize) -> Result<PteFlags, KernelError> {
    PteFlags::from_bits(arg).ok_or(KernelError::InvalidArgument)
}

fn raw_envid(arg: usize) -> EnvId {
    EnvId::from_raw(arg as u32 as i32)
}

fn check_va(va: Va) -> Result<(), KernelError> {
    if is_user_page(va) {
        Ok(())
    } else {
        Err(KernelError::InvalidArgument)
    }
}

fn check_perm(perm: PteFlags) -> Result<(), KernelError> {
    if perm.contains(PteFlags::U | PteFlags::P) && PteFlags::SYSCALL.contains(perm) {
        Ok(())
    } else {
        Err(KernelError::InvalidArgument)
    }
}

/// Find the page to share out of `src` for a `sys_page_map`.
fn source_page(src: &PageTable, srcva: Va, perm: PteFlags) -> Result<Page, KernelError> {
    let (page, flags) = src.walk(srcva)?;
    if !flags.contains(PteFlags::U) {
        return Err(KernelError::InvalidArgument);
    }
    if perm.contains(PteFlags::W) && !flags.contains(PteFlags::W) {
        return Err(KernelError::InvalidArgument);
    }
    Ok(page)
}

/// The handle through which user code talks to the kernel.
///
/// A [`UserEnv`] is handed to the entry of every environment and to its
/// page-fault upcall. It identifies the calling environment; all system
/// calls are performed on behalf of it.
#[derive(Clone, Copy)]
pub struct UserEnv<'k> {
    kernel: &'k Kernel,
    id: EnvId,
}

impl core::fmt::Debug for UserEnv<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "UserEnv({})", self.id)
    }
}

impl<'k> UserEnv<'k> {
    pub(crate) fn new(kernel: &'k Kernel, id: EnvId) -> Self {
        UserEnv { kernel, id }
    }

    /// The kernel this environment runs on.
    ///
    /// Meant for inspection (see [`crate::debugging`]); user code changes
    /// its address space only through system calls.
    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    /// The environment of the caller.
    ///
    /// An environment that has been torn down while still running cannot
    /// continue; it exits.
    pub(crate) fn current(&self) -> Arc<Env> {
        match self.kernel.lookup(self.id) {
            Some(env) => env,
            None => self.exit(-1),
        }
    }

    /// Converts an envid to an env.
    ///
    /// If `checkperm` is set, the env must be the caller or its immediate
    /// child.
    fn envid2env(&self, id: EnvId, checkperm: bool) -> Result<Arc<Env>, KernelError> {
        if id == EnvId::SELF {
            return Ok(self.current());
        }
        let env = self.kernel.lookup(id).ok_or(KernelError::BadEnv)?;
        if env.status() == EnvStatus::Free {
            return Err(KernelError::BadEnv);
        }
        if checkperm && env.id != self.id && env.parent_id != self.id {
            return Err(KernelError::BadEnv);
        }
        Ok(env)
    }

    /// The snapshot of the caller (`thisenv`).
    pub fn thisenv(&self) -> EnvInfo {
        self.current().info()
    }

    /// The snapshot of any live environment (`envs[ENVX(id)]`).
    pub fn envs(&self, id: EnvId) -> Option<EnvInfo> {
        self.kernel.env_info(id)
    }

    /// Read the caller's page table entry for page number `pn` (`uvpt[pn]`).
    ///
    /// Returns an empty entry for a page number outside the address space.
    pub fn uvpt(&self, pn: usize) -> Pte {
        let Some(va) = Va::from_page_number(pn) else {
            return Pte::EMPTY;
        };
        let env = self.current();
        let pt = env.page_table.lock();
        let pte = pt.pte(va);
        pt.unlock();
        pte
    }

    /// Read the caller's page directory entry at `pdx` (`uvpd[pdx]`).
    pub fn uvpd(&self, pdx: usize) -> Pde {
        let env = self.current();
        let pt = env.page_table.lock();
        let pde = pt.pde(pdx);
        pt.unlock();
        pde
    }

    /// Returns the id of the caller.
    pub fn sys_getenvid(&self) -> EnvId {
        self.id
    }

    /// Allocate a zero-filled page and map it at `va` of `envid` with `perm`.
    ///
    /// A page already mapped at `va` is unmapped as a side effect.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `envid` is not the caller or its child.
    /// - [`KernelError::InvalidArgument`] on a bad address or permission.
    /// - [`KernelError::NoMemory`] if no frame is left for the page or its
    ///   page table.
    #[track_caller]
    pub fn sys_page_alloc(&self, envid: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError> {
        let env = self.envid2env(envid, true)?;
        check_va(va)?;
        check_perm(perm)?;
        let page = Page::new(self.kernel.frame_pool())?;
        let mut pt = env.page_table.lock();
        let result = pt.map(va, page, perm);
        pt.unlock();
        result?;
        Ok(())
    }

    /// Map the page at `srcva` of `srcenvid` at `dstva` of `dstenvid` with
    /// `perm`.
    ///
    /// Afterwards both addresses name the same frame. A page already mapped
    /// at `dstva` is unmapped as a side effect.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if either env is not the caller or its child.
    /// - [`KernelError::InvalidArgument`] on a bad address or permission, if
    ///   nothing is mapped at `srcva`, or if `perm` asks for write access to
    ///   a read-only source.
    /// - [`KernelError::NoMemory`] if a page table could not be allocated.
    pub fn sys_page_map(
        &self,
        srcenvid: EnvId,
        srcva: Va,
        dstenvid: EnvId,
        dstva: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let src = self.envid2env(srcenvid, true)?;
        let dst = self.envid2env(dstenvid, true)?;
        check_va(srcva)?;
        check_va(dstva)?;
        check_perm(perm)?;

        let result = if Arc::ptr_eq(&src, &dst) {
            let mut pt = src.page_table.lock();
            let result = source_page(&pt, srcva, perm)
                .and_then(|page| pt.map(dstva, page, perm).map_err(KernelError::from));
            pt.unlock();
            result
        } else {
            // Both tables are locked in id order.
            let src_first = src.id < dst.id;
            let (first, second) = if src_first { (&src, &dst) } else { (&dst, &src) };
            let mut first = first.page_table.lock();
            let mut second = second.page_table.lock();
            let (spt, dpt) = if src_first {
                (&mut first, &mut second)
            } else {
                (&mut second, &mut first)
            };
            let result = source_page(spt, srcva, perm)
                .and_then(|page| dpt.map(dstva, page, perm).map_err(KernelError::from));
            second.unlock();
            first.unlock();
            result
        };
        result.map(|_| ())
    }

    /// Unmap the page at `va` of `envid`.
    ///
    /// Unmapping an address where nothing is mapped silently succeeds.
    pub fn sys_page_unmap(&self, envid: EnvId, va: Va) -> Result<(), KernelError> {
        let env = self.envid2env(envid, true)?;
        check_va(va)?;
        let mut pt = env.page_table.lock();
        let page = pt.unmap(va).ok();
        pt.unlock();
        drop(page);
        Ok(())
    }

    /// Create a child environment with an empty address space.
    ///
    /// The child is not runnable until its parent marks it so with
    /// [`sys_env_set_status`](Self::sys_env_set_status). Once scheduled, it
    /// runs `entry` with its own handle; the value `entry` returns becomes
    /// the child's exit code.
    ///
    /// # Errors
    /// - [`KernelError::NoFreeEnv`] if the environment table is full.
    /// - [`KernelError::NoMemory`] if the kernel is out of memory.
    pub fn sys_exofork<F>(&self, entry: F) -> Result<EnvId, KernelError>
    where
        F: FnOnce(&UserEnv<'_>) -> i32 + Send + 'static,
    {
        let parent = self.current();
        let child = self.kernel.alloc_env(parent.id, Box::new(entry) as Entry)?;
        Ok(child)
    }

    /// Set the status of `envid` to [`EnvStatus::Runnable`] or
    /// [`EnvStatus::NotRunnable`].
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `envid` is not the caller or its child.
    /// - [`KernelError::InvalidArgument`] for any other status, or if a
    ///   running environment asks to become [`EnvStatus::NotRunnable`]. A
    ///   running environment cannot be suspended; marking it
    ///   [`EnvStatus::Runnable`] has no effect.
    pub fn sys_env_set_status(&self, envid: EnvId, status: EnvStatus) -> Result<(), KernelError> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(KernelError::InvalidArgument);
        }
        let env = self.envid2env(envid, true)?;
        if env.status() == EnvStatus::Running {
            return match status {
                EnvStatus::NotRunnable => Err(KernelError::InvalidArgument),
                _ => Ok(()),
            };
        }
        if env.set_status(status) == EnvStatus::NotRunnable && status == EnvStatus::Runnable {
            self.kernel.enqueue(env.id);
        }
        Ok(())
    }

    /// Register `upcall` as the page-fault handler of `envid`.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `envid` is not the caller or its child.
    pub fn sys_env_set_pgfault_upcall(&self, envid: EnvId, upcall: Upcall) -> Result<(), KernelError> {
        let env = self.envid2env(envid, true)?;
        env.set_upcall(upcall);
        Ok(())
    }

    /// Destroy `envid` and free its address space.
    ///
    /// Destroying the caller does not return.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `envid` is not the caller or its child.
    pub fn sys_env_destroy(&self, envid: EnvId) -> Result<(), KernelError> {
        let env = self.envid2env(envid, true)?;
        if env.id == self.id {
            info!("[{}] exiting gracefully", self.id);
            self.exit(-1);
        }
        info!("[{}] destroying {}", self.id, env.id);
        self.kernel.free_env(env.id, -1);
        Ok(())
    }

    /// Let every other runnable environment run before returning.
    pub fn sys_yield(&self) {
        self.kernel.run();
    }

    /// Issue a system call through the raw interface.
    ///
    /// Returns the non-negative result on success and the negative
    /// [`KernelError`] code on failure. [`sys_exofork`](Self::sys_exofork)
    /// and [`sys_env_set_pgfault_upcall`](Self::sys_env_set_pgfault_upcall)
    /// take code as an argument and are only available as methods.
    pub fn syscall(&self, abi: &SyscallAbi) -> isize {
        match self.dispatch(abi) {
            Ok(v) => v as isize,
            Err(e) => e.into_isize(),
        }
    }

    fn dispatch(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let sysno =
            SyscallNumber::try_from(abi.sysno).map_err(|_| KernelError::InvalidArgument)?;
        match sysno {
            SyscallNumber::GetEnvId => Ok(self.sys_getenvid().into_raw() as u32 as usize),
            SyscallNumber::PageAlloc => self
                .sys_page_alloc(raw_envid(abi.arg1), raw_va(abi.arg2)?, raw_perm(abi.arg3)?)
                .map(|_| 0),
            SyscallNumber::PageMap => self
                .sys_page_map(
                    raw_envid(abi.arg1),
                    raw_va(abi.arg2)?,
                    raw_envid(abi.arg3),
                    raw_va(abi.arg4)?,
                    raw_perm(abi.arg5)?,
                )
                .map(|_| 0),
            SyscallNumber::PageUnmap => self
                .sys_page_unmap(raw_envid(abi.arg1), raw_va(abi.arg2)?)
                .map(|_| 0),
            SyscallNumber::EnvSetStatus => {
                let status =
                    EnvStatus::try_from(abi.arg2).map_err(|_| KernelError::InvalidArgument)?;
                self.sys_env_set_status(raw_envid(abi.arg1), status)
                    .map(|_| 0)
            }
            SyscallNumber::EnvDestroy => self.sys_env_destroy(raw_envid(abi.arg1)).map(|_| 0),
            SyscallNumber::Yield => {
                self.sys_yield();
                Ok(0)
            }
        }
    }
}

impl Kernel {
    pub(crate) fn alloc_env(&self, parent_id: EnvId, entry: Entry) -> Result<EnvId, KernelError> {
        let mut envs = self.envs.lock();
        let env = envs.alloc(parent_id, &self.pool, entry);
        envs.unlock();
        let env = env.ok_or(KernelError::NoFreeEnv)?;
        info!("[{}] new env {}", parent_id, env.id);
        Ok(env.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        KernelBuilder,
        memlayout::{UTEXT, UTOP},
    };

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    const URW: PteFlags = PteFlags::from_bits_truncate(
        PteFlags::U.bits() | PteFlags::W.bits() | PteFlags::P.bits(),
    );

    #[test]
    fn page_alloc_validation() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            assert_eq!(
                env.sys_page_alloc(EnvId::SELF, va(UTEXT + 1), URW),
                Err(KernelError::InvalidArgument)
            );
            assert_eq!(
                env.sys_page_alloc(EnvId::SELF, va(UTOP), URW),
                Err(KernelError::InvalidArgument)
            );
            assert_eq!(
                env.sys_page_alloc(EnvId::SELF, va(UTEXT), PteFlags::P | PteFlags::W),
                Err(KernelError::InvalidArgument)
            );
            assert_eq!(
                env.sys_page_alloc(EnvId::SELF, va(UTEXT), URW | PteFlags::D),
                Err(KernelError::InvalidArgument)
            );
            assert_eq!(
                env.sys_page_alloc(EnvId::from_raw(0x7fff_f000), va(UTEXT), URW),
                Err(KernelError::BadEnv)
            );
            env.sys_page_alloc(EnvId::SELF, va(UTEXT), URW).unwrap();
            assert_eq!(env.uvpt(UTEXT >> 12).flags(), URW);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn page_map_shares_frame() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            env.sys_page_alloc(EnvId::SELF, va(UTEXT), PteFlags::U | PteFlags::P)
                .unwrap();
            // Cannot upgrade a read-only page.
            assert_eq!(
                env.sys_page_map(EnvId::SELF, va(UTEXT), EnvId::SELF, va(UTEXT + 0x1000), URW),
                Err(KernelError::InvalidArgument)
            );
            assert_eq!(
                env.sys_page_map(EnvId::SELF, va(UTEXT + 0x1000), EnvId::SELF, va(UTEXT), URW),
                Err(KernelError::InvalidArgument)
            );
            let child = env.sys_exofork(|_| 0).unwrap();
            env.sys_page_map(EnvId::SELF, va(UTEXT), child, va(UTEXT), PteFlags::U | PteFlags::P)
                .unwrap();
            let mine = env.uvpt(UTEXT >> 12);
            let theirs = env.kernel().pte(child, va(UTEXT)).unwrap();
            assert_eq!(mine.pa(), theirs.pa());
            env.sys_page_unmap(EnvId::SELF, va(UTEXT)).unwrap();
            env.sys_page_unmap(EnvId::SELF, va(UTEXT)).unwrap();
            assert!(!env.uvpt(UTEXT >> 12).is_present());
            assert!(env.kernel().pte(child, va(UTEXT)).unwrap().is_present());
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn only_children_are_reachable() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            let sibling = Arc::new(std::sync::atomic::AtomicI32::new(0));
            let seen = sibling.clone();
            let parent = env.sys_getenvid();
            let child = env
                .sys_exofork(move |env| {
                    let sibling = EnvId::from_raw(seen.load(std::sync::atomic::Ordering::SeqCst));
                    let denied = env.sys_page_alloc(sibling, va(UTEXT), URW) == Err(KernelError::BadEnv)
                        && env.sys_env_destroy(sibling) == Err(KernelError::BadEnv)
                        && env.sys_env_destroy(parent) == Err(KernelError::BadEnv);
                    if denied { 0 } else { 1 }
                })
                .unwrap();
            let other = env.sys_exofork(|_| 7).unwrap();
            sibling.store(other.into_raw(), std::sync::atomic::Ordering::SeqCst);
            assert_eq!(env.envs(child).unwrap().parent_id, parent);
            assert_eq!(env.envs(child).unwrap().status, EnvStatus::NotRunnable);
            assert_eq!(
                env.sys_env_set_status(child, EnvStatus::Dying),
                Err(KernelError::InvalidArgument)
            );
            env.sys_env_set_status(child, EnvStatus::Runnable).unwrap();
            env.sys_yield();
            assert_eq!(env.kernel().exit_code(child), Some(0));

            env.sys_env_destroy(other).unwrap();
            assert!(env.envs(other).is_none());
            assert_eq!(env.kernel().exit_code(other), Some(-1));
            assert_eq!(env.sys_env_destroy(other), Err(KernelError::BadEnv));
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn running_env_cannot_suspend_itself() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            assert_eq!(
                env.sys_env_set_status(EnvId::SELF, EnvStatus::NotRunnable),
                Err(KernelError::InvalidArgument)
            );
            env.sys_env_set_status(EnvId::SELF, EnvStatus::Runnable).unwrap();
            assert_eq!(env.thisenv().status, EnvStatus::Running);

            // A child that is not running yet can be toggled freely.
            let child = env.sys_exofork(|_| 5).unwrap();
            env.sys_env_set_status(child, EnvStatus::Runnable).unwrap();
            env.sys_env_set_status(child, EnvStatus::NotRunnable).unwrap();
            assert_eq!(env.envs(child).unwrap().status, EnvStatus::NotRunnable);
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn raw_interface() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            let id = env.syscall(&SyscallAbi::new(SyscallNumber::GetEnvId, &[]));
            assert_eq!(id as i32, env.sys_getenvid().into_raw());
            let perm = URW.bits();
            assert_eq!(
                env.syscall(&SyscallAbi::new(SyscallNumber::PageAlloc, &[0, UTEXT, perm])),
                0
            );
            assert_eq!(
                env.syscall(&SyscallAbi::new(SyscallNumber::PageAlloc, &[0, UTEXT, 1 << 20])),
                -3
            );
            assert_eq!(
                env.syscall(&SyscallAbi {
                    sysno: 99,
                    ..Default::default()
                }),
                -3
            );
            assert_eq!(
                env.syscall(&SyscallAbi::new(SyscallNumber::EnvSetStatus, &[0x1234, 2])),
                -2
            );
            0
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn out_of_envs() {
        let kernel = KernelBuilder::new().max_envs(2).quiet(true).build();
        let code = kernel.boot(|env| {
            let child = env.sys_exofork(|_| 0).unwrap();
            assert_eq!(env.sys_exofork(|_| 0), Err(KernelError::NoFreeEnv));
            env.sys_env_destroy(child).unwrap();
            assert!(env.sys_exofork(|_| 0).is_ok());
            0
        });
        assert_eq!(code, 0);
    }
}
