//! Copy-on-write `fork` and its share-everything sibling `sfork`.
//!
//! ## Duplicating an address space
//!
//! [`fork`] creates an empty child with [`sys_exofork`] and then walks the
//! caller's user region, `[UTEXT, USTACKTOP)`, in ascending page order.
//! Every page that is present and user-accessible is handed to [`duppage`],
//! which installs it in the child following its [`DupPolicy`]. Page tables
//! that are not present are skipped as a whole.
//!
//! The exception stack lies above [`USTACKTOP`] and is never visited: the
//! child gets a fresh, private one. A fault taken while the exception stack
//! itself is copy-on-write could not be delivered.
//!
//! ## Resolving a copy-on-write fault
//!
//! [`pgfault`] is installed as the upcall of both the parent and the child.
//! For a write to a copy-on-write page it
//!
//! 1. allocates a fresh page at [`PFTEMP`],
//! 2. copies the faulting page into it,
//! 3. maps the copy writable at the faulting address, replacing the shared
//!    frame, and
//! 4. unmaps [`PFTEMP`].
//!
//! The shared frame is never written, so the other owner keeps seeing the
//! old contents. Until step 3 the faulting address still maps the shared
//! frame, so a failure in between leaves no half-copied page visible.
//!
//! Any other fault is a bug in the program and terminates the environment.
//!
//! [`sys_exofork`]: exos::UserEnv::sys_exofork
use crate::{
    perm::{COW_PERM, DupPolicy, PRIVATE_PERM, is_user_present},
    pgfault::{UXSTACK, set_pgfault_handler},
};
use exos::{
    EnvId, EnvStatus, KernelError, UTrapframe, UserEnv,
    addressing::{NPTENTRIES, PAGE_SIZE, Va},
    memlayout::{PFTEMP, USTACKTOP, UTEXT},
    mm::page_table::PteFlags,
};

/// How [`real_fork`] carries the address space into the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkMode {
    /// Writable pages become copy-on-write in both environments.
    CopyOnWrite,
    /// Every page below the normal stack is shared with its permissions
    /// unchanged; only the stack page is copy-on-write.
    ShareBelowStack,
}

/// A broken invariant found while duplicating or while resolving a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// A page fault that was not caused by a write.
    NotWriteFault,
    /// A write fault on a page that is not copy-on-write.
    NotCopyOnWrite,
    /// A page to duplicate that is not present or not user-accessible.
    NotUserPresent,
}

/// Error of a fork or of the fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// The program broke an invariant. Never retried; the environment is
    /// terminated at the outermost boundary.
    Fatal(Violation),
    /// The kernel refused a request.
    Kernel(KernelError),
}

impl From<KernelError> for ForkError {
    fn from(e: KernelError) -> Self {
        ForkError::Kernel(e)
    }
}

impl core::fmt::Display for ForkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ForkError::Fatal(Violation::NotWriteFault) => write!(f, "faulting access is not a write"),
            ForkError::Fatal(Violation::NotCopyOnWrite) => {
                write!(f, "faulting page is not copy-on-write")
            }
            ForkError::Fatal(Violation::NotUserPresent) => {
                write!(f, "page is not present or not user-accessible")
            }
            ForkError::Kernel(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ForkError {}

/// Resolve the page fault described by `utf` for the calling environment.
///
/// The fault must be a write to a copy-on-write page. On success the page at
/// the faulting address is a private, writable copy.
pub fn handle_cow_fault(env: &UserEnv<'_>, utf: &UTrapframe) -> Result<(), ForkError> {
    if !utf.is_write() {
        return Err(ForkError::Fatal(Violation::NotWriteFault));
    }
    let va = Va::new(utf.fault_va)
        .ok_or(ForkError::Kernel(KernelError::InvalidArgument))?
        .page_down();
    let cow = is_user_present(env.uvpd(va.pdx()).flags())
        && env.uvpt(va.page_number()).flags().contains(PteFlags::COW);
    if !cow {
        return Err(ForkError::Fatal(Violation::NotCopyOnWrite));
    }

    let scratch = Va::new(PFTEMP).ok_or(ForkError::Kernel(KernelError::InvalidArgument))?;
    env.sys_page_alloc(EnvId::SELF, scratch, PRIVATE_PERM)?;
    env.copy_page(scratch, va);
    env.sys_page_map(EnvId::SELF, scratch, EnvId::SELF, va, PRIVATE_PERM)?;
    env.sys_page_unmap(EnvId::SELF, scratch)?;
    Ok(())
}

/// The page fault upcall installed by [`fork`] and [`sfork`].
///
/// Terminates the environment if the fault cannot be resolved.
pub fn pgfault(env: &UserEnv<'_>, utf: &UTrapframe) {
    if let Err(e) = handle_cow_fault(env, utf) {
        env.panic(format_args!(
            "pgfault: va {:08x} err {:?}: {}",
            utf.fault_va, utf.err, e
        ));
    }
}

/// Map page number `pn` of the calling environment into `child` following
/// `mode`.
///
/// For a copy-on-write page the child is mapped first and the caller's own
/// mapping is then downgraded to the same bits. A page that already was
/// copy-on-write is remapped too.
pub fn duppage(
    env: &UserEnv<'_>,
    child: EnvId,
    pn: usize,
    mode: ForkMode,
) -> Result<(), ForkError> {
    let flags = env.uvpt(pn).flags();
    let va = match Va::from_page_number(pn) {
        Some(va) if is_user_present(flags) => va,
        _ => return Err(ForkError::Fatal(Violation::NotUserPresent)),
    };
    let policy = DupPolicy::classify(flags, va, mode);
    env.sys_page_map(EnvId::SELF, va, child, va, policy.child_perm(flags))?;
    if policy == DupPolicy::CopyOnWrite {
        env.sys_page_map(EnvId::SELF, va, EnvId::SELF, va, COW_PERM)?;
    }
    Ok(())
}

/// Copy the address space of the caller into `child`.
fn populate(env: &UserEnv<'_>, child: EnvId, mode: ForkMode) -> Result<(), ForkError> {
    let mut pn = UTEXT / PAGE_SIZE;
    while pn < USTACKTOP / PAGE_SIZE {
        if !is_user_present(env.uvpd(pn / NPTENTRIES).flags()) {
            pn = (pn / NPTENTRIES + 1) * NPTENTRIES;
            continue;
        }
        if is_user_present(env.uvpt(pn).flags()) {
            duppage(env, child, pn, mode)?;
        }
        pn += 1;
    }

    env.sys_page_alloc(child, UXSTACK, PRIVATE_PERM)?;
    let upcall = env.thisenv().pgfault_upcall.unwrap_or(pgfault);
    env.sys_env_set_pgfault_upcall(child, upcall)?;
    env.sys_env_set_status(child, EnvStatus::Runnable)?;
    Ok(())
}

/// Duplicate the calling environment following `mode`.
///
/// The child runs `child` once scheduled; the caller gets the child's id.
/// If the duplication fails after the child was created, the child is
/// destroyed before the error is returned.
pub fn real_fork<F>(env: &UserEnv<'_>, mode: ForkMode, child: F) -> Result<EnvId, ForkError>
where
    F: FnOnce(&UserEnv<'_>) -> i32 + Send + 'static,
{
    set_pgfault_handler(env, pgfault)?;
    let id = env.sys_exofork(child)?;
    match populate(env, id, mode) {
        Ok(()) => Ok(id),
        Err(e) => {
            // The child never ran, so it is still ours to destroy.
            if let Err(destroy) = env.sys_env_destroy(id) {
                exos::warning!(
                    "[{}] fork: cannot destroy partial child {}: {}",
                    env.sys_getenvid(),
                    id,
                    destroy
                );
            }
            Err(e)
        }
    }
}

fn unwrap_fatal(env: &UserEnv<'_>, result: Result<EnvId, ForkError>) -> Result<EnvId, KernelError> {
    match result {
        Ok(id) => Ok(id),
        Err(ForkError::Kernel(e)) => Err(e),
        Err(e @ ForkError::Fatal(_)) => env.panic(format_args!("fork: {e}")),
    }
}

/// Duplicate the calling environment with copy-on-write.
///
/// Returns the id of the child, which starts in `child`. Fails with the
/// kernel's error if the child could not be built.
pub fn fork<F>(env: &UserEnv<'_>, child: F) -> Result<EnvId, KernelError>
where
    F: FnOnce(&UserEnv<'_>) -> i32 + Send + 'static,
{
    unwrap_fatal(env, real_fork(env, ForkMode::CopyOnWrite, child))
}

/// Duplicate the calling environment, sharing everything below the stack.
///
/// Memory below the normal stack page stays shared between the caller and
/// the child; only the stack is copy-on-write.
pub fn sfork<F>(env: &UserEnv<'_>, child: F) -> Result<EnvId, KernelError>
where
    F: FnOnce(&UserEnv<'_>) -> i32 + Send + 'static,
{
    unwrap_fatal(env, real_fork(env, ForkMode::ShareBelowStack, child))
}
