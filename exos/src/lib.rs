//! # exos: an exokernel for user-level virtual memory experiments
//!
//! **exos** is a small microkernel that exposes only primitive operations on
//! address spaces: allocate a physical page, map or unmap a page into an
//! address space, register a page-fault upcall, and change an environment's
//! scheduling status. Everything else, including `fork`, is built in user
//! space on top of these primitives (see the `ulib` crate).
//!
//! The kernel runs on a simulated 32-bit machine with a two-level page table.
//! User code is ordinary Rust that talks to the kernel exclusively through a
//! [`UserEnv`] handle: it issues system calls, reads its own page table
//! through the read-only [`UserEnv::uvpt`] window, and touches memory through
//! [`UserEnv::read`] and [`UserEnv::write`], which go through the simulated
//! MMU and raise page faults exactly where the hardware would.
//!
//! ## Environments
//!
//! An environment is a schedulable unit with its own address space. It is
//! created either by [`Kernel::spawn`] (an initial program) or by
//! [`UserEnv::sys_exofork`] (an empty child of the caller). Each environment
//! is single-threaded, and the scheduler is cooperative: an environment runs
//! until it returns from its entry, exits, is destroyed, or yields.
//!
//! ## Page faults
//!
//! A user access that violates the page table is turned into a fault record
//! ([`UTrapframe`]) that the kernel pushes onto the environment's exception
//! stack before calling the environment's registered upcall. When the upcall
//! returns, the access is retried. An environment without an upcall, without
//! a writable exception stack, or that faults while already handling a fault
//! is destroyed.
//!
//! ## Configuration
//!
//! A kernel is built with [`KernelBuilder`]:
//!
//! ```
//! use exos::KernelBuilder;
//!
//! let kernel = KernelBuilder::new().frames(256).max_envs(8).quiet(true).build();
//! assert_eq!(kernel.frames_in_use(), 0);
//! ```

#[macro_use]
extern crate abyss;

pub mod debugging;
pub mod env;
pub mod memlayout;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod trap;

pub use abyss::{addressing, debug, info, print, println, warning};
pub use abyss::{PFErrorCode, UTrapframe, spinlock};
pub use env::{EnvId, EnvInfo, EnvStatus, Upcall};
pub use syscall::UserEnv;

use abyss::spinlock::SpinLock;
use env::EnvTable;
use mm::FramePool;
use std::{collections::BTreeMap, sync::Arc};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant carries the stable negative code that the raw system call
/// interface returns for it.
#[derive(Debug, Eq, PartialEq, Clone, Copy, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(i32)]
pub enum KernelError {
    /// Unspecified or unknown problem.
    Unspecified = -1,
    /// Environment doesn't exist or otherwise cannot be used in requested
    /// action.
    BadEnv = -2,
    /// Invalid parameter.
    InvalidArgument = -3,
    /// Request failed due to memory shortage.
    NoMemory = -4,
    /// Attempt to create a new environment beyond the maximum allowed.
    NoFreeEnv = -5,
    /// Memory fault.
    Fault = -6,
}

impl KernelError {
    /// Converts the [`KernelError`] into its negative system call code.
    pub fn into_isize(self) -> isize {
        i32::from(self) as isize
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            KernelError::Unspecified => "unspecified error",
            KernelError::BadEnv => "bad environment",
            KernelError::InvalidArgument => "invalid parameter",
            KernelError::NoMemory => "out of memory",
            KernelError::NoFreeEnv => "out of environments",
            KernelError::Fault => "segmentation fault",
        })
    }
}

impl std::error::Error for KernelError {}

/// A builder for system configuration settings.
///
/// The [`KernelBuilder`] provides an interface for configuring the simulated
/// machine before it is brought up.
pub struct KernelBuilder {
    frames: usize,
    max_envs: usize,
    quiet: bool,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    /// Default number of physical frames.
    pub const DEFAULT_FRAMES: usize = 4096;

    /// Default number of environments (`NENV`).
    pub const DEFAULT_MAX_ENVS: usize = 1024;

    /// Upper limit on environments; an environment index must fit below the
    /// generation bits of an [`EnvId`].
    pub const MAX_ENVS_LIMIT: usize = 1 << env::ENVGENSHIFT;

    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            frames: Self::DEFAULT_FRAMES,
            max_envs: Self::DEFAULT_MAX_ENVS,
            quiet: false,
        }
    }

    /// Sets the number of physical frames available to the whole machine.
    ///
    /// Page-table pages are drawn from the same pool as user pages.
    pub fn frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Sets the maximum number of live environments.
    pub fn max_envs(mut self, max_envs: usize) -> Self {
        self.max_envs = max_envs.clamp(1, Self::MAX_ENVS_LIMIT);
        self
    }

    /// Suppresses `info!`, `warning!` and `debug!` output.
    ///
    /// The console is shared by the whole process: [`build`](Self::build)
    /// stores this setting in the global `abyss::QUITE` flag, so it
    /// applies to every kernel of the process, including ones built earlier.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Bring up the kernel.
    pub fn build(self) -> Kernel {
        abyss::QUITE.store(self.quiet, core::sync::atomic::Ordering::SeqCst);
        info!(
            "Memory: {} frames, {} environments.",
            self.frames, self.max_envs
        );
        Kernel {
            pool: FramePool::new(self.frames),
            envs: SpinLock::new(EnvTable::new(self.max_envs)),
            scheduler: sched::Fifo::default(),
            exited: SpinLock::new(BTreeMap::new()),
        }
    }
}

/// The kernel of the simulated machine.
///
/// A [`Kernel`] owns the physical memory, the environment table and the run
/// queue. It is dropped together with every environment it still holds.
pub struct Kernel {
    pool: Arc<FramePool>,
    envs: SpinLock<EnvTable>,
    scheduler: sched::Fifo,
    exited: SpinLock<BTreeMap<EnvId, i32>>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Bring up a kernel with the default configuration.
    pub fn new() -> Self {
        KernelBuilder::new().build()
    }

    /// Number of physical frames currently allocated, page-table pages
    /// included.
    pub fn frames_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// The frame pool backing this kernel.
    pub fn frame_pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// The exit code of a finished environment.
    ///
    /// Environments that returned from their entry report the returned value;
    /// environments that were destroyed report `-1` unless they exited with
    /// an explicit code.
    pub fn exit_code(&self, id: EnvId) -> Option<i32> {
        let guard = self.exited.lock();
        let code = guard.get(&id).copied();
        guard.unlock();
        code
    }

    /// A read-only snapshot of a live environment.
    pub fn env_info(&self, id: EnvId) -> Option<EnvInfo> {
        self.lookup(id).map(|env| env.info())
    }

    pub(crate) fn lookup(&self, id: EnvId) -> Option<Arc<env::Env>> {
        let guard = self.envs.lock();
        let env = guard.get(id);
        guard.unlock();
        env
    }

    pub(crate) fn record_exit(&self, id: EnvId, code: i32) {
        let mut guard = self.exited.lock();
        guard.entry(id).or_insert(code);
        guard.unlock();
    }

    /// Tear down an environment and release its address space.
    pub(crate) fn free_env(&self, id: EnvId, code: i32) {
        let mut guard = self.envs.lock();
        let env = guard.remove(id);
        guard.unlock();
        if let Some(env) = env {
            env.set_status(EnvStatus::Dying);
            self.record_exit(id, code);
            info!("[{:08x}] free env {:08x}", env.parent_id.into_raw(), id.into_raw());
            // The address space goes with the last reference to the
            // environment.
            drop(env);
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let mut guard = self.envs.lock();
        let envs = guard.drain();
        guard.unlock();
        drop(envs);
    }
}
