//! # ulib: user-level process duplication for exos
//!
//! exos offers no `fork`. It offers primitives on address spaces, and this
//! library builds a copy-on-write `fork` out of them, entirely in user space:
//!
//! - [`pgfault`] installs the page-fault handler and its exception stack.
//! - [`perm`] decides, from a page's permission bits, how the page is carried
//!   into a child.
//! - [`fork`] holds the fault handler that resolves copy-on-write faults, the
//!   per-page duplication engine, and the [`fork()`](fork::fork) and
//!   [`sfork()`](fork::sfork) entry points.
//!
//! ## Copy-on-write
//!
//! After a fork, every writable page of the parent is mapped read-only with
//! [`PteFlags::COW`] in *both* address spaces, backed by the same frame.
//! The first write to such a page in either space faults; the handler copies
//! the page into a fresh frame, maps the copy writable in place of the shared
//! frame, and lets the write proceed. Pages are thus copied lazily, one at a
//! time, and only when the two spaces actually diverge.
//!
//! ## Returning twice
//!
//! A C `fork()` returns twice: the child's id to the parent and `0` to the
//! child. Here the two continuations are two call sites: [`fork()`]
//! returns the child's id to the caller, and the child starts in the closure
//! passed to [`fork()`], with its own [`UserEnv`].
//!
//! ```
//! use exos::{KernelBuilder, addressing::Va, memlayout::UTEXT, mm::page_table::PteFlags, EnvId};
//!
//! let kernel = KernelBuilder::new().quiet(true).build();
//! let code = kernel.boot(|env| {
//!     let va = Va::new(UTEXT).unwrap();
//!     env.sys_page_alloc(EnvId::SELF, va, PteFlags::U | PteFlags::W | PteFlags::P).unwrap();
//!     env.write_u32(va, 1);
//!
//!     let child = ulib::fork(env, move |env| {
//!         // The child sees the parent's memory as of the fork.
//!         env.read_u32(va) as i32
//!     })
//!     .unwrap();
//!     env.write_u32(va, 2);
//!     env.sys_yield();
//!     assert_eq!(env.kernel().exit_code(child), Some(1));
//!     env.read_u32(va) as i32
//! });
//! assert_eq!(code, 2);
//! ```
//!
//! [`PteFlags::COW`]: exos::mm::page_table::PteFlags::COW
//! [`UserEnv`]: exos::UserEnv

pub mod fork;
pub mod perm;
pub mod pgfault;

pub use fork::{ForkError, ForkMode, Violation, fork, sfork};
