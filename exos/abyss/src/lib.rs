//! The abyss of kernel that operates hardwares.
//!
//! This crate contains the machine-level pieces of the simulated exos
//! machine: address types, the console, the spinlock, and the fault record
//! format the MMU produces.
//!
//! Most users should not reach into this crate directly. Use the re-exports
//! from [`exos`] instead.
//!
//! [`exos`]: ../exos/index.html
#![allow(clippy::missing_safety_doc)]

use core::sync::atomic::AtomicBool;

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod spinlock;
pub mod trapframe;

pub use addressing::{Pa, Va};
pub use spinlock::SpinLock;
pub use trapframe::{PFErrorCode, UTrapframe};

/// Suppresses `info!`, `warning!` and `debug!` output while set.
#[doc(hidden)]
pub static QUITE: AtomicBool = AtomicBool::new(false);
