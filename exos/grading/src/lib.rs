//! Test harness for programs that run on exos.
//!
//! - [`assert_exit_code`] turns `fn name(env: &UserEnv) -> i32` into a test
//!   that boots a fresh kernel, runs the function as its first environment,
//!   and checks the environment's exit code.
//! - [`validate_alloc`] fails the test if a page allocated during it is never
//!   freed.
//! - [`syscall!`] issues a raw system call.
extern crate grading_derive;

pub use exos;
pub use grading_derive::*;

/// Issue a raw system call on behalf of `env`.
///
/// Arguments are cast to `usize`. Evaluates to the raw `isize` result.
///
/// ```
/// use exos::{KernelBuilder, syscall::SyscallNumber};
///
/// let kernel = KernelBuilder::new().quiet(true).build();
/// let code = kernel.boot(|env| {
///     let id = grading::syscall!(env, SyscallNumber::GetEnvId);
///     (id as i32 == env.sys_getenvid().into_raw()) as i32
/// });
/// assert_eq!(code, 1);
/// ```
#[macro_export]
macro_rules! syscall {
    ($env:expr, $nr:expr $(, $arg:expr)* $(,)?) => {
        $env.syscall(&$crate::exos::syscall::SyscallAbi::new(
            $nr,
            &[$($arg as usize),*],
        ))
    };
}
