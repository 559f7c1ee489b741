//! User-level page fault handler support.
//!
//! The kernel delivers a page fault by calling the environment's upcall on
//! the exception stack, the page below [`UXSTACKTOP`]. Before the first fault
//! can be delivered both must exist; [`set_pgfault_handler`] provides them.
use exos::{
    EnvId, KernelError, Upcall, UserEnv,
    addressing::{PAGE_SIZE, Va},
    memlayout::UXSTACKTOP,
    mm::page_table::PteFlags,
};

/// Page holding the exception stack.
pub const UXSTACK: Va = match Va::new(UXSTACKTOP - PAGE_SIZE) {
    Some(va) => va,
    None => panic!("exception stack outside the address space"),
};

/// Set the page fault handler of the calling environment to `handler`.
///
/// The exception stack is allocated the first time around; later calls only
/// replace the handler. Calling it again with the same handler has no
/// effect.
pub fn set_pgfault_handler(env: &UserEnv<'_>, handler: Upcall) -> Result<(), KernelError> {
    if !env.uvpt(UXSTACK.page_number()).flags().contains(PteFlags::P) {
        env.sys_page_alloc(
            EnvId::SELF,
            UXSTACK,
            PteFlags::W | PteFlags::U | PteFlags::P,
        )?;
    }
    env.sys_env_set_pgfault_upcall(EnvId::SELF, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use exos::{KernelBuilder, UTrapframe};

    fn handler(_env: &UserEnv<'_>, _utf: &UTrapframe) {}

    #[test]
    fn installs_stack_once() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            set_pgfault_handler(env, handler).unwrap();
            let first = env.uvpt(UXSTACK.page_number());
            assert!(first.flags().contains(PteFlags::W | PteFlags::U | PteFlags::P));
            set_pgfault_handler(env, handler).unwrap();
            assert_eq!(env.uvpt(UXSTACK.page_number()).pa(), first.pa());
            assert!(env.thisenv().pgfault_upcall.is_some());
            0
        });
        assert_eq!(code, 0);
    }
}
