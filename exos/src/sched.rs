//! Environment scheduler.
//!
//! exos schedules environments cooperatively on the thread that drives the
//! kernel. The scheduler pops the next runnable environment from a
//! first-in-first-out queue and runs its entry until the entry returns or the
//! environment exits. [`UserEnv::sys_yield`] lets the queued environments run
//! to completion before the caller continues.
//!
//! Leaving an environment early, through [`UserEnv::exit`], a fatal fault or
//! a [`UserEnv::panic`], unwinds the environment's stack back to the
//! scheduler. A panic that does not come from an environment exit, such as a
//! failed assertion in user code, is propagated to whoever drives the kernel.
use crate::{Kernel, KernelError, env::EnvId, env::EnvStatus, syscall::UserEnv};
use crossbeam_queue::SegQueue;
use std::panic::{AssertUnwindSafe, Location, catch_unwind, resume_unwind};

/// A trait for an environment scheduler.
///
/// The [`Scheduler`] trait defines which environment to run next.
pub trait Scheduler {
    /// Peek a next environment to run.
    ///
    /// Returns `None` if no environment is waiting.
    fn next_to_run(&self) -> Option<EnvId>;

    /// Push an environment `id` into scheduling queue.
    fn push_to_queue(&self, id: EnvId);
}

/// A First-in-first-out scheduler.
#[derive(Default)]
pub struct Fifo {
    runqueue: SegQueue<EnvId>,
}

impl Scheduler for Fifo {
    fn next_to_run(&self) -> Option<EnvId> {
        self.runqueue.pop()
    }

    fn push_to_queue(&self, id: EnvId) {
        self.runqueue.push(id);
    }
}

/// Unwind payload of an environment that left its entry early.
struct EnvExit {
    id: EnvId,
}

impl Kernel {
    /// Create a runnable environment without a parent that runs `entry`.
    ///
    /// The value `entry` returns becomes the environment's exit code.
    pub fn spawn<F>(&self, entry: F) -> Result<EnvId, KernelError>
    where
        F: FnOnce(&UserEnv<'_>) -> i32 + Send + 'static,
    {
        let id = self.alloc_env(EnvId::SELF, Box::new(entry))?;
        if let Some(env) = self.lookup(id) {
            env.set_status(EnvStatus::Runnable);
        }
        self.enqueue(id);
        Ok(id)
    }

    /// Spawn `entry`, run until no environment is runnable, and return the
    /// exit code of `entry`'s environment.
    pub fn boot<F>(&self, entry: F) -> i32
    where
        F: FnOnce(&UserEnv<'_>) -> i32 + Send + 'static,
    {
        match self.spawn(entry) {
            Ok(id) => {
                self.run();
                self.exit_code(id).unwrap_or(-1)
            }
            Err(e) => e.into(),
        }
    }

    /// Run environments until no environment is runnable.
    pub fn run(&self) {
        while self.step().is_some() {}
    }

    /// Run the next runnable environment to completion.
    ///
    /// Returns the id of the environment that was picked, or `None` if the
    /// queue was empty.
    pub fn step(&self) -> Option<EnvId> {
        let id = self.scheduler.next_to_run()?;
        self.run_env(id);
        Some(id)
    }

    pub(crate) fn enqueue(&self, id: EnvId) {
        self.scheduler.push_to_queue(id);
    }

    fn run_env(&self, id: EnvId) {
        // Destroyed while waiting in the queue.
        let Some(env) = self.lookup(id) else {
            return;
        };
        if env.status() != EnvStatus::Runnable {
            return;
        }
        let Some(entry) = env.take_entry() else {
            return;
        };
        env.set_status(EnvStatus::Running);
        env.count_run();
        drop(env);

        let user = UserEnv::new(self, id);
        match catch_unwind(AssertUnwindSafe(|| entry(&user))) {
            Ok(code) => self.free_env(id, code),
            Err(payload) => match payload.downcast::<EnvExit>() {
                Ok(exit) => debug_assert_eq!(exit.id, id),
                Err(payload) => {
                    self.free_env(id, -1);
                    resume_unwind(payload)
                }
            },
        }
    }
}

impl UserEnv<'_> {
    /// Exit the calling environment with `exit_code`.
    ///
    /// The environment is destroyed and control returns to the scheduler.
    pub fn exit(&self, exit_code: i32) -> ! {
        let id = self.sys_getenvid();
        self.kernel().free_env(id, exit_code);
        resume_unwind(Box::new(EnvExit { id }))
    }

    /// Report a fatal user error and exit with `-1`.
    ///
    /// ```text
    /// [00001000] user panic at ulib/src/fork.rs:42:13: pgfault: not a write
    /// ```
    #[track_caller]
    pub fn panic(&self, args: core::fmt::Arguments<'_>) -> ! {
        println!(
            "[{}] user panic at {}: {}",
            self.sys_getenvid(),
            Location::caller(),
            args
        );
        self.exit(-1)
    }
}

#[cfg(test)]
mod tests {
    use crate::{EnvId, EnvStatus, KernelBuilder};
    use std::sync::{Arc, Mutex};

    #[test]
    fn fifo_order() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let log = Arc::new(Mutex::new(Vec::new()));
        let ids: Vec<_> = (0..3)
            .map(|i| {
                let log = log.clone();
                kernel
                    .spawn(move |_| {
                        log.lock().unwrap().push(i);
                        i
                    })
                    .unwrap()
            })
            .collect();
        assert_eq!(kernel.step(), Some(ids[0]));
        assert_eq!(*log.lock().unwrap(), [0]);
        kernel.run();
        assert_eq!(*log.lock().unwrap(), [0, 1, 2]);
        assert_eq!(kernel.exit_code(ids[2]), Some(2));
        assert_eq!(kernel.step(), None);
        assert_eq!(kernel.frames_in_use(), 0);
    }

    #[test]
    fn exit_and_panic() {
        let kernel = KernelBuilder::new().quiet(true).build();
        assert_eq!(kernel.boot(|env| env.exit(3)), 3);
        assert_eq!(
            kernel.boot(|env| env.panic(format_args!("bad state {}", 1))),
            -1
        );
        assert_eq!(kernel.boot(|env| env.sys_env_destroy(EnvId::SELF).map(|_| 0).unwrap_or(1)), -1);
    }

    #[test]
    fn yield_runs_children() {
        let kernel = KernelBuilder::new().quiet(true).build();
        let code = kernel.boot(|env| {
            let child = env.sys_exofork(|env| env.thisenv().runs as i32).unwrap();
            env.sys_yield();
            // Not runnable yet.
            assert!(env.envs(child).is_some());
            env.sys_env_set_status(child, EnvStatus::Runnable).unwrap();
            while env.envs(child).is_some() {
                env.sys_yield();
            }
            env.kernel().exit_code(child).unwrap_or(-1)
        });
        assert_eq!(code, 1);
    }

    #[test]
    #[should_panic(expected = "assertion in user code")]
    fn user_assertion_propagates() {
        let kernel = KernelBuilder::new().quiet(true).build();
        kernel.boot(|_| panic!("assertion in user code"));
    }
}
