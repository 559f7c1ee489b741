use exos::{
    EnvId, UserEnv,
    addressing::{PAGE_SIZE, Va},
    memlayout::{USTACKTOP, UTEXT},
    mm::page_table::PteFlags,
};
use grading::assert_exit_code;
use ulib::{
    perm::{COW_PERM, PRIVATE_PERM},
    sfork,
};

fn stack() -> Va {
    Va::new(USTACKTOP - PAGE_SIZE).unwrap()
}

/// Memory below the stack is shared with the caller's permissions; the stack
/// page is copy-on-write.
///
/// It ensures that:
/// - Data pages name the same frame, writable, without the copy-on-write bit.
/// - The stack page is copy-on-write on both sides.
/// - A write to a data page by the child is seen by the parent.
/// - Writes to the stack diverge.
#[assert_exit_code(0)]
#[validate_alloc]
fn share_below_stack(env: &UserEnv) -> i32 {
    let data = Va::new(UTEXT).unwrap();
    env.sys_page_alloc(EnvId::SELF, data, PRIVATE_PERM)
        .expect("sys_page_alloc failed.");
    env.sys_page_alloc(EnvId::SELF, stack(), PRIVATE_PERM)
        .expect("sys_page_alloc failed.");
    env.write_u32(stack(), 10);

    let child = sfork(env, move |env| {
        env.write_u32(data, 5);
        env.write_u32(stack(), 20);
        0
    })
    .expect("sfork failed.");

    let kernel = env.kernel();
    let mine = env.uvpt(data.page_number());
    let theirs = kernel.pte(child, data).unwrap();
    assert_eq!(mine.pa(), theirs.pa());
    assert_eq!(theirs.flags() & PteFlags::SYSCALL, PRIVATE_PERM);
    assert!(!mine.flags().contains(PteFlags::COW));

    let mine = env.uvpt(stack().page_number());
    let theirs = kernel.pte(child, stack()).unwrap();
    assert_eq!(mine.pa(), theirs.pa());
    assert_eq!(mine.flags() & PteFlags::SYSCALL, COW_PERM);
    assert_eq!(theirs.flags() & PteFlags::SYSCALL, COW_PERM);

    env.sys_yield();
    assert_eq!(kernel.exit_code(child), Some(0));
    assert_eq!(env.read_u32(data), 5);
    assert_eq!(env.read_u32(stack()), 10);
    // Only the stack write faulted, and only in the child.
    assert_eq!(env.thisenv().pgfaults, 0);
    0
}

/// A read-only stack page is shared directly.
#[assert_exit_code(0)]
#[validate_alloc]
fn read_only_stack(env: &UserEnv) -> i32 {
    env.sys_page_alloc(EnvId::SELF, stack(), PteFlags::U | PteFlags::P)
        .expect("sys_page_alloc failed.");
    let child = sfork(env, |_| 0).expect("sfork failed.");
    let theirs = env.kernel().pte(child, stack()).unwrap();
    assert_eq!(theirs.flags(), PteFlags::U | PteFlags::P);
    assert_eq!(theirs.pa(), env.uvpt(stack().page_number()).pa());
    0
}
