//! Permission bits of duplicated pages.
//!
//! A page is carried into a child in one of three ways, chosen from the
//! page's flags and the fork mode:
//!
//! | Policy                          | When                                         | Child gets               | Parent becomes     |
//! |---------------------------------|----------------------------------------------|--------------------------|--------------------|
//! | [`DupPolicy::PlainShare`]       | [`ForkMode::ShareBelowStack`], below the stack | the same bits          | unchanged          |
//! | [`DupPolicy::CopyOnWrite`]      | `W` or `COW`, and not `SHARE`                | `COW \| U \| P`          | `COW \| U \| P`    |
//! | [`DupPolicy::DirectShare`]      | `SHARE`, or read-only and not `COW`          | the same bits            | unchanged          |
//!
//! "The same bits" are the page's flags restricted to [`PteFlags::SYSCALL`],
//! the bits a mapping system call accepts; the MMU-managed bits are dropped.
use crate::fork::ForkMode;
use exos::{
    addressing::{PAGE_SIZE, Va},
    memlayout::USTACKTOP,
    mm::page_table::PteFlags,
};

/// How a single page is carried into a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPolicy {
    /// Share the frame read-only in both spaces until one of them writes.
    CopyOnWrite,
    /// Share the frame with unchanged permissions; the page cannot diverge
    /// or is meant to stay shared.
    DirectShare,
    /// Share the frame with unchanged permissions because the whole region
    /// is shared.
    PlainShare,
}

/// Bits of a copy-on-write mapping, in both the parent and the child.
pub const COW_PERM: PteFlags = PteFlags::from_bits_truncate(
    PteFlags::COW.bits() | PteFlags::U.bits() | PteFlags::P.bits(),
);

/// Bits of a private writable page.
pub const PRIVATE_PERM: PteFlags = PteFlags::from_bits_truncate(
    PteFlags::W.bits() | PteFlags::U.bits() | PteFlags::P.bits(),
);

/// Returns true if `flags` maps a present user page.
#[inline]
pub fn is_user_present(flags: PteFlags) -> bool {
    flags.contains(PteFlags::P | PteFlags::U)
}

/// Returns true if the page must become copy-on-write when it gains a second
/// owner.
#[inline]
pub fn needs_cow(flags: PteFlags) -> bool {
    !flags.contains(PteFlags::SHARE) && flags.intersects(PteFlags::W | PteFlags::COW)
}

impl DupPolicy {
    /// Choose the policy for the page at `va` with `flags` under `mode`.
    pub fn classify(flags: PteFlags, va: Va, mode: ForkMode) -> Self {
        if mode == ForkMode::ShareBelowStack && va.into_usize() < USTACKTOP - PAGE_SIZE {
            DupPolicy::PlainShare
        } else if needs_cow(flags) {
            DupPolicy::CopyOnWrite
        } else {
            DupPolicy::DirectShare
        }
    }

    /// The bits to map the page with in the child.
    pub fn child_perm(self, flags: PteFlags) -> PteFlags {
        match self {
            DupPolicy::CopyOnWrite => COW_PERM,
            DupPolicy::DirectShare | DupPolicy::PlainShare => flags & PteFlags::SYSCALL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exos::memlayout::UTEXT;

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn classification() {
        let text = va(UTEXT);
        let stack = va(USTACKTOP - PAGE_SIZE);
        let up = PteFlags::U | PteFlags::P;
        let cow = ForkMode::CopyOnWrite;

        assert_eq!(DupPolicy::classify(up | PteFlags::W, text, cow), DupPolicy::CopyOnWrite);
        assert_eq!(DupPolicy::classify(COW_PERM, text, cow), DupPolicy::CopyOnWrite);
        assert_eq!(DupPolicy::classify(up, text, cow), DupPolicy::DirectShare);
        assert_eq!(
            DupPolicy::classify(up | PteFlags::W | PteFlags::SHARE, text, cow),
            DupPolicy::DirectShare
        );

        let share = ForkMode::ShareBelowStack;
        assert_eq!(DupPolicy::classify(up | PteFlags::W, text, share), DupPolicy::PlainShare);
        assert_eq!(DupPolicy::classify(up | PteFlags::W, stack, share), DupPolicy::CopyOnWrite);
        assert_eq!(DupPolicy::classify(up, stack, share), DupPolicy::DirectShare);
    }

    #[test]
    fn child_bits_drop_hardware_bits() {
        let flags = PRIVATE_PERM | PteFlags::A | PteFlags::D | PteFlags::SHARE;
        assert_eq!(
            DupPolicy::DirectShare.child_perm(flags),
            PRIVATE_PERM | PteFlags::SHARE
        );
        assert_eq!(DupPolicy::CopyOnWrite.child_perm(flags), COW_PERM);
        assert!(!COW_PERM.contains(PteFlags::W));
    }
}
