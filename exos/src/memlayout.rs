//! User address space layout.
//!
//! ```text
//!    UTOP, UXSTACKTOP --> +------------------------------+ 0xeec00000
//!                         |     User Exception Stack     | RW/RW  PGSIZE
//!                         +------------------------------+ 0xeebff000
//!                         |       Empty Memory (*)       | --/--  PGSIZE
//!           USTACKTOP --> +------------------------------+ 0xeebfe000
//!                         |      Normal User Stack       | RW/RW  PGSIZE
//!                         +------------------------------+ 0xeebfd000
//!                         .                              .
//!                         |    Program Data & Heap       |
//!               UTEXT --> +------------------------------+ 0x00800000
//!              PFTEMP --> |       Empty Memory (*)       |        PTSIZE
//!                         |                              |
//!               UTEMP --> +------------------------------+ 0x00400000
//!                         |       Empty Memory (*)       |
//!                       0 +------------------------------+
//! ```
//!
//! Only addresses below [`UTOP`] can be passed to the memory system calls.

use crate::addressing::{PAGE_SIZE, PTSIZE, Va};

/// Start of the program image.
pub const UTEXT: usize = 2 * PTSIZE;

/// Scratch area for temporary page mappings.
pub const UTEMP: usize = PTSIZE;

/// Scratch page used by the user-level page-fault handler.
pub const PFTEMP: usize = UTEMP + PTSIZE - PAGE_SIZE;

/// Top of the user-accessible address space.
pub const UTOP: usize = 0xeec0_0000;

/// Top of the one-page user exception stack.
pub const UXSTACKTOP: usize = UTOP;

/// Top of the normal user stack.
///
/// One unmapped guard page separates it from the exception stack.
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;

/// Returns true if `va` may be named by a memory system call.
#[inline]
pub fn is_user_page(va: Va) -> bool {
    va.is_page_aligned() && va.into_usize() < UTOP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(UTEXT, 0x0080_0000);
        assert_eq!(PFTEMP, 0x007f_f000);
        assert_eq!(USTACKTOP, 0xeebf_e000);
        assert!(is_user_page(Va::new(UXSTACKTOP - PAGE_SIZE).unwrap()));
        assert!(!is_user_page(Va::new(UTOP).unwrap()));
        assert!(!is_user_page(Va::new(UTEXT + 4).unwrap()));
    }
}
