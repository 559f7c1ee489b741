//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for virtual address and physical
//! address of the 32-bit, two-level paged machine that exos simulates. A
//! virtual address is split into a page-directory index, a page-table index,
//! and a byte offset:
//!
//! ```text
//! 31                    22 21                    12 11                     0
//! +-----------------------+-----------------------+------------------------+
//! |  Page Directory Index |   Page Table Index    |   Offset within Page   |
//! +-----------------------+-----------------------+------------------------+
//!  \------- PDX(va) -----/ \------ PTX(va) ------/
//!  \------------- PGNUM(va) --------------------/
//! ```
//!
//! Both [`Va`] and [`Pa`] support arithmetic operations (addition,
//! subtraction, bitwise operations), which allow straightforward address
//! arithmetic.
//!
//! ## Example Usage:
//!
//! ```
//! use abyss::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(0x0080_0123).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x0080_0000);
//! assert_eq!((va.page_down() + PAGE_SIZE).page_number(), 0x801);
//! ```

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Number of entries in a page directory.
pub const NPDENTRIES: usize = 1024;

/// Number of entries in a page table.
pub const NPTENTRIES: usize = 1024;

/// Bytes of virtual memory covered by a single page directory entry.
pub const PTSIZE: usize = PAGE_SIZE * NPTENTRIES;

/// The shift amount to get the page directory index from a given address.
pub const PDX_SHIFT: usize = 22;

/// Upper bound (exclusive) of every address on the simulated machine.
const ADDR_LIMIT: usize = 1 << 32;

/// Represents a physical address.
///
/// On the simulated machine a physical address only identifies a frame; it
/// is never dereferenced. Two mappings refer to the same frame exactly when
/// their physical addresses are equal.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < ADDR_LIMIT {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the address into `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the address to the page boundary.
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Offset within a page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a user virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is valid.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < ADDR_LIMIT {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// The first address of the page numbered `pn`.
    #[inline]
    pub const fn from_page_number(pn: usize) -> Option<Self> {
        Self::new(pn << PAGE_SHIFT)
    }

    /// Cast the address into `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up the address to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Offset within a page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns true if the address lies on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    /// Page number of this address (`PGNUM`).
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Page directory index of this address (`PDX`).
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDX_SHIFT) & (NPDENTRIES - 1)
    }

    /// Page table index of this address (`PTX`).
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PAGE_SHIFT) & (NPTENTRIES - 1)
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:08x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:08x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices() {
        let va = Va::new(0xeebf_d123).unwrap();
        assert_eq!(va.pdx(), 0x3ba);
        assert_eq!(va.ptx(), 0x3fd);
        assert_eq!(va.offset(), 0x123);
        assert_eq!(va.page_number(), 0xeebfd);
        assert_eq!(Va::from_page_number(0xeebfd), Some(va.page_down()));
    }

    #[test]
    fn out_of_range() {
        assert!(Va::new(1 << 32).is_none());
        assert!(Pa::new(usize::MAX).is_none());
        assert_eq!(Va::new(0x1fff).unwrap().page_up().into_usize(), 0x2000);
    }
}
