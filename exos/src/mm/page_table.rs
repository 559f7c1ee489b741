//! Entries of Page Table and thier permissions.
//!
//! The simulated MMU translates a 32-bit virtual address through a page
//! directory of [`NPDENTRIES`] entries, each of which may point to a page
//! table of [`NPTENTRIES`] entries. A page table occupies one physical frame
//! of its own, charged to the same [`FramePool`] as user pages.
//!
//! Bits `9..=11` of an entry are ignored by the MMU and are left to software.
//! exos gives two of them a meaning that user-level code relies on:
//! [`PteFlags::SHARE`] marks a page that must stay shared across a fork, and
//! [`PteFlags::COW`] marks a page that is shared read-only until its first
//! write.
use crate::{
    KernelError,
    addressing::{NPDENTRIES, NPTENTRIES, PAGE_MASK, Pa, Va},
    mm::{FramePool, Page},
};
use std::sync::Arc;

bitflags::bitflags! {
    /// Flags for pte and pde.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page.
        const P = 1 << 0;
        /// Read/write; if 0, writes are not allowed to the page.
        const W = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed.
        const U = 1 << 2;
        /// Page-level write-through.
        const PWT = 1 << 3;
        /// Page-level cache disable.
        const PCD = 1 << 4;
        /// Accessed; set by the MMU on every access to the page.
        const A = 1 << 5;
        /// Dirty; set by the MMU on every write to the page.
        const D = 1 << 6;
        /// Page size; only meaningful on a directory entry.
        const PS = 1 << 7;
        /// Global.
        const G = 1 << 8;
        /// Available for software use.
        const AVAIL = 1 << 9;
        /// Shared; the page is mapped into a child as-is on fork.
        const SHARE = 1 << 10;
        /// Copy-on-write; the page is shared read-only until written.
        const COW = 1 << 11;
        /// Bits user code may pass to `sys_page_alloc` and `sys_page_map`.
        const SYSCALL = Self::AVAIL.bits | Self::SHARE.bits | Self::COW.bits
            | Self::P.bits | Self::W.bits | Self::U.bits;
    }
}

/// Page Table Entry (PTE).
///
/// A [`Pte`] is a plain copy of the raw entry word: the physical address of
/// the frame in the upper bits and the [`PteFlags`] in the lower twelve.
/// Modifying a copy never changes the page table it was read from.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl Pte {
    /// An empty entry.
    pub const EMPTY: Pte = Pte(0);

    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the page is present, containing the physical address.
    /// - `None` if the page is not present (i.e., the "P" flag is not set).
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PAGE_MASK)
        } else {
            None
        }
    }

    /// Get the flags associated with this page table entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PAGE_MASK)
    }

    /// Returns true if the entry maps a page.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    fn new(pa: Pa, flags: PteFlags) -> Self {
        Pte(pa.into_usize() | flags.bits())
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pte({:08x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

/// Page Directory Entry (PDE).
///
/// A present directory entry points to the frame holding a page table. Its
/// flags are the union of the access rights that table may grant.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pde(pub usize);

impl Pde {
    /// Get the physical address of the page table this entry points to.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PAGE_MASK)
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PAGE_MASK)
    }

    /// Returns true if the entry points to a page table.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }
}

impl core::fmt::Debug for Pde {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pde({:08x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

/// Error type for page table operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address is not a multiple of the page
    /// size.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not
    /// exist.
    NotExist,

    /// Out of memory.
    ///
    /// This error is returned when a page table could not be allocated.
    NoMemory,
}

impl From<PageTableMappingError> for KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned | PageTableMappingError::NotExist => {
                KernelError::InvalidArgument
            }
            PageTableMappingError::NoMemory => KernelError::NoMemory,
        }
    }
}

/// Directory entry flags of a freshly created page table.
///
/// Permissions are enforced at the leaf, so a directory entry grants
/// everything.
const PDE_DEFAULT: PteFlags =
    PteFlags::from_bits_truncate(PteFlags::P.bits() | PteFlags::W.bits() | PteFlags::U.bits());

struct Slot {
    page: Page,
    flags: PteFlags,
}

struct Table {
    frame: Page,
    entries: Box<[Option<Slot>]>,
}

impl Table {
    fn new(pool: &Arc<FramePool>) -> Result<Self, PageTableMappingError> {
        Ok(Table {
            frame: Page::new(pool).map_err(|_| PageTableMappingError::NoMemory)?,
            entries: (0..NPTENTRIES).map(|_| None).collect(),
        })
    }
}

/// A two-level page table.
///
/// The page table owns a reference to every frame it maps, so a frame lives
/// at least as long as any address space that maps it. Page tables are
/// created on demand and are kept until the whole [`PageTable`] is dropped.
pub struct PageTable {
    dir: Box<[Option<Table>]>,
    pool: Arc<FramePool>,
}

impl PageTable {
    /// Create an empty page table whose tables are drawn from `pool`.
    pub fn new(pool: &Arc<FramePool>) -> Self {
        PageTable {
            dir: (0..NPDENTRIES).map(|_| None).collect(),
            pool: pool.clone(),
        }
    }

    fn slot(&self, va: Va) -> Option<&Slot> {
        self.dir[va.pdx()].as_ref()?.entries[va.ptx()].as_ref()
    }

    fn slot_mut(&mut self, va: Va) -> Option<&mut Slot> {
        self.dir[va.pdx()].as_mut()?.entries[va.ptx()].as_mut()
    }

    /// Read the directory entry at index `pdx`.
    pub fn pde(&self, pdx: usize) -> Pde {
        match self.dir.get(pdx) {
            Some(Some(table)) => Pde(table.frame.pa().into_usize() | PDE_DEFAULT.bits()),
            _ => Pde(0),
        }
    }

    /// Read the entry that translates `va`.
    ///
    /// Returns [`Pte::EMPTY`] if nothing is mapped there.
    pub fn pte(&self, va: Va) -> Pte {
        self.slot(va)
            .map(|slot| Pte::new(slot.page.pa(), slot.flags))
            .unwrap_or(Pte::EMPTY)
    }

    /// Walk the page table and return the page mapped at `va` with its flags.
    ///
    /// # Returns
    /// - `Ok((Page, PteFlags))` with a new reference to the mapped page.
    /// - `Err(PageTableMappingError::Unaligned)` if `va` is not page-aligned.
    /// - `Err(PageTableMappingError::NotExist)` if no page is mapped.
    pub fn walk(&self, va: Va) -> Result<(Page, PteFlags), PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        self.slot(va)
            .map(|slot| (slot.page.clone(), slot.flags))
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Map `page` at `va` with `flags`, creating the page table if needed.
    ///
    /// An existing mapping at `va` is replaced and its page is returned.
    /// Mapping a page over itself only updates the flags.
    pub fn map(
        &mut self,
        va: Va,
        page: Page,
        flags: PteFlags,
    ) -> Result<Option<Page>, PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        let table = match &mut self.dir[va.pdx()] {
            Some(table) => table,
            empty => empty.insert(Table::new(&self.pool)?),
        };
        Ok(table.entries[va.ptx()]
            .replace(Slot { page, flags: flags | PteFlags::P })
            .map(|old| old.page))
    }

    /// Remove the mapping at `va`, returning the page that was mapped.
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        self.dir[va.pdx()]
            .as_mut()
            .and_then(|table| table.entries[va.ptx()].take())
            .map(|slot| slot.page)
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Add `flags` to the mapping at `va`.
    ///
    /// This is how the MMU records the accessed and dirty bits.
    pub fn mark(&mut self, va: Va, flags: PteFlags) {
        if let Some(slot) = self.slot_mut(va.page_down()) {
            slot.flags |= flags;
        }
    }

    /// Iterate over every mapping in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (Va, Pte)> + '_ {
        self.dir
            .iter()
            .enumerate()
            .filter_map(|(pdx, table)| table.as_ref().map(|t| (pdx, t)))
            .flat_map(|(pdx, table)| {
                table
                    .entries
                    .iter()
                    .enumerate()
                    .filter_map(move |(ptx, slot)| {
                        let slot = slot.as_ref()?;
                        let va = Va::from_page_number(pdx * NPTENTRIES + ptx)?;
                        Some((va, Pte::new(slot.page.pa(), slot.flags)))
                    })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::PAGE_SIZE;

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn map_and_walk() {
        let pool = FramePool::new(8);
        let mut pt = PageTable::new(&pool);
        let page = Page::new(&pool).unwrap();
        let pa = page.pa();
        assert!(pt.map(va(0x0080_0000), page, PteFlags::U | PteFlags::W).unwrap().is_none());
        // One frame for the page, one for its page table.
        assert_eq!(pool.in_use(), 2);

        let pte = pt.pte(va(0x0080_0000));
        assert_eq!(pte.pa(), Some(pa));
        assert_eq!(pte.flags(), PteFlags::P | PteFlags::U | PteFlags::W);
        assert!(pt.pde(va(0x0080_0000).pdx()).is_present());
        assert!(!pt.pte(va(0x0080_0000 + PAGE_SIZE)).is_present());
        assert_eq!(
            pt.walk(va(0x0080_0001)).unwrap_err(),
            PageTableMappingError::Unaligned
        );
    }

    #[test]
    fn replace_and_unmap() {
        let pool = FramePool::new(8);
        let mut pt = PageTable::new(&pool);
        let a = Page::new(&pool).unwrap();
        let b = Page::new(&pool).unwrap();
        let (pa_a, pa_b) = (a.pa(), b.pa());
        pt.map(va(0x1000), a, PteFlags::U).unwrap();
        let old = pt.map(va(0x1000), b, PteFlags::U).unwrap().unwrap();
        assert_eq!(old.pa(), pa_a);
        drop(old);
        assert_eq!(pt.unmap(va(0x1000)).unwrap().pa(), pa_b);
        assert_eq!(
            pt.unmap(va(0x1000)).unwrap_err(),
            PageTableMappingError::NotExist
        );
        // Only the page table frame remains.
        assert_eq!(pool.in_use(), 1);
        drop(pt);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn table_allocation_failure() {
        let pool = FramePool::new(1);
        let mut pt = PageTable::new(&pool);
        let page = Page::new(&pool).unwrap();
        assert_eq!(
            pt.map(va(0x1000), page, PteFlags::U).unwrap_err(),
            PageTableMappingError::NoMemory
        );
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn ordered_iteration() {
        let pool = FramePool::new(8);
        let mut pt = PageTable::new(&pool);
        for addr in [0x0080_2000, 0x0040_0000, 0x0080_0000] {
            pt.map(va(addr), Page::new(&pool).unwrap(), PteFlags::U).unwrap();
        }
        let vas: Vec<_> = pt.iter().map(|(va, _)| va.into_usize()).collect();
        assert_eq!(vas, [0x0040_0000, 0x0080_0000, 0x0080_2000]);
        pt.mark(va(0x0080_2abc), PteFlags::A | PteFlags::D);
        assert!(pt.pte(va(0x0080_2000)).flags().contains(PteFlags::A | PteFlags::D));
    }
}
