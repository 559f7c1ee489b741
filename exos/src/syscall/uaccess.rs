//! The `uaccess` module provides user-mode memory access through the
//! simulated MMU.
//!
//! User code never touches a frame directly. Loads and stores go through
//! [`UserEnv::read`] and [`UserEnv::write`], which translate every page of
//! the accessed range through the caller's page table exactly as the
//! hardware would:
//!
//! - an access to an unmapped page or a page without [`PteFlags::U`] faults,
//! - a store to a page without [`PteFlags::W`] faults,
//! - a successful access sets [`PteFlags::A`], and a store also sets
//!   [`PteFlags::D`].
//!
//! A fault is delivered to the caller's page-fault upcall (see
//! [`crate::trap`]) and the access is retried once the upcall returns. A
//! range that spans several pages is accessed page by page in ascending
//! order, so the pages before a faulting page are already accessed when the
//! fault is delivered.
//!
//! [`PteFlags::U`]: crate::mm::page_table::PteFlags::U
//! [`PteFlags::W`]: crate::mm::page_table::PteFlags::W
//! [`PteFlags::A`]: crate::mm::page_table::PteFlags::A
//! [`PteFlags::D`]: crate::mm::page_table::PteFlags::D
use crate::{
    addressing::{PAGE_SIZE, Va},
    syscall::UserEnv,
};

/// Split `[va, va + len)` into per-page chunks of `(address, offset into
/// the range, length)`.
fn chunks(va: Va, len: usize) -> impl Iterator<Item = (Va, usize, usize)> {
    let mut done = 0;
    core::iter::from_fn(move || {
        if done == len {
            return None;
        }
        let at = va + done;
        let n = (PAGE_SIZE - at.offset()).min(len - done);
        let chunk = (at, done, n);
        done += n;
        Some(chunk)
    })
}

impl UserEnv<'_> {
    /// Load `buf.len()` bytes starting at `va` into `buf`.
    ///
    /// Does not return if a fault on the range cannot be resolved.
    pub fn read(&self, va: Va, buf: &mut [u8]) {
        for (at, ofs, n) in chunks(va, buf.len()) {
            self.with_page(at, false, |page| {
                page.read(at.offset(), &mut buf[ofs..ofs + n])
            });
        }
    }

    /// Store `data` starting at `va`.
    ///
    /// Does not return if a fault on the range cannot be resolved.
    pub fn write(&self, va: Va, data: &[u8]) {
        for (at, ofs, n) in chunks(va, data.len()) {
            self.with_page(at, true, |page| page.write(at.offset(), &data[ofs..ofs + n]));
        }
    }

    /// Load a little-endian `u32` from `va`.
    pub fn read_u32(&self, va: Va) -> u32 {
        let mut b = [0; 4];
        self.read(va, &mut b);
        u32::from_le_bytes(b)
    }

    /// Store `v` as a little-endian `u32` at `va`.
    pub fn write_u32(&self, va: Va, v: u32) {
        self.write(va, &v.to_le_bytes());
    }

    /// Copy one whole page from `src` to `dst`, both page-aligned.
    ///
    /// This is a load of the source page followed by a store to the
    /// destination page; each may fault.
    pub fn copy_page(&self, dst: Va, src: Va) {
        let mut buf = vec![0; PAGE_SIZE];
        self.read(src.page_down(), &mut buf);
        self.write(dst.page_down(), &buf);
    }
}
