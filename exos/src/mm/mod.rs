//! Memory Management.
//!
//! This module implements the physical memory of the simulated machine. The
//! core abstraction is the [`Page`], which represents a single physical
//! frame.
//!
//! Memory allocation and deallocation in exos is closely tied to Rust's
//! ownership and lifetime system: A frame is allocated by creating an instance
//! of the [`Page`] struct with [`Page::new`]. Cloning a [`Page`] adds a
//! reference to the same frame; this is how a single frame is mapped into
//! several address spaces. Once the last [`Page`] instance is dropped, the
//! frame is automatically returned to its [`FramePool`].
//!
//! Frames are drawn from a bounded [`FramePool`], so allocation can fail with
//! [`KernelError::NoMemory`] exactly where a real machine would run out of
//! physical memory.
pub mod page_table;

use crate::KernelError;
use abyss::{
    addressing::{PAGE_SHIFT, PAGE_SIZE, Pa},
    spinlock::SpinLock,
};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// First frame number handed out by a pool.
///
/// Physical address `0` is never a valid frame.
const FIRST_PFN: usize = 0x100;

/// A bounded pool of physical frames.
///
/// Every [`Page`] is charged to the pool it came from until the last
/// reference to it is dropped.
pub struct FramePool {
    capacity: usize,
    in_use: AtomicUsize,
    next_pfn: AtomicUsize,
}

impl FramePool {
    /// Create a pool that can hold up to `capacity` frames at once.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            in_use: AtomicUsize::new(0),
            next_pfn: AtomicUsize::new(FIRST_PFN),
        })
    }

    /// Number of frames currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    fn reserve(&self) -> Result<Pa, KernelError> {
        self.in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map_err(|_| KernelError::NoMemory)?;
        // Frame numbers are not recycled so that a physical address names at
        // most one frame over the pool's lifetime.
        let pfn = self.next_pfn.fetch_add(1, Ordering::SeqCst);
        match Pa::new(pfn << PAGE_SHIFT) {
            Some(pa) => Ok(pa),
            None => {
                self.release();
                Err(KernelError::NoMemory)
            }
        }
    }

    fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Frame {
    pa: Pa,
    data: SpinLock<Box<[u8; PAGE_SIZE]>>,
    pool: Arc<FramePool>,
}

impl Drop for Frame {
    fn drop(&mut self) {
        untrack(self as *const Frame as usize);
        self.pool.release();
    }
}

/// A representation of a physical page.
///
/// The [`Page`] struct encapsulates a single frame, providing methods to
/// access the frame's contents.
///
/// This page internally holds the reference counts. This counter increases on a
/// calling of [`Page::clone`], and decreases when the page instance is dropped.
///
/// ## Example:
/// ```
/// use exos::mm::{FramePool, Page};
///
/// let pool = FramePool::new(1);
/// let page = Page::new(&pool).unwrap();
/// page.write(0, &[1, 2, 3]);
///
/// let alias = page.clone();
/// let mut buf = [0; 3];
/// alias.read(0, &mut buf);
/// assert_eq!(buf, [1, 2, 3]);
/// assert_eq!(alias.pa(), page.pa());
/// assert!(Page::new(&pool).is_err());
/// ```
#[derive(Clone)]
pub struct Page {
    inner: Arc<Frame>,
}

impl Page {
    /// Allocate a new zero-filled page from `pool`.
    ///
    /// Fails with [`KernelError::NoMemory`] when the pool is exhausted.
    #[track_caller]
    pub fn new(pool: &Arc<FramePool>) -> Result<Self, KernelError> {
        let loc = core::panic::Location::caller();
        let pa = pool.reserve()?;
        let page = Page {
            inner: Arc::new(Frame {
                pa,
                data: SpinLock::new(Box::new([0; PAGE_SIZE])),
                pool: pool.clone(),
            }),
        };
        track(Arc::as_ptr(&page.inner) as usize, pa, loc);
        Ok(page)
    }

    /// Get the physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.inner.pa
    }

    /// Number of live references to this frame.
    ///
    /// Each address space that maps the frame holds one reference.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the page.
    ///
    /// # Panics
    /// Panics if the range crosses the end of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let guard = self.inner.data.lock();
        buf.copy_from_slice(&guard[offset..offset + buf.len()]);
        guard.unlock();
    }

    /// Copy `data` into the page starting at `offset`.
    ///
    /// # Panics
    /// Panics if the range crosses the end of the page.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut guard = self.inner.data.lock();
        guard[offset..offset + data.len()].copy_from_slice(data);
        guard.unlock();
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:?}, refs: {})", self.pa(), self.ref_count())
    }
}

type Allocations = BTreeMap<usize, (Pa, &'static core::panic::Location<'static>)>;

thread_local! {
    static ALLOCATIONS: RefCell<Option<Allocations>> = const { RefCell::new(None) };
}

fn track(key: usize, pa: Pa, loc: &'static core::panic::Location<'static>) {
    ALLOCATIONS.with(|allocs| {
        if let Some(map) = &mut *allocs.borrow_mut() {
            map.insert(key, (pa, loc));
        }
    });
}

fn untrack(key: usize) {
    // A frame may outlive the thread-local during thread teardown.
    let _ = ALLOCATIONS.try_with(|allocs| {
        if let Ok(mut allocs) = allocs.try_borrow_mut() {
            if let Some(map) = &mut *allocs {
                map.remove(&key);
            }
        }
    });
}

/// Start tracking page allocations on the current thread.
///
/// Every [`Page`] allocated after this call is recorded with its allocation
/// site until it is freed. Use [`validate_alloc`] to check that all of them
/// were released.
pub fn track_alloc() {
    ALLOCATIONS.with(|allocs| {
        *allocs.borrow_mut() = Some(BTreeMap::new());
    });
}

/// Stop tracking page allocations and check that every tracked page was
/// freed.
///
/// # Panics
/// Panics with the allocation site of every leaked page.
pub fn validate_alloc() {
    let leaked = ALLOCATIONS.with(|allocs| allocs.borrow_mut().take());
    match leaked {
        Some(leaked) if !leaked.is_empty() => {
            let mut msg = format!("{} page(s) leaked:\n", leaked.len());
            for (pa, loc) in leaked.values() {
                msg.push_str(&format!("    {pa} allocated at {loc}\n"));
            }
            panic!("{msg}");
        }
        _ => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion() {
        let pool = FramePool::new(2);
        let a = Page::new(&pool).unwrap();
        let b = Page::new(&pool).unwrap();
        assert_ne!(a.pa(), b.pa());
        assert_eq!(Page::new(&pool).unwrap_err(), KernelError::NoMemory);
        drop(a);
        assert_eq!(pool.in_use(), 1);
        let c = Page::new(&pool).unwrap();
        assert_ne!(c.pa(), b.pa());
    }

    #[test]
    fn shared_frame() {
        let pool = FramePool::new(4);
        let a = Page::new(&pool).unwrap();
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        b.write(0x10, b"hello");
        let mut buf = [0; 5];
        a.read(0x10, &mut buf);
        assert_eq!(&buf, b"hello");
        drop(a);
        assert_eq!(pool.in_use(), 1);
        drop(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "1 page(s) leaked")]
    fn leak_detection() {
        let pool = FramePool::new(4);
        track_alloc();
        let kept = Page::new(&pool).unwrap();
        let freed = Page::new(&pool).unwrap();
        drop(freed);
        core::mem::forget(kept);
        validate_alloc();
    }
}
