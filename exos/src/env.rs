//! Environment abstraction, the unit of protection and scheduling.
//!
//! ## The environment model
//!
//! An environment pairs an address space with a single thread of user
//! control. Environments form a tree: every environment except the ones the
//! kernel spawns at boot has a parent, and an environment may manipulate the
//! address space and status of itself and of its immediate children only.
//!
//! Environments are named by an [`EnvId`]. The low bits of an id index the
//! environment table and the high bits are a generation counter, so an id of
//! a destroyed environment never names the environment that later reuses its
//! slot.
use crate::{
    UserEnv,
    mm::{FramePool, page_table::PageTable},
    spinlock::SpinLock,
};
use abyss::UTrapframe;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

/// Number of low bits of an [`EnvId`] that index the environment table.
pub const ENVGENSHIFT: u32 = 12;

/// Identifier of an environment.
///
/// [`EnvId::SELF`] (`0`) is never assigned to an environment; system calls
/// interpret it as the calling environment.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(u32);

impl EnvId {
    /// Alias of the calling environment.
    pub const SELF: EnvId = EnvId(0);

    /// Build an id from its raw system call encoding.
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        EnvId(raw as u32)
    }

    /// The raw system call encoding of this id.
    #[inline]
    pub const fn into_raw(self) -> i32 {
        self.0 as i32
    }

    /// Index of this id in the environment table.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & ((1 << ENVGENSHIFT) - 1)) as usize
    }
}

impl core::fmt::Debug for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A possible state of the environment.
#[derive(Clone, Copy, Eq, PartialEq, Debug, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(usize)]
pub enum EnvStatus {
    /// The slot is unused.
    Free = 0,
    /// The environment is being torn down.
    Dying = 1,
    /// The environment is waiting for the scheduler.
    Runnable = 2,
    /// The environment is running.
    Running = 3,
    /// The environment exists but must not be scheduled.
    NotRunnable = 4,
}

/// A user-level page-fault handler.
///
/// The kernel calls the upcall with the faulting environment's handle and
/// the fault record it pushed onto the exception stack. Returning from the
/// upcall retries the faulting access.
pub type Upcall = fn(&UserEnv<'_>, &UTrapframe);

/// The code an environment runs when it is first scheduled.
///
/// The returned value becomes the environment's exit code.
pub type Entry = Box<dyn for<'k> FnOnce(&UserEnv<'k>) -> i32 + Send>;

/// A read-only snapshot of an environment.
///
/// This is what user code sees through its `thisenv` window.
#[derive(Clone, Copy, Debug)]
pub struct EnvInfo {
    /// The environment's id.
    pub id: EnvId,
    /// The id of the environment that created it, [`EnvId::SELF`] if none.
    pub parent_id: EnvId,
    /// The scheduling status.
    pub status: EnvStatus,
    /// The registered page-fault upcall.
    pub pgfault_upcall: Option<Upcall>,
    /// Number of page faults delivered to the upcall so far.
    pub pgfaults: usize,
    /// Number of times the environment has been scheduled.
    pub runs: usize,
}

/// An environment.
pub struct Env {
    /// The environment's id.
    pub id: EnvId,
    /// The id of the environment that created it.
    pub parent_id: EnvId,
    status: SpinLock<EnvStatus>,
    pub(crate) page_table: SpinLock<PageTable>,
    upcall: SpinLock<Option<Upcall>>,
    entry: SpinLock<Option<Entry>>,
    pub(crate) in_upcall: AtomicBool,
    pgfaults: AtomicUsize,
    runs: AtomicUsize,
}

impl Env {
    fn new(id: EnvId, parent_id: EnvId, pool: &Arc<FramePool>, entry: Entry) -> Self {
        Env {
            id,
            parent_id,
            status: SpinLock::new(EnvStatus::NotRunnable),
            page_table: SpinLock::new(PageTable::new(pool)),
            upcall: SpinLock::new(None),
            entry: SpinLock::new(Some(entry)),
            in_upcall: AtomicBool::new(false),
            pgfaults: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    /// Get the current status.
    pub fn status(&self) -> EnvStatus {
        let guard = self.status.lock();
        let status = *guard;
        guard.unlock();
        status
    }

    /// Set the status, returning the previous one.
    pub(crate) fn set_status(&self, status: EnvStatus) -> EnvStatus {
        let mut guard = self.status.lock();
        let prev = core::mem::replace(&mut *guard, status);
        guard.unlock();
        prev
    }

    /// Get the registered page-fault upcall.
    pub fn upcall(&self) -> Option<Upcall> {
        let guard = self.upcall.lock();
        let upcall = *guard;
        guard.unlock();
        upcall
    }

    pub(crate) fn set_upcall(&self, upcall: Upcall) {
        let mut guard = self.upcall.lock();
        *guard = Some(upcall);
        guard.unlock();
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        let mut guard = self.entry.lock();
        let entry = guard.take();
        guard.unlock();
        entry
    }

    pub(crate) fn count_pgfault(&self) {
        self.pgfaults.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn count_run(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    /// Take a snapshot of this environment.
    pub fn info(&self) -> EnvInfo {
        EnvInfo {
            id: self.id,
            parent_id: self.parent_id,
            status: self.status(),
            pgfault_upcall: self.upcall(),
            pgfaults: self.pgfaults.load(Ordering::SeqCst),
            runs: self.runs.load(Ordering::SeqCst),
        }
    }
}

struct EnvSlot {
    last_id: EnvId,
    env: Option<Arc<Env>>,
}

/// The environment table.
pub(crate) struct EnvTable {
    slots: Vec<EnvSlot>,
    free: VecDeque<usize>,
}

impl EnvTable {
    pub(crate) fn new(max_envs: usize) -> Self {
        EnvTable {
            slots: (0..max_envs)
                .map(|_| EnvSlot {
                    last_id: EnvId::SELF,
                    env: None,
                })
                .collect(),
            free: (0..max_envs).collect(),
        }
    }

    /// Allocate a slot and create a not-runnable environment in it.
    pub(crate) fn alloc(
        &mut self,
        parent_id: EnvId,
        pool: &Arc<FramePool>,
        entry: Entry,
    ) -> Option<Arc<Env>> {
        let index = self.free.pop_front()?;
        let slot = &mut self.slots[index];
        let mut generation = slot.last_id.0.wrapping_add(1 << ENVGENSHIFT) & !((1 << ENVGENSHIFT) - 1);
        if generation as i32 <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        let id = EnvId(generation | index as u32);
        let env = Arc::new(Env::new(id, parent_id, pool, entry));
        slot.last_id = id;
        slot.env = Some(env.clone());
        Some(env)
    }

    pub(crate) fn get(&self, id: EnvId) -> Option<Arc<Env>> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.env.as_ref())
            .filter(|env| env.id == id)
            .cloned()
    }

    pub(crate) fn remove(&mut self, id: EnvId) -> Option<Arc<Env>> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.env.as_ref().is_some_and(|env| env.id == id) {
            self.free.push_back(id.index());
            slot.env.take()
        } else {
            None
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<Env>> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(env) = slot.env.take() {
                self.free.push_back(index);
                out.push(env);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Entry {
        Box::new(|_: &UserEnv<'_>| 0)
    }

    #[test]
    fn generation_changes_on_reuse() {
        let pool = FramePool::new(4);
        let mut table = EnvTable::new(1);
        let first = table.alloc(EnvId::SELF, &pool, entry()).unwrap();
        assert!(table.alloc(EnvId::SELF, &pool, entry()).is_none());
        let first_id = first.id;
        assert_eq!(first_id.index(), 0);
        assert_ne!(first_id, EnvId::SELF);
        assert!(table.remove(first_id).is_some());
        assert!(table.remove(first_id).is_none());

        let second = table.alloc(first_id, &pool, entry()).unwrap();
        assert_eq!(second.id.index(), 0);
        assert_ne!(second.id, first_id);
        assert!(table.get(first_id).is_none());
        assert_eq!(table.get(second.id).unwrap().parent_id, first_id);
    }

    #[test]
    fn new_env_is_not_runnable() {
        let pool = FramePool::new(4);
        let mut table = EnvTable::new(4);
        let env = table.alloc(EnvId::SELF, &pool, entry()).unwrap();
        let info = env.info();
        assert_eq!(info.status, EnvStatus::NotRunnable);
        assert!(info.pgfault_upcall.is_none());
        assert_eq!(info.pgfaults, 0);
        assert!(env.take_entry().is_some());
        assert!(env.take_entry().is_none());
        assert_eq!(EnvStatus::try_from(2usize).ok(), Some(EnvStatus::Runnable));
    }
}
