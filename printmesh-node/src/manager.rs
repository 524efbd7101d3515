//! Thread-safe manager pattern shared by every stateful subsystem
//!
//! A [`Manager`] owns one piece of shared mutable state:
//! - the mutex is created lazily by [`Manager::begin`] (idempotent), never at construction
//! - every access goes through a [`ManagerGuard`] obtained with an explicit timeout
//! - the guard releases the lock on every exit path, including `?` early returns
//! - guards are `!Send`, so a lock can never be held across an `.await` in a spawned task
//!
//! Lock ordering: each manager carries a [`LockRank`]. A thread may only take a
//! lock whose rank is strictly greater than every lock it already holds. The
//! order is defined once in [`rank`] and checked at runtime on every
//! acquisition; a violation (including re-entering the same manager) fails
//! with [`NodeError::LockOrder`] instead of deadlocking.

use crate::error::{NodeError, NodeResult};
use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;
use std::time::Duration;

/// Timeout used by public manager operations when the caller has no opinion.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Position of a manager in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockRank(u8);

impl LockRank {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

/// The single global lock order. Lower ranks are taken first.
pub mod rank {
    use super::LockRank;

    pub const CONFIG: LockRank = LockRank::new(10);
    pub const PRESENCE: LockRank = LockRank::new(20);
    pub const CONNECTION: LockRank = LockRank::new(30);
    pub const REGISTRY: LockRank = LockRank::new(40);
}

thread_local! {
    static HELD: RefCell<Vec<(LockRank, &'static str)>> = const { RefCell::new(Vec::new()) };
}

fn check_order(requested: LockRank, name: &'static str) -> NodeResult<()> {
    HELD.with(|held| {
        let held = held.borrow();
        match held.iter().max_by_key(|(rank, _)| *rank) {
            Some(&(top, top_name)) if top >= requested => Err(NodeError::LockOrder {
                requested: name,
                held: top_name,
            }),
            _ => Ok(()),
        }
    })
}

fn record_acquired(rank: LockRank, name: &'static str) {
    HELD.with(|held| held.borrow_mut().push((rank, name)));
}

fn record_released(rank: LockRank, name: &'static str) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|&(r, n)| r == rank && n == name) {
            held.remove(pos);
        }
    });
}

/// One shared resource plus its lazily created lock.
pub struct Manager<T> {
    name: &'static str,
    rank: LockRank,
    cell: OnceLock<Mutex<T>>,
}

impl<T> Manager<T> {
    pub const fn new(name: &'static str, rank: LockRank) -> Self {
        Self {
            name,
            rank,
            cell: OnceLock::new(),
        }
    }

    /// Create the lock and initial state. Returns `false` if already initialized,
    /// in which case `init` is not called.
    pub fn begin(&self, init: impl FnOnce() -> T) -> bool {
        let mut created = false;
        self.cell.get_or_init(|| {
            created = true;
            Mutex::new(init())
        });
        created
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    /// Acquire the lock. `None` waits without bound.
    pub fn lock(&self, timeout: Option<Duration>) -> NodeResult<ManagerGuard<'_, T>> {
        let mutex = self
            .cell
            .get()
            .ok_or(NodeError::NotInitialized { manager: self.name })?;

        check_order(self.rank, self.name)?;

        let guard = match timeout {
            None => mutex.lock(),
            Some(limit) => mutex
                .try_lock_for(limit)
                .ok_or(NodeError::LockTimeout { manager: self.name })?,
        };

        record_acquired(self.rank, self.name);
        Ok(ManagerGuard {
            guard,
            rank: self.rank,
            name: self.name,
        })
    }

    /// Run `f` with the state locked; the lock never escapes the closure.
    pub fn with<R>(&self, timeout: Option<Duration>, f: impl FnOnce(&mut T) -> R) -> NodeResult<R> {
        let mut guard = self.lock(timeout)?;
        Ok(f(&mut guard))
    }
}

impl<T> std::fmt::Debug for Manager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("name", &self.name)
            .field("rank", &self.rank)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Scope-bound proof that the manager lock is held.
pub struct ManagerGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    rank: LockRank,
    name: &'static str,
}

impl<T> ManagerGuard<'_, T> {
    pub fn manager_name(&self) -> &'static str {
        self.name
    }
}

impl<T> Deref for ManagerGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ManagerGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ManagerGuard<'_, T> {
    fn drop(&mut self) {
        record_released(self.rank, self.name);
    }
}
