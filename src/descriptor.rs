//! Per-bpage descriptors.

use crate::clock::ClockTime;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Owner value meaning "no core may append to this bpage".
pub(crate) const UNOWNED: i32 = -1;

/// State of one bpage.
///
/// A bpage moves between three stable states:
/// - free: `refs == 0`, `owner == UNOWNED`
/// - owned partial: `refs >= 1`, `owner` is a core id; one ref unit is the
///   owner's lease, the rest are message slices carved from the page
/// - shared full: `refs >= 1`, `owner == UNOWNED`; no more bytes can be
///   appended
///
/// All state transitions happen while holding `lock`. The atomics exist so
/// the page scan can read `refs`/`owner`/`expiration` without the lock as
/// a cheap filter; such reads are hints and must be re-verified under the
/// lock before acting on them.
pub(crate) struct BpageDescriptor {
    /// Guards state transitions. Taken via trylock on the allocation path.
    lock: Mutex<()>,
    /// Live references: message slices, plus one for an owner's lease.
    pub(crate) refs: AtomicI32,
    /// Core currently allowed to append, or [`UNOWNED`].
    pub(crate) owner: AtomicI32,
    /// When `owner`'s claim becomes stealable (nanoseconds).
    pub(crate) expiration: AtomicU64,
}

impl BpageDescriptor {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            refs: AtomicI32::new(0),
            owner: AtomicI32::new(UNOWNED),
            expiration: AtomicU64::new(0),
        }
    }

    /// Try to lock the descriptor without blocking.
    ///
    /// The allocation path never waits for a bpage: one skipped candidate
    /// is cheaper than a stall.
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.try_lock().ok()
    }

    /// Lock the descriptor, waiting if needed (release path only).
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether this page could satisfy a fresh-page claim right now:
    /// either free, or holding an expired lease with no live slices.
    ///
    /// Callable without the lock as a scan filter; the result is stale the
    /// moment it is produced, and claiming requires re-checking under the
    /// lock.
    pub(crate) fn claimable(&self, now: ClockTime) -> bool {
        let refs = self.refs.load(Ordering::Acquire);
        if refs == 0 {
            return true;
        }
        if refs != 1 {
            return false;
        }
        self.owner.load(Ordering::Acquire) != UNOWNED
            && ClockTime::from_nanos(self.expiration.load(Ordering::Acquire)) < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_starts_free() {
        let desc = BpageDescriptor::new();
        assert_eq!(desc.refs.load(Ordering::Acquire), 0);
        assert_eq!(desc.owner.load(Ordering::Acquire), UNOWNED);
        assert!(desc.claimable(ClockTime::ZERO));
    }

    #[test]
    fn test_descriptor_claimable() {
        let now = ClockTime::from_nanos(1000);
        let desc = BpageDescriptor::new();

        // Shared page with live references: not claimable.
        desc.refs.store(2, Ordering::Release);
        assert!(!desc.claimable(now));

        // Owned with an unexpired lease: not claimable.
        desc.refs.store(1, Ordering::Release);
        desc.owner.store(3, Ordering::Release);
        desc.expiration.store(1001, Ordering::Release);
        assert!(!desc.claimable(now));

        // Lease expired and no slices left: stealable.
        desc.expiration.store(999, Ordering::Release);
        assert!(desc.claimable(now));

        // Unowned with one live slice: just a busy shared page.
        desc.owner.store(UNOWNED, Ordering::Release);
        assert!(!desc.claimable(now));
    }

    #[test]
    fn test_descriptor_try_lock() {
        let desc = BpageDescriptor::new();
        let guard = desc.try_lock().unwrap();
        assert!(desc.try_lock().is_none());
        drop(guard);
        assert!(desc.try_lock().is_some());
    }
}
