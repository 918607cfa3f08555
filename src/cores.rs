//! Per-core allocation state.
//!
//! Each core slot caches the partially-filled bpage that core is currently
//! appending small messages into, plus the cursor its page scans resume
//! from. Slots are cache-line sized so cores do not false-share.
//!
//! In userspace there is no hardware CPU identity to key on, so threads
//! are sharded onto slots: each thread gets a stable id from a global
//! counter, reduced modulo the pool's slot count. Correctness never
//! depends on exclusivity (every slot field is only ever a hint that is
//! re-verified against descriptor state), but threads rarely sharing a
//! slot keeps the partial-page reuse rate high.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: usize = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
}

/// The core slot index for the calling thread, in `[0, num_cores)`.
pub(crate) fn current_core(num_cores: usize) -> usize {
    THREAD_SLOT.with(|slot| slot % num_cores)
}

/// Allocation state for one core.
#[repr(align(64))]
pub(crate) struct CoreSlot {
    /// Bpage this core last carved a partial allocation from.
    ///
    /// Only a hint: the page is reusable only if its descriptor still
    /// names this core as owner.
    pub(crate) page_hint: AtomicU32,
    /// Bytes already assigned inside the hinted bpage.
    pub(crate) allocated: AtomicU32,
    /// Where this core's next page scan starts.
    pub(crate) next_candidate: AtomicU32,
}

impl CoreSlot {
    pub(crate) fn new() -> Self {
        Self {
            page_hint: AtomicU32::new(0),
            allocated: AtomicU32::new(0),
            next_candidate: AtomicU32::new(0),
        }
    }
}
