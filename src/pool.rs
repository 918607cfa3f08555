//! The receive buffer pool.
//!
//! A [`BufferPool`] carves a caller-supplied region into fixed-size
//! *bpages* and hands out buffer space for incoming messages. Full bpages
//! are claimed outright; the sub-bpage tail of a message is packed into a
//! *partial* bpage that the allocating core keeps appending to across
//! messages, under a time-bounded lease. Expired leases are stolen by
//! whichever scan finds them, so an idle core cannot strand a page.
//!
//! # Concurrency
//!
//! There is no pool-wide lock. Each bpage descriptor has its own mutex,
//! taken only via trylock on the allocation path and held for a handful of
//! atomic writes. A single atomic counter of free bpages serves as the
//! admission gate: `get_pages` reserves the whole request up front and is
//! then guaranteed to find the pages, which keeps admission decisions
//! O(1) even when the scan has to hunt.
//!
//! # Example
//!
//! ```rust
//! use rxpool::{BufferPool, HeapRegion, MessageBuffers, PoolConfig, BPAGE_SIZE};
//!
//! let region = HeapRegion::new(64 * BPAGE_SIZE)?;
//! let pool = BufferPool::new(region, PoolConfig::default())?;
//!
//! // Reserve space for a 150 KB incoming message.
//! let mut msg = MessageBuffers::new(150_000);
//! pool.allocate(&mut msg)?;
//!
//! // Resolve a byte offset within the message to memory.
//! let (ptr, available) = pool.get_buffer(&msg, 0);
//! assert!(available <= BPAGE_SIZE);
//! let _ = ptr;
//!
//! // Hand the space back once the message is consumed.
//! pool.release_buffers(msg.offsets());
//! # Ok::<(), rxpool::Error>(())
//! ```

use crate::clock::{Clock, ClockTime, SystemClock};
use crate::cores::{current_core, CoreSlot};
use crate::descriptor::{BpageDescriptor, UNOWNED};
use crate::error::{Error, Result};
use crate::message::MessageBuffers;
use crate::metrics;
use crate::region::Region;
use crate::{BPAGE_SHIFT, BPAGE_SIZE, MAX_MESSAGE_BPAGES, MIN_BPAGES};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Slack added to the page-scan limit so a nearly-empty pool still looks
/// at a few candidates past the used population.
const MIN_EXTRA: u32 = 4;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a [`BufferPool`].
///
/// # Example
///
/// ```rust
/// use rxpool::{ClockTime, PoolConfig};
///
/// let config = PoolConfig {
///     lease: ClockTime::from_millis(50),
///     ..PoolConfig::default()
/// };
/// ```
#[derive(Clone)]
pub struct PoolConfig {
    /// How long a core may sit on a partially-filled bpage before any
    /// other allocation is allowed to steal it.
    pub lease: ClockTime,
    /// Number of per-core allocation slots. Defaults to the machine's
    /// available parallelism; threads are sharded onto slots.
    pub num_cores: usize,
    /// Time source used for lease expiry.
    pub clock: Arc<dyn Clock>,
    /// Invoked (edge-triggered) when free bpages reappear after an
    /// allocation has failed. The pool passes no data and schedules
    /// nothing; wake the parked readers however suits the transport.
    pub on_free: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lease: ClockTime::from_millis(10),
            num_cores: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            clock: Arc::new(SystemClock::new()),
            on_free: None,
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("lease", &self.lease)
            .field("num_cores", &self.num_cores)
            .field("clock", &self.clock.name())
            .field("on_free", &self.on_free.is_some())
            .finish()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about pool usage.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total bpages in the pool.
    pub num_bpages: usize,
    /// Bpages currently free.
    pub free_bpages: usize,
    /// Successful message allocations.
    pub allocations: u64,
    /// Allocations rejected for lack of free bpages.
    pub failed_allocations: u64,
    /// Owned bpages restarted from offset zero after their slices were
    /// all released.
    pub bpage_reuses: u64,
    /// Bpages reclaimed from expired leases.
    pub bpage_steals: u64,
}

/// Internal statistics tracking.
struct PoolStatsInner {
    allocations: AtomicU64,
    failed_allocations: AtomicU64,
    bpage_reuses: AtomicU64,
    bpage_steals: AtomicU64,
}

impl PoolStatsInner {
    fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
            bpage_reuses: AtomicU64::new(0),
            bpage_steals: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// BufferPool
// ============================================================================

/// A pool of receive bpages carved from one contiguous region.
///
/// Created per socket by the transport. All operations take `&self` and
/// may be called concurrently from any thread; see the module docs for
/// the locking model.
pub struct BufferPool {
    /// The backing region, `None` once destroyed.
    region: Option<Box<dyn Region>>,
    /// Number of bpages in the region.
    num_bpages: usize,
    /// One descriptor per bpage.
    descriptors: Box<[BpageDescriptor]>,
    /// Per-core allocation state.
    cores: Box<[CoreSlot]>,
    /// Approximate count of free bpages; the admission gate.
    ///
    /// Signed: admission subtracts first and asks questions later, so the
    /// value dips below zero under contention.
    free_bpages: AtomicI64,
    /// Set when an allocation fails; armed edge-trigger for `on_free`.
    wakeup_pending: AtomicBool,
    /// Lease duration for partial-page owners.
    lease: ClockTime,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Free-pages-available hook.
    on_free: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Usage counters.
    stats: PoolStatsInner,
}

impl BufferPool {
    /// Create a pool over `region`.
    ///
    /// The region base must be aligned to [`BPAGE_SIZE`] and its length
    /// must be a multiple of [`BPAGE_SIZE`] covering at least
    /// [`MIN_BPAGES`] bpages.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the region or config is unusable;
    /// [`Error::OutOfMemory`] if the descriptor or per-core tables cannot
    /// be allocated.
    pub fn new(region: impl Region + 'static, config: PoolConfig) -> Result<Self> {
        let PoolConfig {
            lease,
            num_cores,
            clock,
            on_free,
        } = config;

        let base = region.as_ptr().as_ptr() as usize;
        let len = region.len();
        if base % BPAGE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "region base {base:#x} is not aligned to the bpage size ({BPAGE_SIZE})"
            )));
        }
        if len == 0 || len % BPAGE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "region length {len} is not a non-zero multiple of the bpage size ({BPAGE_SIZE})"
            )));
        }
        let num_bpages = len / BPAGE_SIZE;
        if num_bpages < MIN_BPAGES {
            return Err(Error::InvalidArgument(format!(
                "region holds {num_bpages} bpages, need at least {MIN_BPAGES}"
            )));
        }
        // Message descriptors store region offsets as u32.
        if num_bpages > (u32::MAX >> BPAGE_SHIFT) as usize {
            return Err(Error::InvalidArgument(format!(
                "region of {len} bytes cannot be addressed with 32-bit offsets"
            )));
        }
        if num_cores == 0 {
            return Err(Error::InvalidArgument(
                "num_cores must be at least 1".into(),
            ));
        }

        let descriptors = try_alloc_table(num_bpages, BpageDescriptor::new)?;
        let cores = try_alloc_table(num_cores, CoreSlot::new)?;

        tracing::debug!(
            "created buffer pool: {} bpages of {} bytes, {} core slots, lease {}",
            num_bpages,
            BPAGE_SIZE,
            num_cores,
            lease
        );

        Ok(Self {
            region: Some(Box::new(region)),
            num_bpages,
            descriptors,
            cores,
            free_bpages: AtomicI64::new(num_bpages as i64),
            wakeup_pending: AtomicBool::new(false),
            lease,
            clock,
            on_free,
            stats: PoolStatsInner::new(),
        })
    }

    /// Tear the pool down, dropping the region and all descriptor state.
    ///
    /// Idempotent; also runs on drop. After destruction,
    /// [`release_buffers`](Self::release_buffers) becomes a no-op and
    /// [`allocate`](Self::allocate) fails, so teardown can race late
    /// message cleanup.
    pub fn destroy(&mut self) {
        if self.region.take().is_none() {
            return;
        }
        self.descriptors = Box::default();
        self.cores = Box::default();
        self.free_bpages.store(0, Ordering::Release);
        tracing::debug!("destroyed buffer pool ({} bpages)", self.num_bpages);
    }

    /// Total bpages in the pool.
    #[inline]
    pub fn num_bpages(&self) -> usize {
        self.num_bpages
    }

    /// Bpages currently free (approximate under concurrency).
    #[inline]
    pub fn free_bpages(&self) -> usize {
        self.free_bpages.load(Ordering::Acquire).max(0) as usize
    }

    /// Snapshot of usage statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            num_bpages: self.num_bpages,
            free_bpages: self.free_bpages(),
            allocations: self.stats.allocations.load(Ordering::Relaxed),
            failed_allocations: self.stats.failed_allocations.load(Ordering::Relaxed),
            bpage_reuses: self.stats.bpage_reuses.load(Ordering::Relaxed),
            bpage_steals: self.stats.bpage_steals.load(Ordering::Relaxed),
        }
    }

    /// Claim `num_pages` fresh bpages, writing their indices into `pages`.
    ///
    /// With `set_owner`, the caller's core becomes the owner of each page
    /// (refs biased to 2: lease plus the slice about to be carved);
    /// otherwise pages come back unowned with refs 1.
    ///
    /// Never returns fewer than `num_pages` pages on success: the atomic
    /// reservation up front either admits the whole request or rejects it
    /// without touching any descriptor.
    pub(crate) fn get_pages(
        &self,
        num_pages: usize,
        pages: &mut [u32],
        set_owner: bool,
    ) -> Result<()> {
        debug_assert!(num_pages <= pages.len());
        let core_id = current_core(self.cores.len());
        let core = &self.cores[core_id];
        let now = self.clock.now();

        // The sole admission gate. Past it, the scan is committed to
        // producing the pages, stealing expired leases if it must.
        if self.free_bpages.fetch_sub(num_pages as i64, Ordering::AcqRel) < num_pages as i64 {
            self.free_bpages.fetch_add(num_pages as i64, Ordering::AcqRel);
            return Err(Error::NotEnoughFree);
        }

        let mut claimed = 0;
        let mut limit: u32 = 0;
        while claimed < num_pages {
            // When much of the pool is free, confine the scan to the low
            // end of the ring so long-lived allocations collapse into the
            // lowest bpages. Recomputed on every wrap: concurrent
            // allocations may have grown the used population.
            if limit == 0 {
                let free = self.free_bpages.load(Ordering::Acquire);
                let used =
                    (self.num_bpages as i64 - free).clamp(0, self.num_bpages as i64) as u32;
                let extra = (used / 4).max(MIN_EXTRA);
                limit = (used + extra).min(self.num_bpages as u32);
            }

            let cur = core.next_candidate.load(Ordering::Relaxed);
            core.next_candidate.store(cur + 1, Ordering::Relaxed);
            if cur >= limit {
                core.next_candidate.store(0, Ordering::Relaxed);
                limit = 0;
                continue;
            }
            let desc = &self.descriptors[cur as usize];

            // Unlocked filter; possibly stale, so the result is re-checked
            // under the lock before acting on it.
            if !desc.claimable(now) {
                continue;
            }
            // Never wait for a bpage: a contended candidate is skipped.
            let Some(guard) = desc.try_lock() else {
                continue;
            };
            if !desc.claimable(now) {
                continue;
            }

            let prev_owner = desc.owner.load(Ordering::Relaxed);
            if prev_owner != UNOWNED {
                // Stealing an expired lease. This page was not free when
                // the admission gate charged for it, so restore one unit.
                self.free_bpages.fetch_add(1, Ordering::AcqRel);
                self.stats.bpage_steals.fetch_add(1, Ordering::Relaxed);
                metrics::record_bpage_steal();
                tracing::trace!(
                    "stole bpage {} from core {} (lease expired)",
                    cur,
                    prev_owner
                );
            }
            if set_owner {
                desc.refs.store(2, Ordering::Release);
                desc.owner.store(core_id as i32, Ordering::Release);
                desc.expiration
                    .store(now.saturating_add(self.lease).nanos(), Ordering::Release);
            } else {
                desc.refs.store(1, Ordering::Release);
                desc.owner.store(UNOWNED, Ordering::Release);
            }
            drop(guard);

            pages[claimed] = cur;
            claimed += 1;
        }
        Ok(())
    }

    /// Reserve buffer space for an incoming message.
    ///
    /// On success `msg` holds one region offset per backing bpage: whole
    /// bpages for the body, and for a sub-bpage tail either a slice of
    /// this core's partial page or a freshly-owned page. On
    /// [`Error::NotEnoughFree`] every claim made along the way has been
    /// rolled back and `msg` is left empty.
    pub fn allocate(&self, msg: &mut MessageBuffers) -> Result<()> {
        msg.clear();
        if self.region.is_none() {
            return Err(Error::NotEnoughFree);
        }

        let full_pages = msg.length() >> BPAGE_SHIFT;
        let partial = msg.length() & (BPAGE_SIZE - 1);

        let mut pages = [0u32; MAX_MESSAGE_BPAGES];
        if full_pages > 0 {
            if self
                .get_pages(full_pages, &mut pages[..full_pages], false)
                .is_err()
            {
                return self.out_of_space(msg);
            }
            for &page in &pages[..full_pages] {
                msg.push_offset(page << BPAGE_SHIFT);
            }
        }

        if partial > 0 {
            let core_id = current_core(self.cores.len());
            if let Some(offset) = self.append_to_owned_page(core_id, partial) {
                msg.push_offset(offset);
            } else {
                let mut fresh = [0u32; 1];
                if self.get_pages(1, &mut fresh, true).is_err() {
                    return self.out_of_space(msg);
                }
                let core = &self.cores[core_id];
                core.page_hint.store(fresh[0], Ordering::Relaxed);
                core.allocated.store(partial as u32, Ordering::Relaxed);
                msg.push_offset(fresh[0] << BPAGE_SHIFT);
            }
        }

        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Try to carve `partial` bytes from the bpage this core is already
    /// filling. Returns the region offset of the slice on success.
    fn append_to_owned_page(&self, core_id: usize, partial: usize) -> Option<u32> {
        let core = &self.cores[core_id];
        let hint = core.page_hint.load(Ordering::Relaxed);
        let desc = &self.descriptors[hint as usize];

        let guard = desc.try_lock()?;
        if desc.owner.load(Ordering::Relaxed) != core_id as i32 {
            // Stolen since we last appended; the hint is stale.
            return None;
        }

        let mut allocated = core.allocated.load(Ordering::Relaxed) as usize;
        if allocated + partial > BPAGE_SIZE {
            if desc.refs.load(Ordering::Relaxed) == 1 {
                // Every slice carved from this page has been released;
                // only our lease token remains. Start it over.
                allocated = 0;
                self.stats.bpage_reuses.fetch_add(1, Ordering::Relaxed);
                metrics::record_bpage_reuse();
            } else {
                // No room left and live slices remain: give up the lease
                // and let the page drain to free as they are released.
                desc.owner.store(UNOWNED, Ordering::Release);
                desc.refs.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
        }

        desc.refs.fetch_add(1, Ordering::AcqRel);
        desc.expiration.store(
            self.clock.now().saturating_add(self.lease).nanos(),
            Ordering::Release,
        );
        drop(guard);

        core.allocated.store((allocated + partial) as u32, Ordering::Relaxed);
        Some((hint << BPAGE_SHIFT) + allocated as u32)
    }

    /// Roll back a partly-built allocation and report the failure.
    fn out_of_space(&self, msg: &mut MessageBuffers) -> Result<()> {
        if !msg.is_empty() {
            self.release_buffers(msg.offsets());
            msg.clear();
        }
        self.stats.failed_allocations.fetch_add(1, Ordering::Relaxed);
        self.wakeup_pending.store(true, Ordering::Release);
        metrics::record_alloc_failure();
        tracing::trace!(
            "allocation of {} bytes failed: not enough free bpages",
            msg.length()
        );
        Err(Error::NotEnoughFree)
    }

    /// Resolve a byte offset within `msg` to memory.
    ///
    /// Returns the pointer and the number of contiguous valid bytes from
    /// it (to the end of the bpage, or to the end of the message on its
    /// last bpage). Pure arithmetic on immutable message state; no
    /// locking.
    ///
    /// # Panics
    ///
    /// Panics if `offset` lies beyond the bpages backing `msg`, or if the
    /// pool has been destroyed.
    pub fn get_buffer(&self, msg: &MessageBuffers, offset: usize) -> (NonNull<u8>, usize) {
        let Some(region) = self.region.as_deref() else {
            panic!("get_buffer on a destroyed pool");
        };
        let index = offset >> BPAGE_SHIFT;
        let within = offset & (BPAGE_SIZE - 1);
        assert!(
            index < msg.num_bpages(),
            "offset {offset} beyond the {} bpages backing the message",
            msg.num_bpages()
        );

        let tail = msg.length() & (BPAGE_SIZE - 1);
        let available = if index + 1 < msg.num_bpages() || tail == 0 {
            BPAGE_SIZE - within
        } else {
            tail - within
        };

        let region_offset = msg.offsets()[index] as usize + within;
        debug_assert!(region_offset < region.len());
        // SAFETY: region_offset stays inside the region allocation, so
        // the sum is in bounds and non-null.
        let ptr =
            unsafe { NonNull::new_unchecked(region.as_ptr().as_ptr().add(region_offset)) };
        (ptr, available)
    }

    /// Return message buffer space to the pool.
    ///
    /// `offsets` is the list recorded by a successful
    /// [`allocate`](Self::allocate) (see
    /// [`MessageBuffers::offsets`]). Each referenced bpage loses one
    /// reference; pages that reach zero references with no owner become
    /// free again. A no-op on a destroyed pool so that RPC teardown can
    /// race socket teardown.
    pub fn release_buffers(&self, offsets: &[u32]) {
        if self.region.is_none() {
            return;
        }
        let mut freed = false;
        for &offset in offsets {
            let index = (offset >> BPAGE_SHIFT) as usize;
            let desc = &self.descriptors[index];
            let guard = desc.lock();
            let refs = desc.refs.fetch_sub(1, Ordering::AcqRel) - 1;
            debug_assert!(refs >= 0, "bpage {index} released more times than referenced");
            if refs == 0 && desc.owner.load(Ordering::Relaxed) == UNOWNED {
                self.free_bpages.fetch_add(1, Ordering::AcqRel);
                freed = true;
            }
            drop(guard);
        }
        if freed {
            metrics::record_free_bpages(self.free_bpages());
            self.check_waiting();
        }
    }

    /// Fire the `on_free` hook if free bpages are available and an
    /// allocation has failed since the last firing.
    ///
    /// Called internally after releases that free pages; exposed so the
    /// transport can also poke the pool after batch cleanup.
    pub fn check_waiting(&self) {
        if !self.wakeup_pending.load(Ordering::Acquire) {
            return;
        }
        if self.free_bpages.load(Ordering::Acquire) <= 0 {
            return;
        }
        if self.wakeup_pending.swap(false, Ordering::AcqRel) {
            if let Some(hook) = &self.on_free {
                hook();
            }
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("num_bpages", &self.num_bpages)
            .field("free_bpages", &self.free_bpages())
            .field("destroyed", &self.region.is_none())
            .finish()
    }
}

/// Allocate a boxed table without aborting on allocator exhaustion.
fn try_alloc_table<T>(len: usize, init: impl Fn() -> T) -> Result<Box<[T]>> {
    let mut table: Vec<T> = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(format!("could not allocate {len}-entry pool table")))?;
    table.extend(std::iter::repeat_with(init).take(len));
    Ok(table.into_boxed_slice())
}
