//! # rxpool
//!
//! Receive-side buffer pool for Homa-style RPC transports.
//!
//! An RPC transport that delivers messages into user-visible memory needs
//! to carve buffer space out of a fixed region, per incoming message, on
//! every core, without a global lock. rxpool implements that allocator:
//! the region is split into fixed-size *bpages* (64 KiB), whole bpages
//! back the body of a message, and sub-bpage tails are packed together
//! into per-core partial pages held under revocable leases.
//!
//! ## Features
//!
//! - **Fixed region, index-based**: messages reference buffer space by
//!   integer offsets, never pointers, so message lifetime and pool
//!   lifetime stay untangled
//! - **Per-core partial pages**: small tails from one core pack into the
//!   same bpage, with a lease so idle cores cannot strand half-used pages
//! - **Lock-skipping scans**: fresh pages are found by a cursor walk with
//!   trylock only; a contended page is someone else's page
//! - **O(1) admission**: one atomic counter decides whether a request
//!   fits before any descriptor is touched
//!
//! ## Quick Start
//!
//! ```rust
//! use rxpool::{BufferPool, HeapRegion, MessageBuffers, PoolConfig, BPAGE_SIZE};
//!
//! let region = HeapRegion::new(64 * BPAGE_SIZE)?;
//! let pool = BufferPool::new(region, PoolConfig::default())?;
//!
//! let mut msg = MessageBuffers::new(150_000);
//! pool.allocate(&mut msg)?;
//! // ... copy packet data through pool.get_buffer(&msg, offset) ...
//! pool.release_buffers(msg.offsets());
//! # Ok::<(), rxpool::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod region;

mod cores;
mod descriptor;

pub use clock::{Clock, ClockTime, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use message::MessageBuffers;
pub use pool::{BufferPool, PoolConfig, PoolStats};
pub use region::{HeapRegion, Region};

/// Log2 of the bpage size.
pub const BPAGE_SHIFT: u32 = 16;

/// Size of one bpage: the granularity at which the pool carves its region.
pub const BPAGE_SIZE: usize = 1 << BPAGE_SHIFT;

/// Smallest usable pool, in bpages.
pub const MIN_BPAGES: usize = 4;

/// Largest message the transport delivers.
pub const MAX_MESSAGE_LENGTH: usize = 1_000_000;

/// Capacity of a message's bpage-offset list.
pub const MAX_MESSAGE_BPAGES: usize = MAX_MESSAGE_LENGTH.div_ceil(BPAGE_SIZE) + 1;
