//! Clock and time types for lease expiration.
//!
//! This module provides:
//! - [`ClockTime`]: A nanosecond timestamp type (8 bytes, Copy)
//! - [`Clock`]: Trait for time sources
//! - [`SystemClock`]: Monotonic system clock
//! - [`ManualClock`]: Settable clock for tests and simulations
//!
//! The pool only compares timestamps (lease expiration against "now"), so
//! any monotonic source works. Production code uses [`SystemClock`]; tests
//! drive lease expiry deterministically through [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// ClockTime
// ============================================================================

/// Time in nanoseconds (8 bytes, Copy).
///
/// Represents time as nanoseconds since an arbitrary epoch (usually clock
/// creation). Arithmetic saturates rather than wrapping.
///
/// # Examples
///
/// ```rust
/// use rxpool::ClockTime;
///
/// let t1 = ClockTime::from_secs(1);
/// let t2 = ClockTime::from_millis(500);
/// let t3 = t1 + t2;
///
/// assert_eq!(t3.millis(), 1500);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Zero time.
    pub const ZERO: Self = Self(0);

    /// Maximum representable time.
    pub const MAX: Self = Self(u64::MAX);

    /// Create from nanoseconds.
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create from microseconds.
    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Self(us.saturating_mul(1_000))
    }

    /// Create from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// Create from seconds.
    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(1_000_000_000))
    }

    /// Get as nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Get as microseconds (truncated).
    #[inline]
    pub const fn micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds (truncated).
    #[inline]
    pub const fn millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (truncated).
    #[inline]
    pub const fn secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Saturating addition.
    #[inline]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction.
    #[inline]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Add for ClockTime {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl std::ops::AddAssign for ClockTime {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = self.saturating_add(rhs);
    }
}

impl std::ops::Sub for ClockTime {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for ClockTime {
    #[inline]
    fn from(d: Duration) -> Self {
        Self(d.as_nanos() as u64)
    }
}

impl From<ClockTime> for Duration {
    #[inline]
    fn from(t: ClockTime) -> Self {
        Duration::from_nanos(t.0)
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:03}s", self.secs(), self.millis() % 1_000)
    }
}

// ============================================================================
// Clock Trait
// ============================================================================

/// Trait for time sources.
///
/// The pool reads "now" once per operation and compares it against stored
/// lease expirations; implementations must be monotonic.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> ClockTime;

    /// Get a human-readable name for the clock.
    fn name(&self) -> &str {
        "unknown"
    }
}

// ============================================================================
// SystemClock
// ============================================================================

/// System monotonic clock.
///
/// Uses `std::time::Instant` for monotonic time measurement.
/// Time is relative to when the clock was created.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Create a new system clock with epoch = now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> ClockTime {
        ClockTime::from(self.epoch.elapsed())
    }

    fn name(&self) -> &str {
        "system-monotonic"
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// A clock whose time only moves when told to.
///
/// Starts at zero. Intended for tests and simulations that need to drive
/// lease expiry deterministically.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a new manual clock at time zero.
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Set the current time.
    pub fn set(&self, t: ClockTime) {
        self.now.store(t.nanos(), Ordering::Release);
    }

    /// Advance the current time.
    pub fn advance(&self, delta: ClockTime) {
        self.now.fetch_add(delta.nanos(), Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> ClockTime {
        ClockTime::from_nanos(self.now.load(Ordering::Acquire))
    }

    fn name(&self) -> &str {
        "manual"
    }
}
