//! Clock sources used to timestamp vblank events and schedule frames.

use std::{cmp::Ordering, marker::PhantomData, time::Duration};

/// Marker for clock source that never returns a negative [`Time`]
pub trait NonNegativeClockSource: ClockSource {}

/// Monotonic clock
///
/// This is the clock the kernel uses for page-flip timestamps whenever the
/// device reports the `MonotonicTimestamp` capability.
#[derive(Debug)]
pub struct Monotonic;

impl ClockSource for Monotonic {
    fn id() -> rustix::time::ClockId {
        rustix::time::ClockId::Monotonic
    }
}

impl NonNegativeClockSource for Monotonic {}

/// Realtime clock
#[derive(Debug)]
pub struct Realtime;

impl ClockSource for Realtime {
    fn id() -> rustix::time::ClockId {
        rustix::time::ClockId::Realtime
    }
}

/// Id for a clock according to unix clockid_t
pub trait ClockSource {
    /// Gets the id of the clock source
    fn id() -> rustix::time::ClockId;
}

/// Defines a clock with a specific kind
#[derive(Debug)]
pub struct Clock<Kind> {
    _kind: PhantomData<Kind>,
}

impl<Kind: ClockSource> Clock<Kind> {
    /// Initialize a new clock
    pub fn new() -> Self {
        Clock { _kind: PhantomData }
    }

    /// Returns the current time
    pub fn now(&self) -> Time<Kind> {
        rustix::time::clock_gettime(Kind::id()).into()
    }
}

impl<Kind: ClockSource> Default for Clock<Kind> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Kind: ClockSource> Clone for Clock<Kind> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

/// A point in time for a clock with a specific kind
pub struct Time<Kind> {
    nanos: u64,
    _kind: PhantomData<Kind>,
}

impl<Kind> Time<Kind> {
    /// Creates a time point from nanoseconds since the clock's epoch
    pub const fn from_nanos(nanos: u64) -> Self {
        Time {
            nanos,
            _kind: PhantomData,
        }
    }

    /// Nanoseconds since the clock's epoch
    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Gets the duration between self and a later time
    pub fn duration_since(&self, later: Time<Kind>) -> Duration {
        Duration::from_nanos(later.nanos.saturating_sub(self.nanos))
    }

    /// Adds a duration, saturating at the end of the representable range
    pub fn saturating_add(&self, duration: Duration) -> Time<Kind> {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Time::from_nanos(self.nanos.saturating_add(nanos))
    }
}

impl<Kind> Clone for Time<Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Time<Kind> {}

impl<Kind> std::fmt::Debug for Time<Kind> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Time").field("nanos", &self.nanos).finish()
    }
}

impl<Kind> PartialEq for Time<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl<Kind> Eq for Time<Kind> {}

impl<Kind> PartialOrd for Time<Kind> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Kind> Ord for Time<Kind> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}

impl<Kind: NonNegativeClockSource> From<Time<Kind>> for Duration {
    fn from(time: Time<Kind>) -> Self {
        Duration::from_nanos(time.nanos)
    }
}

impl<Kind> From<Duration> for Time<Kind> {
    fn from(tp: Duration) -> Self {
        Time::from_nanos(u64::try_from(tp.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl<Kind> From<rustix::time::Timespec> for Time<Kind> {
    fn from(tp: rustix::time::Timespec) -> Self {
        let secs = u64::try_from(tp.tv_sec).unwrap_or(0);
        let nanos = u64::try_from(tp.tv_nsec).unwrap_or(0);
        Time::from_nanos(secs.saturating_mul(1_000_000_000).saturating_add(nanos))
    }
}
