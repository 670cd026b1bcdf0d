//! Various utilities functions and types

pub mod clock;
mod fd;
mod geometry;

pub use self::clock::{Clock, Monotonic, Time};
pub use self::fd::DeviceFd;
pub use self::geometry::{Buffer, Physical, Point, Rectangle, Size};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data of a poisoned lock
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
