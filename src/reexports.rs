//! Reexports of crates, that are part of the public api, for convenience

pub use calloop;
pub use drm;
pub use drm_fourcc;
#[cfg(feature = "backend_gbm")]
pub use gbm;
pub use rustix;
#[cfg(feature = "backend_udev")]
pub use udev;
