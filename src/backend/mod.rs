//! Backend (rendering/input) helpers
//!
//! This module provides the low-level pieces needed to get frames onto a display
//! through kernel mode-setting:
//!
//! - [`drm`] holds the resource model, the device handle, the atomic request builder
//!   and the frame scheduler,
//! - [`allocator`] holds pixel-format helpers shared by the framebuffer code,
//! - [`session`] abstracts how privileged device nodes get opened,
//! - [`udev`] discovers KMS devices for a seat and reports hotplug events.

pub mod allocator;
pub mod drm;
pub mod session;
pub mod udev;
