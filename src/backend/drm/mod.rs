//! Kernel mode-setting presentation.
//!
//! This module gets rendered framebuffers onto a display through the atomic KMS api of
//! the kernel, with a reduced fallback for drivers only offering the legacy api.
//!
//! ## Building blocks
//!
//! - [`DrmDevice`] owns the open device node. It registers framebuffers, submits
//!   commits and routes page-flip events back to the commit waiting for them. Insert the
//!   [`DrmDeviceNotifier`] returned on creation into a [`calloop`] event loop to get
//!   those events dispatched.
//! - [`DrmResources`] is a snapshot of the connectors, encoders, crtcs and planes of a
//!   device, together with the state last committed to each of them.
//! - [`KmsReqBuilder`] assigns planes to the layers of one frame on one crtc and turns
//!   them into a [`KmsReq`], which is committed exactly once.
//! - [`FrameScheduler`] paces frames so at most one per output waits for scanout.
//!
//! ## Initialization
//!
//! ```rust,ignore
//! use kms_present::backend::drm::{DrmDevice, DrmDeviceConfig, DrmDeviceFd, DrmResources};
//! use kms_present::utils::DeviceFd;
//!
//! let fd = DrmDeviceFd::new(DeviceFd::from(file));
//! let (device, notifier) = DrmDevice::new(fd, DrmDeviceConfig::default())?;
//! let resources = Arc::new(RwLock::new(DrmResources::new(&device)?));
//!
//! event_loop.handle().insert_source(notifier, |event, metadata, _| match event {
//!     DrmEvent::VBlank(crtc) => { /* the frame on crtc is on screen */ }
//!     DrmEvent::Error(err) => tracing::error!(?err, "Drm error"),
//! })?;
//! ```
//!
//! ## Presenting a frame
//!
//! ```rust,ignore
//! let mut builder = KmsReqBuilder::new(device.clone(), resources.clone(), crtc)?;
//! builder.set_mode(mode);
//! builder.set_connector(connector)?;
//! builder.push_fb_layer(
//!     KmsFbLayer::fullscreen(fb, DrmFourcc::Xrgb8888, (1920, 1080)),
//!     Some(Box::new(move || buffers.release(fb))),
//!     None,
//! )?;
//! let req = builder.build();
//! scheduler.present_frame(
//!     Box::new(move || {
//!         if let Err(err) = req.commit_nonblocking(Some(Box::new(move |metadata| {
//!             scheduler.on_scanout(metadata.time.monotonic())
//!         }))) {
//!             tracing::warn!(?err, "Dropping frame");
//!         }
//!     }),
//!     None,
//! );
//! ```
//!
//! Set the environment variable `KMS_PRESENT_USE_LEGACY=1` to force the legacy api.

mod device;
pub mod error;
pub mod frame_scheduler;
pub mod request;
pub mod resources;

#[cfg(test)]
pub(crate) mod testing;

pub use self::device::io::{self, AtomicRequest, KmsIo, MemoryMapping};
pub use self::device::pageflip::{PendingFlip, ReleaseCallback, ScanoutCallback};
pub use self::device::{
    DrmDevice, DrmDeviceConfig, DrmDeviceFd, DrmDeviceNotifier, DrmEvent, DrmEventTime, DumbFramebuffer,
    EventMetadata, FramebufferInfo,
};
pub use self::error::{AccessError, Error};
pub use self::frame_scheduler::{FrameScheduler, FrameSchedulerConfig, PresentMode, VsyncBaton};
pub use self::request::{DeferredReleaseCallback, KmsFbLayer, KmsReq, KmsReqBuilder, LayerPlacement};
pub use self::resources::{BlendMode, DrmResources, DrmRotation};
