use drm::control::{connector, crtc, encoder, plane, RawResourceHandle};
use drm_fourcc::DrmFourcc;
use std::{io, path::PathBuf};

/// Errors thrown by the [`DrmDevice`](super::DrmDevice), the
/// [`DrmResources`](super::DrmResources) snapshot and the request builder
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Device is currently paused
    #[error("Device is currently paused, operation rejected")]
    DeviceInactive,
    /// No KMS capable device was found
    #[error("No KMS capable drm device found on seat `{0}`")]
    NoDevice(String),
    /// The opened node does not support kernel mode-setting
    #[error("Device `{0:?}` does not support kernel mode-setting")]
    NotKms(Option<PathBuf>),
    /// The crtc is not part of the resources
    #[error("Unknown crtc `{0:?}`")]
    UnknownCrtc(crtc::Handle),
    /// The connector is not part of the resources
    #[error("Unknown connector `{0:?}`")]
    UnknownConnector(connector::Handle),
    /// The encoder is not part of the resources
    #[error("Unknown encoder `{0:?}`")]
    UnknownEncoder(encoder::Handle),
    /// The plane is not part of the resources
    #[error("Unknown plane `{0:?}`")]
    UnknownPlane(plane::Handle),
    /// The DrmDevice is missing a required property
    #[error("The DrmDevice is missing a required property '{name}' for handle ({handle:?})")]
    UnknownProperty {
        /// Property handle
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// No free plane can show the given layer
    #[error("No plane on crtc `{crtc:?}` qualifies for layer {layer}")]
    NoSuitablePlane {
        /// CRTC
        crtc: crtc::Handle,
        /// Index of the layer that could not be placed
        layer: usize,
    },
    /// A request can not carry more layers
    #[error("Request for crtc `{0:?}` can not carry more than 32 layers")]
    TooManyLayers(crtc::Handle),
    /// Legacy modesetting only supports a single layer
    #[error("Legacy modesetting on crtc `{0:?}` only supports a single layer")]
    LegacyMultipleLayers(crtc::Handle),
    /// The requested zpos range can not be satisfied
    #[error("Invalid zpos range {min}..={max}")]
    InvalidZpos {
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },
    /// The request was already handed to the kernel
    #[error("Request for crtc `{0:?}` was already committed")]
    AlreadyCommitted(crtc::Handle),
    /// Two commits are already waiting for their page-flip event
    #[error("Two commits are already in flight on crtc `{0:?}`")]
    PageflipQueueFull(crtc::Handle),
    /// The pixel format is not known to the format tables
    #[error("Unsupported pixel format {0:?}")]
    UnsupportedFormat(DrmFourcc),
    /// A legacy modeset needs a framebuffer to scan out
    #[error("Legacy modeset of crtc `{0:?}` needs a framebuffer")]
    MissingFramebuffer(crtc::Handle),
    /// The device does not support atomic modesetting
    #[error("The device does not support atomic modesetting")]
    AtomicUnsupported,
}

/// Raw drm device access error
#[derive(thiserror::Error, Debug)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl Error {
    /// Returns the errno-style code of this error.
    ///
    /// Kernel failures carry the errno reported by the ioctl, plane allocation failures
    /// map to `EIO`, rejected requests to `EINVAL` and paused devices to `EBUSY`.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Access(err) => err.source.raw_os_error().unwrap_or(libc::EIO),
            Error::DeviceInactive | Error::PageflipQueueFull(_) => libc::EBUSY,
            Error::NoDevice(_) | Error::NotKms(_) => libc::ENODEV,
            Error::NoSuitablePlane { .. } | Error::LegacyMultipleLayers(_) => libc::EIO,
            Error::TooManyLayers(_) => libc::ENOSPC,
            Error::AtomicUnsupported => libc::EOPNOTSUPP,
            Error::UnknownCrtc(_)
            | Error::UnknownConnector(_)
            | Error::UnknownEncoder(_)
            | Error::UnknownPlane(_)
            | Error::UnknownProperty { .. }
            | Error::InvalidZpos { .. }
            | Error::AlreadyCommitted(_)
            | Error::UnsupportedFormat(_)
            | Error::MissingFramebuffer(_) => libc::EINVAL,
        }
    }
}
