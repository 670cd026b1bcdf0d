use std::os::unix::io::OwnedFd;

use drm::control::{framebuffer, plane, PlaneType};
use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::backend::drm::resources::{BlendMode, DrmRotation};
use crate::utils::{Buffer, Physical, Rectangle};

/// A framebuffer to be shown on one plane of a crtc
#[derive(Debug)]
pub struct KmsFbLayer {
    /// Framebuffer to scan out
    pub fb: framebuffer::Handle,
    /// Pixel format of `fb`
    pub format: DrmFourcc,
    /// Layout modifier of `fb`, `None` if the buffer was allocated without one
    pub modifier: Option<DrmModifier>,
    /// Part of the framebuffer to show
    pub src: Rectangle<f64, Buffer>,
    /// Where to show it on the crtc
    pub dst: Rectangle<i32, Physical>,
    /// Rotation the plane has to apply
    pub rotation: Option<DrmRotation>,
    /// Plane opacity, fully opaque if unset
    pub alpha: Option<u16>,
    /// How the layer is blended with the layers below
    pub blend_mode: Option<BlendMode>,
    /// Fence the display waits on before reading `fb`
    pub in_fence_fd: Option<OwnedFd>,
    /// Try to put this layer on a cursor plane
    pub prefer_cursor: bool,
}

impl KmsFbLayer {
    /// Creates a layer showing `src` of `fb` at `dst`
    pub fn new(
        fb: framebuffer::Handle,
        format: DrmFourcc,
        src: Rectangle<f64, Buffer>,
        dst: Rectangle<i32, Physical>,
    ) -> Self {
        KmsFbLayer {
            fb,
            format,
            modifier: None,
            src,
            dst,
            rotation: None,
            alpha: None,
            blend_mode: None,
            in_fence_fd: None,
            prefer_cursor: false,
        }
    }

    /// Creates a layer showing all of `fb` unscaled at the top-left corner of the crtc
    pub fn fullscreen(fb: framebuffer::Handle, format: DrmFourcc, size: (u32, u32)) -> Self {
        Self::new(
            fb,
            format,
            Rectangle::from_loc_and_size((0.0, 0.0), (size.0 as f64, size.1 as f64)),
            Rectangle::from_loc_and_size((0, 0), (size.0 as i32, size.1 as i32)),
        )
    }
}

/// The plane chosen for a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerPlacement {
    /// The plane, `None` for a legacy request on hardware without universal planes
    pub plane: Option<plane::Handle>,
    /// Type of the plane
    pub kind: PlaneType,
    /// Committed zpos, `None` if the plane has no zpos property or is a preferred cursor
    pub zpos: Option<i64>,
}
