//! CPU-writable scanout buffers

use std::sync::Arc;

use drm::control::framebuffer;
use drm_fourcc::DrmFourcc;
use tracing::{trace, warn};

use super::io::MemoryMapping;
use super::DrmDevice;
use crate::backend::allocator::format::get_bpp;
use crate::backend::drm::error::Error;

/// A dumb buffer registered as framebuffer
///
/// The framebuffer is removed and the buffer freed on drop.
#[derive(Debug)]
pub struct DumbFramebuffer {
    device: Arc<DrmDevice>,
    fb: framebuffer::Handle,
    handle: u32,
    size: (u32, u32),
    format: DrmFourcc,
    pitch: u32,
    len: u64,
}

impl DrmDevice {
    /// Allocates a dumb buffer and registers it as framebuffer
    pub fn create_dumb_framebuffer(
        self: &Arc<Self>,
        size: (u32, u32),
        format: DrmFourcc,
    ) -> Result<DumbFramebuffer, Error> {
        let _guard = self.span().enter();
        let bpp = get_bpp(format).ok_or(Error::UnsupportedFormat(format))?;
        let alloc = self
            .io()
            .create_dumb(size, bpp as u32)
            .map_err(self.access_error("Failed to create dumb buffer"))?;

        let fb = match self.add_fb(size, format, None, alloc.handle, alloc.pitch, 0) {
            Ok(fb) => fb,
            Err(err) => {
                if let Err(err) = self.io().destroy_dumb(alloc.handle) {
                    warn!(handle = alloc.handle, ?err, "Failed to destroy dumb buffer");
                }
                return Err(err);
            }
        };
        trace!(?fb, ?size, ?format, "Created dumb framebuffer");

        Ok(DumbFramebuffer {
            device: self.clone(),
            fb,
            handle: alloc.handle,
            size,
            format,
            pitch: alloc.pitch,
            len: alloc.size,
        })
    }
}

impl DumbFramebuffer {
    /// Handle of the framebuffer
    pub fn fb(&self) -> framebuffer::Handle {
        self.fb
    }

    /// Width and height in pixels
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Pixel format
    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    /// Stride in bytes
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// Maps the buffer into memory for writing
    pub fn map(&self) -> Result<MemoryMapping, Error> {
        let offset = self
            .device
            .io()
            .map_dumb(self.handle)
            .map_err(self.device.access_error("Failed to prepare dumb buffer mapping"))?;
        self.device
            .io()
            .mmap(offset, self.len as usize)
            .map_err(self.device.access_error("Failed to map dumb buffer"))
    }
}

impl AsRef<framebuffer::Handle> for DumbFramebuffer {
    fn as_ref(&self) -> &framebuffer::Handle {
        &self.fb
    }
}

impl Drop for DumbFramebuffer {
    fn drop(&mut self) {
        trace!(fb = ?self.fb, "destroying framebuffer");
        if let Err(err) = self.device.rm_fb(self.fb) {
            warn!(fb = ?self.fb, ?err, "failed to destroy framebuffer");
        }
        if let Err(err) = self.device.io().destroy_dumb(self.handle) {
            warn!(handle = self.handle, ?err, "failed to destroy dumb buffer");
        }
    }
}
