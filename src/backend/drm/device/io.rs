//! The kernel interface of a drm device.
//!
//! Every ioctl the presentation pipeline issues goes through [`KmsIo`]. [`DrmDeviceFd`]
//! implements it on top of the `drm` crate, everything above it only sees the plain
//! data types of this module.

use std::{
    fmt, io,
    ops::{Deref, DerefMut},
    os::unix::io::{AsFd, BorrowedFd},
    path::PathBuf,
    ptr::NonNull,
    time::Duration,
};

use drm::control::{
    atomic::AtomicModeReq, connector, crtc, encoder, framebuffer, plane, property, AtomicCommitFlags,
    Device as ControlDevice, Event, Mode, PageFlipFlags, RawResourceHandle,
};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use drm_fourcc::{DrmFourcc, DrmModifier};

use super::fd::DrmDeviceFd;

/// Handles of all mode-setting objects of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceIds {
    /// Connector handles
    pub connectors: Vec<connector::Handle>,
    /// Encoder handles
    pub encoders: Vec<encoder::Handle>,
    /// Crtc handles, their position is the crtc index used in `possible_crtcs` bitmasks
    pub crtcs: Vec<crtc::Handle>,
    /// Plane handles (including primary and cursor planes with universal planes enabled)
    pub planes: Vec<plane::Handle>,
}

/// Connector as reported by the kernel
#[derive(Debug, Clone)]
pub struct RawConnector {
    /// Handle of the connector
    pub handle: connector::Handle,
    /// Physical connector type
    pub interface: connector::Interface,
    /// Index of the connector among those of the same type
    pub interface_id: u32,
    /// Whether a display is attached
    pub state: connector::State,
    /// Physical size of the attached display in millimeters
    pub size_mm: Option<(u32, u32)>,
    /// Subpixel layout of the attached display
    pub subpixel: connector::SubPixel,
    /// Modes supported by the attached display
    pub modes: Vec<Mode>,
    /// Encoders that can drive this connector
    pub encoders: Vec<encoder::Handle>,
    /// Encoder currently driving this connector
    pub current_encoder: Option<encoder::Handle>,
}

/// Encoder as reported by the kernel
#[derive(Debug, Clone)]
pub struct RawEncoder {
    /// Handle of the encoder
    pub handle: encoder::Handle,
    /// Encoder type
    pub kind: encoder::Kind,
    /// Crtc currently driving this encoder
    pub crtc: Option<crtc::Handle>,
    /// Bitmask of crtc indices this encoder can be driven by
    pub possible_crtcs: u32,
    /// Bitmask of encoder indices this encoder can be cloned with
    pub possible_clones: u32,
}

/// Crtc as reported by the kernel
#[derive(Debug, Clone)]
pub struct RawCrtc {
    /// Handle of the crtc
    pub handle: crtc::Handle,
    /// Currently programmed mode
    pub mode: Option<Mode>,
    /// Currently scanned out framebuffer (legacy view)
    pub framebuffer: Option<framebuffer::Handle>,
    /// Position of the scanout inside the framebuffer
    pub position: (u32, u32),
    /// Size of the gamma lookup table
    pub gamma_length: u32,
}

/// Plane as reported by the kernel
#[derive(Debug, Clone)]
pub struct RawPlane {
    /// Handle of the plane
    pub handle: plane::Handle,
    /// Crtc currently bound to this plane
    pub crtc: Option<crtc::Handle>,
    /// Framebuffer currently bound to this plane
    pub framebuffer: Option<framebuffer::Handle>,
    /// Bitmask of crtc indices this plane can be used with
    pub possible_crtcs: u32,
    /// Fourcc codes this plane can scan out (without modifier information)
    pub formats: Vec<u32>,
}

/// The type and value range of a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    /// Unsigned range
    Range {
        /// Minimum value
        min: u64,
        /// Maximum value
        max: u64,
    },
    /// Signed range
    SignedRange {
        /// Minimum value
        min: i64,
        /// Maximum value
        max: i64,
    },
    /// Enumeration, values are the raw values of the entries
    Enum(Vec<(String, u64)>),
    /// Bitmask, values are the bit positions of the entries
    Bitmask(Vec<(String, u64)>),
    /// Blob id
    Blob,
    /// Object id
    Object,
    /// Anything else
    Unknown,
}

/// Metadata of a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Handle of the property
    pub handle: property::Handle,
    /// Name of the property as reported by the driver
    pub name: String,
    /// Whether the value is fixed by the driver
    pub immutable: bool,
    /// Whether the property is only accessible through the atomic api
    pub atomic: bool,
    /// Type of the property
    pub kind: PropertyKind,
}

/// Mode-setting object properties can be queried for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrmObject {
    /// A connector
    Connector(connector::Handle),
    /// A crtc
    Crtc(crtc::Handle),
    /// A plane
    Plane(plane::Handle),
}

impl From<DrmObject> for RawResourceHandle {
    fn from(object: DrmObject) -> Self {
        match object {
            DrmObject::Connector(handle) => handle.into(),
            DrmObject::Crtc(handle) => handle.into(),
            DrmObject::Plane(handle) => handle.into(),
        }
    }
}

/// Description of a buffer to be registered as framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    /// Width and height in pixels
    pub size: (u32, u32),
    /// Pixel format
    pub format: DrmFourcc,
    /// Layout modifier, `None` lets the driver infer it
    pub modifier: Option<DrmModifier>,
    /// GEM handles per plane
    pub handles: [u32; 4],
    /// Pitches per plane
    pub pitches: [u32; 4],
    /// Offsets per plane
    pub offsets: [u32; 4],
}

/// A dumb buffer allocated by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    /// GEM handle of the buffer
    pub handle: u32,
    /// Stride in bytes
    pub pitch: u32,
    /// Total size in bytes
    pub size: u64,
}

/// A completed page flip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlip {
    /// Crtc that flipped
    pub crtc: crtc::Handle,
    /// Vblank sequence number
    pub frame: u32,
    /// Time of the flip since the epoch of the device clock
    pub duration: Duration,
}

/// Ordered set of property assignments forming one atomic commit
///
/// Assigning a property of an object twice keeps the first position and the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    props: Vec<(RawResourceHandle, property::Handle, u64)>,
}

impl AtomicRequest {
    /// Creates an empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `prop` of `object` to `value`
    pub fn add_property(&mut self, object: impl Into<RawResourceHandle>, prop: property::Handle, value: u64) {
        let object = object.into();
        match self
            .props
            .iter_mut()
            .find(|(obj, handle, _)| *obj == object && *handle == prop)
        {
            Some(entry) => entry.2 = value,
            None => self.props.push((object, prop, value)),
        }
    }

    /// Returns the value assigned to `prop` of `object`, if any
    pub fn get(&self, object: impl Into<RawResourceHandle>, prop: property::Handle) -> Option<u64> {
        let object = object.into();
        self.props
            .iter()
            .find(|(obj, handle, _)| *obj == object && *handle == prop)
            .map(|(_, _, value)| *value)
    }

    /// Number of assignments
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Whether the request assigns nothing
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Iterates all assignments in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (RawResourceHandle, property::Handle, u64)> + '_ {
        self.props.iter().copied()
    }

    fn to_mode_req(&self) -> AtomicModeReq {
        let mut req = AtomicModeReq::new();
        for (object, prop, value) in self.iter() {
            req.add_raw_property(object, prop, value);
        }
        req
    }
}

/// Memory mapping of a dumb buffer
pub struct MemoryMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is owned exclusively and only accessed through &self / &mut self
unsafe impl Send for MemoryMapping {}

impl MemoryMapping {
    /// Wraps an existing shared mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a mapping of `len` bytes created by `mmap`, which is unmapped
    /// by nobody else.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        MemoryMapping { ptr, len }
    }
}

impl fmt::Debug for MemoryMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMapping").field("len", &self.len).finish()
    }
}

impl Deref for MemoryMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for MemoryMapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a live mapping owned by self
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by mmap with this length and is not used afterwards
        let _ = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

/// Kernel mode-setting operations of an open drm device
pub trait KmsIo: fmt::Debug + Send + Sync {
    /// Path of the device node, if known
    fn device_path(&self) -> Option<PathBuf>;

    /// Enables or disables a client capability
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()>;
    /// Queries a driver capability
    fn driver_capability(&self, cap: DriverCapability) -> io::Result<u64>;

    /// Enumerates all mode-setting objects
    fn resource_ids(&self) -> io::Result<ResourceIds>;
    /// Queries a connector
    fn connector(&self, handle: connector::Handle) -> io::Result<RawConnector>;
    /// Queries an encoder
    fn encoder(&self, handle: encoder::Handle) -> io::Result<RawEncoder>;
    /// Queries a crtc
    fn crtc(&self, handle: crtc::Handle) -> io::Result<RawCrtc>;
    /// Queries a plane
    fn plane(&self, handle: plane::Handle) -> io::Result<RawPlane>;

    /// Lists the properties and their current values of an object
    fn object_properties(&self, object: DrmObject) -> io::Result<Vec<(property::Handle, u64)>>;
    /// Queries metadata of a property
    fn property_info(&self, handle: property::Handle) -> io::Result<PropertyInfo>;
    /// Reads a property blob
    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>>;
    /// Uploads a mode as property blob and returns the blob id
    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64>;
    /// Destroys a property blob
    fn destroy_blob(&self, blob: u64) -> io::Result<()>;

    /// Submits an atomic commit
    fn atomic_commit(&self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()>;
    /// Legacy modeset
    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()>;
    /// Legacy page flip, always requesting a completion event
    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> io::Result<()>;

    /// Registers a framebuffer
    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<framebuffer::Handle>;
    /// Removes a framebuffer
    fn remove_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()>;
    /// Imports a dma-buf and returns its GEM handle
    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;
    /// Closes a GEM handle
    fn close_gem_handle(&self, handle: u32) -> io::Result<()>;

    /// Allocates a dumb buffer
    fn create_dumb(&self, size: (u32, u32), bpp: u32) -> io::Result<DumbAllocation>;
    /// Prepares a dumb buffer for mapping and returns the mmap offset
    fn map_dumb(&self, handle: u32) -> io::Result<u64>;
    /// Maps `len` bytes of the device at `offset`
    fn mmap(&self, offset: u64, len: usize) -> io::Result<MemoryMapping>;
    /// Frees a dumb buffer
    fn destroy_dumb(&self, handle: u32) -> io::Result<()>;

    /// Reads all pending page-flip events
    fn receive_events(&self) -> io::Result<Vec<PageFlip>>;
}

const DRM_MODE_PROP_RANGE: u32 = 1 << 1;
const DRM_MODE_PROP_IMMUTABLE: u32 = 1 << 2;
const DRM_MODE_PROP_ENUM: u32 = 1 << 3;
const DRM_MODE_PROP_BLOB: u32 = 1 << 4;
const DRM_MODE_PROP_BITMASK: u32 = 1 << 5;
const DRM_MODE_PROP_EXTENDED_TYPE: u32 = 0x0000_ffc0;
const DRM_MODE_PROP_OBJECT: u32 = 1 << 6;
const DRM_MODE_PROP_SIGNED_RANGE: u32 = 2 << 6;
const DRM_MODE_PROP_ATOMIC: u32 = 0x8000_0000;
const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;

fn c_name(name: &[std::os::raw::c_char]) -> String {
    let bytes = name
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect::<Vec<_>>();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn invalid_handle(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("kernel returned an invalid {} id", what))
}

impl KmsIo for DrmDeviceFd {
    fn device_path(&self) -> Option<PathBuf> {
        self.path()
    }

    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        BasicDevice::set_client_capability(self, cap, enable)
    }

    fn driver_capability(&self, cap: DriverCapability) -> io::Result<u64> {
        self.get_driver_capability(cap)
    }

    fn resource_ids(&self) -> io::Result<ResourceIds> {
        let handles = self.resource_handles()?;
        let planes = self.plane_handles()?;
        Ok(ResourceIds {
            connectors: handles.connectors().to_vec(),
            encoders: handles.encoders().to_vec(),
            crtcs: handles.crtcs().to_vec(),
            planes,
        })
    }

    fn connector(&self, handle: connector::Handle) -> io::Result<RawConnector> {
        let info = self.get_connector(handle, false)?;
        Ok(RawConnector {
            handle,
            interface: info.interface(),
            interface_id: info.interface_id(),
            state: info.state(),
            size_mm: info.size(),
            subpixel: info.subpixel(),
            modes: info.modes().to_vec(),
            encoders: info.encoders().to_vec(),
            current_encoder: info.current_encoder(),
        })
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<RawEncoder> {
        let info = self.get_encoder(handle)?;
        let raw = drm_ffi::mode::get_encoder(self.as_fd(), handle.into())?;
        Ok(RawEncoder {
            handle,
            kind: info.kind(),
            crtc: info.crtc(),
            possible_crtcs: raw.possible_crtcs,
            possible_clones: raw.possible_clones,
        })
    }

    fn crtc(&self, handle: crtc::Handle) -> io::Result<RawCrtc> {
        let info = self.get_crtc(handle)?;
        Ok(RawCrtc {
            handle,
            mode: info.mode(),
            framebuffer: info.framebuffer(),
            position: info.position(),
            gamma_length: info.gamma_length(),
        })
    }

    fn plane(&self, handle: plane::Handle) -> io::Result<RawPlane> {
        let info = self.get_plane(handle)?;
        let raw = drm_ffi::mode::get_plane(self.as_fd(), handle.into(), None)?;
        Ok(RawPlane {
            handle,
            crtc: info.crtc(),
            framebuffer: info.framebuffer(),
            possible_crtcs: raw.possible_crtcs,
            formats: info.formats().to_vec(),
        })
    }

    fn object_properties(&self, object: DrmObject) -> io::Result<Vec<(property::Handle, u64)>> {
        let set = match object {
            DrmObject::Connector(handle) => self.get_properties(handle)?,
            DrmObject::Crtc(handle) => self.get_properties(handle)?,
            DrmObject::Plane(handle) => self.get_properties(handle)?,
        };
        let (handles, values) = set.as_props_and_values();
        Ok(handles.iter().copied().zip(values.iter().copied()).collect())
    }

    fn property_info(&self, handle: property::Handle) -> io::Result<PropertyInfo> {
        let mut values = Vec::new();
        let mut enums = Vec::new();
        let raw = drm_ffi::mode::get_property(self.as_fd(), handle.into(), Some(&mut values), Some(&mut enums))?;

        let entries = || {
            enums
                .iter()
                .map(|entry| (c_name(&entry.name), entry.value))
                .collect::<Vec<_>>()
        };
        let flags = raw.flags;
        let kind = if flags & DRM_MODE_PROP_RANGE != 0 && values.len() >= 2 {
            PropertyKind::Range {
                min: values[0],
                max: values[1],
            }
        } else if flags & DRM_MODE_PROP_ENUM != 0 {
            PropertyKind::Enum(entries())
        } else if flags & DRM_MODE_PROP_BITMASK != 0 {
            PropertyKind::Bitmask(entries())
        } else if flags & DRM_MODE_PROP_BLOB != 0 {
            PropertyKind::Blob
        } else {
            match flags & DRM_MODE_PROP_EXTENDED_TYPE {
                DRM_MODE_PROP_SIGNED_RANGE if values.len() >= 2 => PropertyKind::SignedRange {
                    min: values[0] as i64,
                    max: values[1] as i64,
                },
                DRM_MODE_PROP_OBJECT => PropertyKind::Object,
                _ => PropertyKind::Unknown,
            }
        };

        Ok(PropertyInfo {
            handle,
            name: c_name(&raw.name),
            immutable: flags & DRM_MODE_PROP_IMMUTABLE != 0,
            atomic: flags & DRM_MODE_PROP_ATOMIC != 0,
            kind,
        })
    }

    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        self.get_property_blob(blob)
    }

    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64> {
        match self.create_property_blob(mode)? {
            property::Value::Blob(id) => Ok(id),
            _ => Err(invalid_handle("blob")),
        }
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        self.destroy_property_blob(blob)
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()> {
        ControlDevice::atomic_commit(self, flags, req.to_mode_req())
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        ControlDevice::set_crtc(self, crtc, fb, (0, 0), connectors, mode)
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> io::Result<()> {
        ControlDevice::page_flip(self, crtc, fb, PageFlipFlags::EVENT, None)
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<framebuffer::Handle> {
        let (modifiers, flags) = match desc.modifier {
            Some(modifier) => {
                let raw: u64 = modifier.into();
                let mut modifiers = [0u64; 4];
                for (i, handle) in desc.handles.iter().enumerate() {
                    if *handle != 0 {
                        modifiers[i] = raw;
                    }
                }
                (modifiers, DRM_MODE_FB_MODIFIERS)
            }
            None => ([0u64; 4], 0),
        };
        let raw = drm_ffi::mode::add_fb2(
            self.as_fd(),
            desc.size.0,
            desc.size.1,
            desc.format as u32,
            &desc.handles,
            &desc.pitches,
            &desc.offsets,
            &modifiers,
            flags,
        )?;
        drm::control::from_u32(raw.fb_id).ok_or_else(|| invalid_handle("framebuffer"))
    }

    fn remove_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        self.destroy_framebuffer(fb)
    }

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        Ok(drm_ffi::gem::fd_to_handle(self.as_fd(), fd)?.handle)
    }

    fn close_gem_handle(&self, handle: u32) -> io::Result<()> {
        drm_ffi::gem::close(self.as_fd(), handle).map(|_| ())
    }

    fn create_dumb(&self, size: (u32, u32), bpp: u32) -> io::Result<DumbAllocation> {
        let raw = drm_ffi::mode::dumbbuffer::create(self.as_fd(), size.0, size.1, bpp, 0)?;
        Ok(DumbAllocation {
            handle: raw.handle,
            pitch: raw.pitch,
            size: raw.size,
        })
    }

    fn map_dumb(&self, handle: u32) -> io::Result<u64> {
        Ok(drm_ffi::mode::dumbbuffer::map(self.as_fd(), handle, 0, 0)?.offset)
    }

    fn mmap(&self, offset: u64, len: usize) -> io::Result<MemoryMapping> {
        use rustix::mm::{mmap, MapFlags, ProtFlags};

        // SAFETY: a fresh shared mapping, owned by the returned MemoryMapping
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                self.as_fd(),
                offset,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        // SAFETY: see above
        Ok(unsafe { MemoryMapping::from_raw(ptr, len) })
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        drm_ffi::mode::dumbbuffer::destroy(self.as_fd(), handle).map(|_| ())
    }

    fn receive_events(&self) -> io::Result<Vec<PageFlip>> {
        Ok(ControlDevice::receive_events(self)?
            .filter_map(|event| match event {
                Event::PageFlip(event) => Some(PageFlip {
                    crtc: event.crtc,
                    frame: event.frame,
                    duration: event.duration,
                }),
                _ => None,
            })
            .collect())
    }
}

