//! Snapshot of the mode-setting objects of a drm device.
//!
//! [`DrmResources`] enumerates connectors, encoders, crtcs and planes once and caches
//! everything the plane allocator needs: plane types, formats, zpos ranges, rotation
//! support and the property values last committed to each object. A hotplug is handled
//! by creating a new snapshot or by refreshing a single connector.

use std::collections::HashMap;
use std::sync::Arc;

use drm::control::{connector, crtc, encoder, framebuffer, plane, property, Mode, PlaneType};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, info_span, trace, warn};

pub mod formats;
pub mod props;

pub use self::props::{ConnectorProps, CrtcProps, PlaneProps};

use super::device::io::{DrmObject, KmsIo, PropertyInfo, PropertyKind};
use super::device::DrmDevice;
use super::error::Error;
use crate::utils::{Buffer, Physical, Rectangle};

bitflags::bitflags! {
    /// Possible flags for a DRM plane rotation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DrmRotation: u32 {
        /// Rotate by 0 degrees
        const ROTATE_0 = 1 << 0;
        /// Rotate by 90 degrees
        const ROTATE_90 = 1 << 1;
        /// Rotate by 180 degrees
        const ROTATE_180 = 1 << 2;
        /// Rotate by 270 degrees
        const ROTATE_270 = 1 << 3;
        /// Reflect along the x axis
        const REFLECT_X = 1 << 4;
        /// Reflect along the y axis
        const REFLECT_Y = 1 << 5;
    }
}

/// Blending of a plane with the planes below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Alpha channel is ignored
    None,
    /// Color channels are premultiplied with alpha
    Premultiplied,
    /// Color channels are not premultiplied
    Coverage,
}

impl BlendMode {
    fn from_name(name: &str) -> Option<BlendMode> {
        match name {
            "None" => Some(BlendMode::None),
            "Pre-multiplied" => Some(BlendMode::Premultiplied),
            "Coverage" => Some(BlendMode::Coverage),
            _ => None,
        }
    }
}

/// Range of zpos values a plane accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZposRange {
    /// Lowest accepted value
    pub min: i64,
    /// Highest accepted value
    pub max: i64,
    /// The value is fixed by the driver and can not be changed
    pub hardcoded: bool,
}

impl ZposRange {
    /// Whether some value lies in both ranges
    pub fn intersects(&self, min: i64, max: i64) -> bool {
        self.min <= max && min <= self.max
    }
}

/// Rotations a plane can apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSupport {
    /// Supported rotation and reflection bits
    pub supported: DrmRotation,
    /// The rotation is fixed to exactly `supported`
    pub hardcoded: bool,
}

impl RotationSupport {
    /// Whether a plane with this support can show a buffer with `rotation` applied
    pub fn allows(&self, rotation: DrmRotation) -> bool {
        if self.hardcoded {
            self.supported == rotation
        } else {
            self.supported.contains(rotation)
        }
    }
}

/// State of a connector that changes with hotplug
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorState {
    /// Whether a display is attached
    pub connection: connector::State,
    /// Physical size of the display in millimeters
    pub size_mm: Option<(u32, u32)>,
    /// Subpixel layout of the display
    pub subpixel: connector::SubPixel,
    /// Modes supported by the display
    pub modes: Vec<Mode>,
}

/// Last committed binding of a connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorCommitted {
    /// Crtc driving the connector
    pub crtc: Option<crtc::Handle>,
    /// Encoder driving the connector
    pub encoder: Option<encoder::Handle>,
}

/// A connector of the snapshot
#[derive(Debug, Clone)]
pub struct Connector {
    handle: connector::Handle,
    interface: connector::Interface,
    interface_id: u32,
    encoders: Vec<encoder::Handle>,
    state: ConnectorState,
    props: ConnectorProps,
    pub(crate) committed: ConnectorCommitted,
}

impl Connector {
    /// Handle of the connector
    pub fn handle(&self) -> connector::Handle {
        self.handle
    }

    /// Physical connector type
    pub fn interface(&self) -> connector::Interface {
        self.interface
    }

    /// Index among the connectors of the same type
    pub fn interface_id(&self) -> u32 {
        self.interface_id
    }

    /// Encoders that can drive this connector
    pub fn encoders(&self) -> &[encoder::Handle] {
        &self.encoders
    }

    /// Hotplug state of the connector
    pub fn state(&self) -> &ConnectorState {
        &self.state
    }

    /// Whether a display is attached
    pub fn is_connected(&self) -> bool {
        self.state.connection == connector::State::Connected
    }

    /// Property ids of the connector
    pub fn props(&self) -> &ConnectorProps {
        &self.props
    }

    /// Last committed binding
    pub fn committed(&self) -> &ConnectorCommitted {
        &self.committed
    }
}

/// An encoder of the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoder {
    handle: encoder::Handle,
    kind: encoder::Kind,
    crtc: Option<crtc::Handle>,
    possible_crtcs: u32,
    possible_clones: u32,
}

impl Encoder {
    /// Handle of the encoder
    pub fn handle(&self) -> encoder::Handle {
        self.handle
    }

    /// Encoder type
    pub fn kind(&self) -> encoder::Kind {
        self.kind
    }

    /// Crtc driving the encoder when the snapshot was taken
    pub fn crtc(&self) -> Option<crtc::Handle> {
        self.crtc
    }

    /// Bitmask of crtc indices this encoder can be driven by
    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs
    }

    /// Bitmask of encoder indices this encoder can be cloned with
    pub fn possible_clones(&self) -> u32 {
        self.possible_clones
    }
}

/// A mode uploaded as property blob, destroyed when the last crtc snapshot using it is dropped
#[derive(Debug)]
pub struct ModeBlob {
    id: u64,
    io: Arc<dyn KmsIo>,
}

impl ModeBlob {
    pub(crate) fn new(id: u64, io: Arc<dyn KmsIo>) -> Self {
        ModeBlob { id, io }
    }

    /// Id of the blob
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ModeBlob {
    fn drop(&mut self) {
        trace!(blob = self.id, "Destroying mode blob");
        if let Err(err) = self.io.destroy_blob(self.id) {
            warn!(blob = self.id, ?err, "Failed to destroy mode blob");
        }
    }
}

/// Last committed state of a crtc
#[derive(Debug, Clone, Default)]
pub struct CrtcCommitted {
    /// Whether the crtc is enabled
    pub active: bool,
    /// Programmed mode
    pub mode: Option<Mode>,
    /// Blob holding `mode`, if it was uploaded by us
    pub mode_blob: Option<Arc<ModeBlob>>,
}

/// A crtc of the snapshot
#[derive(Debug, Clone)]
pub struct Crtc {
    handle: crtc::Handle,
    index: usize,
    gamma_length: u32,
    props: CrtcProps,
    pub(crate) committed: CrtcCommitted,
}

impl Crtc {
    /// Handle of the crtc
    pub fn handle(&self) -> crtc::Handle {
        self.handle
    }

    /// Index of the crtc in the kernel's list, the bit position used in `possible_crtcs`
    pub fn index(&self) -> usize {
        self.index
    }

    /// `1 << index`, or 0 for crtcs that can not be addressed by a bitmask
    pub fn bitmask(&self) -> u32 {
        1u32.checked_shl(self.index as u32).unwrap_or(0)
    }

    /// Size of the gamma lookup table
    pub fn gamma_length(&self) -> u32 {
        self.gamma_length
    }

    /// Property ids of the crtc
    pub fn props(&self) -> &CrtcProps {
        &self.props
    }

    /// Last committed state
    pub fn committed(&self) -> &CrtcCommitted {
        &self.committed
    }
}

/// Last committed state of a plane
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaneState {
    /// Crtc the plane is bound to
    pub crtc: Option<crtc::Handle>,
    /// Framebuffer shown by the plane
    pub fb: Option<framebuffer::Handle>,
    /// Source rectangle inside the framebuffer
    pub src: Rectangle<f64, Buffer>,
    /// Destination rectangle on the crtc
    pub dst: Rectangle<i32, Physical>,
    /// Stacking position
    pub zpos: Option<i64>,
    /// Applied rotation
    pub rotation: Option<DrmRotation>,
    /// Plane opacity
    pub alpha: Option<u16>,
    /// Blend mode
    pub blend_mode: Option<BlendMode>,
    /// Pixel format of `fb`, if known
    pub format: Option<DrmFourcc>,
}

/// Requirements a plane has to meet to show a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneConstraints {
    /// Plane types to consider
    pub types: &'static [PlaneType],
    /// Pixel format of the layer
    pub format: DrmFourcc,
    /// Layout modifier of the layer, if known
    pub modifier: Option<DrmModifier>,
    /// Inclusive zpos range the plane has to reach, planes without zpos never do
    pub zpos: Option<(i64, i64)>,
    /// Rotation the plane has to apply
    pub rotation: Option<DrmRotation>,
    /// The plane id has to be strictly greater than this one
    pub id_above: Option<plane::Handle>,
}

/// A plane of the snapshot
#[derive(Debug, Clone)]
pub struct Plane {
    handle: plane::Handle,
    index: usize,
    kind: PlaneType,
    possible_crtcs: u32,
    formats: Vec<u32>,
    modified_formats: Option<Vec<(u32, u64)>>,
    zpos: Option<ZposRange>,
    rotation: Option<RotationSupport>,
    alpha_range: Option<(u64, u64)>,
    blend_modes: Vec<(BlendMode, u64)>,
    props: PlaneProps,
    pub(crate) committed: PlaneState,
}

impl Plane {
    /// Handle of the plane
    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    /// Position of the plane in the kernel's list
    pub fn index(&self) -> usize {
        self.index
    }

    /// Type of the plane
    pub fn kind(&self) -> PlaneType {
        self.kind
    }

    /// Bitmask of crtc indices the plane can be used with
    pub fn possible_crtcs(&self) -> u32 {
        self.possible_crtcs
    }

    /// Whether the plane can be used with `crtc`
    pub fn can_drive(&self, crtc: &Crtc) -> bool {
        self.possible_crtcs & crtc.bitmask() != 0
    }

    /// Fourcc codes the plane can scan out
    pub fn formats(&self) -> &[u32] {
        &self.formats
    }

    /// `(fourcc, modifier)` pairs from `IN_FORMATS`, if the plane reports them
    pub fn modified_formats(&self) -> Option<&[(u32, u64)]> {
        self.modified_formats.as_deref()
    }

    /// Accepted zpos values, if the plane has a zpos property
    pub fn zpos(&self) -> Option<ZposRange> {
        self.zpos
    }

    /// Rotation capabilities, if the plane has a rotation property
    pub fn rotation(&self) -> Option<RotationSupport> {
        self.rotation
    }

    /// Range of the alpha property, if present
    pub fn alpha_range(&self) -> Option<(u64, u64)> {
        self.alpha_range
    }

    /// Supported blend modes and their property values
    pub fn blend_modes(&self) -> &[(BlendMode, u64)] {
        &self.blend_modes
    }

    /// Property value selecting `mode`, if supported
    pub fn blend_mode_value(&self, mode: BlendMode) -> Option<u64> {
        self.blend_modes
            .iter()
            .find(|(supported, _)| *supported == mode)
            .map(|(_, value)| *value)
    }

    /// Property ids of the plane
    pub fn props(&self) -> &PlaneProps {
        &self.props
    }

    /// Last committed state
    pub fn committed(&self) -> &PlaneState {
        &self.committed
    }

    /// Whether the plane can scan out `format` without a specified modifier
    pub fn supports_format(&self, format: DrmFourcc) -> bool {
        self.formats.contains(&(format as u32))
    }

    /// Whether the plane can scan out `format` laid out as `modifier`.
    ///
    /// Planes without `IN_FORMATS` only support linear buffers.
    pub fn supports_modified_format(&self, format: DrmFourcc, modifier: DrmModifier) -> bool {
        let raw: u64 = modifier.into();
        match &self.modified_formats {
            Some(pairs) => pairs.contains(&(format as u32, raw)),
            None => modifier == DrmModifier::Linear && self.supports_format(format),
        }
    }

    /// Whether the plane meets every requirement of `constraints`
    pub fn qualifies(&self, constraints: &PlaneConstraints) -> bool {
        if !constraints.types.contains(&self.kind) {
            return false;
        }

        let format_ok = match constraints.modifier {
            Some(modifier) => self.supports_modified_format(constraints.format, modifier),
            None => self.supports_format(constraints.format),
        };
        if !format_ok {
            return false;
        }

        if let Some((min, max)) = constraints.zpos {
            match self.zpos {
                Some(range) if range.intersects(min, max) => {}
                _ => return false,
            }
        }

        match (self.rotation, constraints.rotation) {
            (Some(support), Some(rotation)) => {
                if !support.allows(rotation) {
                    return false;
                }
            }
            (Some(support), None) => {
                if support.hardcoded && support.supported != DrmRotation::ROTATE_0 {
                    return false;
                }
            }
            (None, Some(rotation)) => {
                if rotation != DrmRotation::ROTATE_0 {
                    return false;
                }
            }
            (None, None) => {}
        }

        if let Some(lower) = constraints.id_above {
            if u32::from(self.handle) <= u32::from(lower) {
                return false;
            }
        }

        true
    }
}

/// Snapshot of the mode-setting objects of a device
#[derive(Debug, Clone, Default)]
pub struct DrmResources {
    connectors: Vec<Connector>,
    encoders: Vec<Encoder>,
    crtcs: Vec<Crtc>,
    planes: Vec<Plane>,
}

struct PropertyCache<'a> {
    device: &'a DrmDevice,
    infos: HashMap<property::Handle, PropertyInfo>,
}

impl<'a> PropertyCache<'a> {
    fn properties(&mut self, object: DrmObject) -> Result<Vec<(PropertyInfo, u64)>, Error> {
        let values = self
            .device
            .io()
            .object_properties(object)
            .map_err(self.device.access_error("Error reading object properties"))?;
        values
            .into_iter()
            .map(|(handle, value)| {
                if let Some(info) = self.infos.get(&handle) {
                    return Ok((info.clone(), value));
                }
                let info = self
                    .device
                    .io()
                    .property_info(handle)
                    .map_err(self.device.access_error("Error reading property info"))?;
                self.infos.insert(handle, info.clone());
                Ok((info, value))
            })
            .collect()
    }
}

fn range_of(kind: &PropertyKind) -> Option<(i64, i64)> {
    match kind {
        PropertyKind::Range { min, max } => Some((*min as i64, *max as i64)),
        PropertyKind::SignedRange { min, max } => Some((*min, *max)),
        _ => None,
    }
}

fn fixed_to_f64(value: u64) -> f64 {
    value as f64 / 65536.0
}

impl DrmResources {
    /// Enumerates all mode-setting objects of `device`.
    ///
    /// Fails if any query fails, no partial snapshot is returned.
    #[profiling::function]
    pub fn new(device: &DrmDevice) -> Result<Self, Error> {
        let span = info_span!(parent: device.span(), "drm_resources");
        let _guard = span.enter();

        let io = device.io();
        let ids = io
            .resource_ids()
            .map_err(device.access_error("Error loading drm resources"))?;
        let mut cache = PropertyCache {
            device,
            infos: HashMap::new(),
        };

        let encoders = ids
            .encoders
            .iter()
            .map(|handle| {
                let raw = io
                    .encoder(*handle)
                    .map_err(device.access_error("Error loading encoder info"))?;
                Ok(Encoder {
                    handle: raw.handle,
                    kind: raw.kind,
                    crtc: raw.crtc,
                    possible_crtcs: raw.possible_crtcs,
                    possible_clones: raw.possible_clones,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut connectors = Vec::with_capacity(ids.connectors.len());
        for handle in &ids.connectors {
            let raw = io
                .connector(*handle)
                .map_err(device.access_error("Error loading connector info"))?;
            let mut props = ConnectorProps::default();
            let mut committed = ConnectorCommitted {
                crtc: None,
                encoder: raw.current_encoder,
            };
            for (info, value) in cache.properties(DrmObject::Connector(*handle))? {
                if !props.assign(&info.name, info.handle) {
                    trace!(connector = ?handle, name = info.name, "Ignoring unknown connector property");
                    continue;
                }
                if info.name == "CRTC_ID" {
                    committed.crtc = drm::control::from_u32(value as u32);
                }
            }
            if props.crtc_id.is_none() {
                committed.crtc = raw
                    .current_encoder
                    .and_then(|enc| encoders.iter().find(|e| e.handle == enc))
                    .and_then(|enc| enc.crtc);
            }
            connectors.push(Connector {
                handle: raw.handle,
                interface: raw.interface,
                interface_id: raw.interface_id,
                encoders: raw.encoders,
                state: ConnectorState {
                    connection: raw.state,
                    size_mm: raw.size_mm,
                    subpixel: raw.subpixel,
                    modes: raw.modes,
                },
                props,
                committed,
            });
        }

        let mut crtcs = Vec::with_capacity(ids.crtcs.len());
        for (index, handle) in ids.crtcs.iter().enumerate() {
            let raw = io
                .crtc(*handle)
                .map_err(device.access_error("Error loading crtc info"))?;
            let mut props = CrtcProps::default();
            let mut active = None;
            for (info, value) in cache.properties(DrmObject::Crtc(*handle))? {
                if !props.assign(&info.name, info.handle) {
                    trace!(crtc = ?handle, name = info.name, "Ignoring unknown crtc property");
                    continue;
                }
                if info.name == "ACTIVE" {
                    active = Some(value != 0);
                }
            }
            crtcs.push(Crtc {
                handle: raw.handle,
                index,
                gamma_length: raw.gamma_length,
                props,
                committed: CrtcCommitted {
                    active: active.unwrap_or(raw.mode.is_some()),
                    mode: raw.mode,
                    mode_blob: None,
                },
            });
        }
        if crtcs.len() > 32 {
            warn!(count = crtcs.len(), "Crtcs beyond index 31 can not be used with any plane");
        }

        let mut planes = Vec::with_capacity(ids.planes.len());
        for (index, handle) in ids.planes.iter().enumerate() {
            planes.push(Self::load_plane(device, &mut cache, index, *handle)?);
        }

        debug!(
            connectors = connectors.len(),
            encoders = encoders.len(),
            crtcs = crtcs.len(),
            planes = planes.len(),
            "Loaded drm resources"
        );

        Ok(DrmResources {
            connectors,
            encoders,
            crtcs,
            planes,
        })
    }

    fn load_plane(
        device: &DrmDevice,
        cache: &mut PropertyCache<'_>,
        index: usize,
        handle: plane::Handle,
    ) -> Result<Plane, Error> {
        let raw = device
            .io()
            .plane(handle)
            .map_err(device.access_error("Error loading plane info"))?;

        let mut plane = Plane {
            handle,
            index,
            kind: PlaneType::Overlay,
            possible_crtcs: raw.possible_crtcs,
            formats: raw.formats,
            modified_formats: None,
            zpos: None,
            rotation: None,
            alpha_range: None,
            blend_modes: Vec::new(),
            props: PlaneProps::default(),
            committed: PlaneState {
                crtc: raw.crtc,
                fb: raw.framebuffer,
                ..Default::default()
            },
        };
        let mut src = [0u64; 4];
        let mut dst = [0u64; 4];

        for (info, value) in cache.properties(DrmObject::Plane(handle))? {
            if !plane.props.assign(&info.name, info.handle) {
                trace!(plane = ?handle, name = info.name, "Ignoring unknown plane property");
                continue;
            }
            match info.name.as_str() {
                "type" => {
                    plane.kind = match value {
                        v if v == PlaneType::Primary as u64 => PlaneType::Primary,
                        v if v == PlaneType::Cursor as u64 => PlaneType::Cursor,
                        _ => PlaneType::Overlay,
                    }
                }
                "CRTC_ID" => plane.committed.crtc = drm::control::from_u32(value as u32),
                "FB_ID" => plane.committed.fb = drm::control::from_u32(value as u32),
                "SRC_X" => src[0] = value,
                "SRC_Y" => src[1] = value,
                "SRC_W" => src[2] = value,
                "SRC_H" => src[3] = value,
                "CRTC_X" => dst[0] = value,
                "CRTC_Y" => dst[1] = value,
                "CRTC_W" => dst[2] = value,
                "CRTC_H" => dst[3] = value,
                "zpos" => {
                    let (min, max) = range_of(&info.kind).unwrap_or((value as i64, value as i64));
                    plane.zpos = Some(ZposRange {
                        min,
                        max,
                        hardcoded: info.immutable,
                    });
                    plane.committed.zpos = Some(value as i64);
                }
                "rotation" => {
                    let supported = if info.immutable {
                        DrmRotation::from_bits_truncate(value as u32)
                    } else if let PropertyKind::Bitmask(entries) = &info.kind {
                        entries
                            .iter()
                            .filter(|(_, bit)| *bit < 32)
                            .fold(DrmRotation::empty(), |acc, (_, bit)| {
                                acc | DrmRotation::from_bits_truncate(1 << bit)
                            })
                    } else {
                        DrmRotation::ROTATE_0
                    };
                    plane.rotation = Some(RotationSupport {
                        supported,
                        hardcoded: info.immutable,
                    });
                    plane.committed.rotation = Some(DrmRotation::from_bits_truncate(value as u32));
                }
                "alpha" => {
                    plane.alpha_range = range_of(&info.kind).map(|(min, max)| (min as u64, max as u64));
                    plane.committed.alpha = Some(value as u16);
                }
                "pixel blend mode" => {
                    if let PropertyKind::Enum(entries) = &info.kind {
                        plane.blend_modes = entries
                            .iter()
                            .filter_map(|(name, raw)| BlendMode::from_name(name).map(|mode| (mode, *raw)))
                            .collect();
                    }
                    plane.committed.blend_mode = plane
                        .blend_modes
                        .iter()
                        .find(|(_, raw)| *raw == value)
                        .map(|(mode, _)| *mode);
                }
                "IN_FORMATS" if value != 0 => {
                    let blob = device
                        .io()
                        .property_blob(value)
                        .map_err(device.access_error("Error reading IN_FORMATS blob"))?;
                    plane.modified_formats = formats::parse_in_formats(&blob);
                    if plane.modified_formats.is_none() {
                        warn!(plane = ?handle, "Ignoring malformed IN_FORMATS blob");
                    }
                }
                _ => {}
            }
        }

        plane.committed.src = Rectangle::from_loc_and_size(
            (fixed_to_f64(src[0]), fixed_to_f64(src[1])),
            (fixed_to_f64(src[2]), fixed_to_f64(src[3])),
        );
        plane.committed.dst =
            Rectangle::from_loc_and_size((dst[0] as i32, dst[1] as i32), (dst[2] as i32, dst[3] as i32));
        if plane.committed.fb.is_some() {
            plane.committed.format = plane
                .committed
                .fb
                .and_then(|fb| device.framebuffer_info(fb))
                .map(|info| info.format);
        }

        trace!(plane = ?handle, kind = ?plane.kind, zpos = ?plane.zpos, rotation = ?plane.rotation, "Loaded plane");
        Ok(plane)
    }

    /// Creates a snapshot restricted to one connector, encoder and crtc and the given planes
    pub fn new_filtered(
        device: &DrmDevice,
        connector: connector::Handle,
        encoder: encoder::Handle,
        crtc: crtc::Handle,
        planes: &[plane::Handle],
    ) -> Result<Self, Error> {
        Self::new(device)?.dup_filtered(connector, encoder, crtc, planes)
    }

    /// Copies a subset of this snapshot.
    ///
    /// Objects are selected by handle. Crtcs keep their index, so `possible_crtcs`
    /// bitmasks stay valid.
    pub fn dup_filtered(
        &self,
        connector: connector::Handle,
        encoder: encoder::Handle,
        crtc: crtc::Handle,
        planes: &[plane::Handle],
    ) -> Result<Self, Error> {
        let connector = self
            .get_connector(connector)
            .cloned()
            .ok_or(Error::UnknownConnector(connector))?;
        let encoder = self
            .get_encoder(encoder)
            .cloned()
            .ok_or(Error::UnknownEncoder(encoder))?;
        let crtc = self.get_crtc(crtc).cloned().ok_or(Error::UnknownCrtc(crtc))?;
        let planes = planes
            .iter()
            .map(|handle| self.get_plane(*handle).cloned().ok_or(Error::UnknownPlane(*handle)))
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(DrmResources {
            connectors: vec![connector],
            encoders: vec![encoder],
            crtcs: vec![crtc],
            planes,
        })
    }

    /// All connectors
    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    /// All encoders
    pub fn encoders(&self) -> &[Encoder] {
        &self.encoders
    }

    /// All crtcs
    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    /// All planes
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Looks up a connector
    pub fn get_connector(&self, handle: connector::Handle) -> Option<&Connector> {
        self.connectors.iter().find(|conn| conn.handle == handle)
    }

    /// Looks up an encoder
    pub fn get_encoder(&self, handle: encoder::Handle) -> Option<&Encoder> {
        self.encoders.iter().find(|enc| enc.handle == handle)
    }

    /// Looks up a crtc
    pub fn get_crtc(&self, handle: crtc::Handle) -> Option<&Crtc> {
        self.crtcs.iter().find(|crtc| crtc.handle == handle)
    }

    /// Looks up a plane
    pub fn get_plane(&self, handle: plane::Handle) -> Option<&Plane> {
        self.planes.iter().find(|plane| plane.handle == handle)
    }

    pub(crate) fn get_connector_mut(&mut self, handle: connector::Handle) -> Option<&mut Connector> {
        self.connectors.iter_mut().find(|conn| conn.handle == handle)
    }

    pub(crate) fn get_crtc_mut(&mut self, handle: crtc::Handle) -> Option<&mut Crtc> {
        self.crtcs.iter_mut().find(|crtc| crtc.handle == handle)
    }

    pub(crate) fn get_plane_mut(&mut self, handle: plane::Handle) -> Option<&mut Plane> {
        self.planes.iter_mut().find(|plane| plane.handle == handle)
    }

    /// Planes that can be used with `crtc`
    pub fn possible_planes_for_crtc(&self, crtc: crtc::Handle) -> Vec<&Plane> {
        let Some(crtc) = self.get_crtc(crtc) else {
            return Vec::new();
        };
        self.planes.iter().filter(|plane| plane.can_drive(crtc)).collect()
    }

    /// Lowest zpos any plane of `crtc` accepts
    pub fn min_zpos_for_crtc(&self, crtc: crtc::Handle) -> Option<i64> {
        self.possible_planes_for_crtc(crtc)
            .into_iter()
            .filter_map(|plane| plane.zpos.map(|range| range.min))
            .min()
    }

    /// Highest zpos any plane of `crtc` accepts
    pub fn max_zpos_for_crtc(&self, crtc: crtc::Handle) -> Option<i64> {
        self.possible_planes_for_crtc(crtc)
            .into_iter()
            .filter_map(|plane| plane.zpos.map(|range| range.max))
            .max()
    }

    /// Picks a crtc for `connector`: the one it is bound to, or the first one any of
    /// its encoders can be driven by.
    pub fn crtc_for_connector(&self, connector: connector::Handle) -> Option<crtc::Handle> {
        let connector = self.get_connector(connector)?;
        if let Some(crtc) = connector.committed.crtc {
            return Some(crtc);
        }
        connector
            .encoders
            .iter()
            .filter_map(|handle| self.get_encoder(*handle))
            .flat_map(|encoder| {
                self.crtcs
                    .iter()
                    .filter(move |crtc| encoder.possible_crtcs & crtc.bitmask() != 0)
            })
            .map(|crtc| crtc.handle)
            .next()
    }

    /// Restricts the n-th primary and the n-th cursor plane to the n-th crtc.
    ///
    /// Some rockchip drivers report every primary and cursor plane as usable with every
    /// crtc, while they are in fact fixed to one.
    pub fn apply_rockchip_workaround(&mut self) {
        let mut primary = 0u32;
        let mut cursor = 0u32;
        for plane in &mut self.planes {
            let n = match plane.kind {
                PlaneType::Primary => &mut primary,
                PlaneType::Cursor => &mut cursor,
                PlaneType::Overlay => continue,
            };
            plane.possible_crtcs = 1u32.checked_shl(*n).unwrap_or(0);
            trace!(plane = ?plane.handle, possible_crtcs = plane.possible_crtcs, "Applied rockchip workaround");
            *n += 1;
        }
    }

    /// Re-queries the hotplug state of one connector
    pub fn refresh_connector(&mut self, device: &DrmDevice, handle: connector::Handle) -> Result<(), Error> {
        let raw = device
            .io()
            .connector(handle)
            .map_err(device.access_error("Error loading connector info"))?;
        let connector = self
            .get_connector_mut(handle)
            .ok_or(Error::UnknownConnector(handle))?;
        connector.state = ConnectorState {
            connection: raw.state,
            size_mm: raw.size_mm,
            subpixel: raw.subpixel,
            modes: raw.modes,
        };
        debug!(connector = ?handle, state = ?connector.state.connection, "Refreshed connector");
        Ok(())
    }
}
