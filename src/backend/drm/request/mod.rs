//! Per-frame requests of one crtc.
//!
//! A [`KmsReqBuilder`] collects the layers of one frame and assigns every layer a plane
//! of the crtc as it is pushed. [`KmsReqBuilder::build`] turns it into an immutable
//! [`KmsReq`], which assembles the atomic request and commits it exactly once.
//!
//! Layers are pushed bottom to top. The first layer goes onto the primary plane, later
//! layers onto overlay planes with increasing zpos. Cursor planes are only used for
//! layers asking for them.
//!
//! ```rust,ignore
//! let mut builder = KmsReqBuilder::new(device.clone(), resources.clone(), crtc)?;
//! builder.set_mode(mode);
//! builder.set_connector(connector)?;
//! builder.push_fb_layer(KmsFbLayer::fullscreen(fb, DrmFourcc::Xrgb8888, (1920, 1080)), None, None)?;
//! builder.build().commit_nonblocking(Some(Box::new(|metadata| {
//!     // the frame is on screen
//! })))?;
//! ```

use std::fmt;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use drm::control::{connector, crtc, framebuffer, plane, property, Mode, PlaneType, RawResourceHandle};
use drm_fourcc::DrmFourcc;
use tracing::{debug, info_span, instrument, trace, warn};

mod layer;

pub use self::layer::{KmsFbLayer, LayerPlacement};

use super::device::io::AtomicRequest;
use super::device::pageflip::{PendingFlip, ReleaseCallback, ScanoutCallback};
use super::device::{DrmDevice, DrmEventTime, EventMetadata};
use super::error::Error;
use super::resources::{
    CrtcCommitted, DrmResources, DrmRotation, ModeBlob, Plane, PlaneConstraints, PlaneState,
};
use crate::backend::allocator::format::{get_opaque, get_transparent};
use crate::utils::{Monotonic, Time};

/// Callback of a layer using explicit fencing, receives the fence signalled once the
/// framebuffer may be reused. `None` means it can be reused right away.
pub type DeferredReleaseCallback = Box<dyn FnOnce(Option<OwnedFd>) + Send>;

/// Maximum number of layers of one request
pub const MAX_LAYERS: usize = 32;

/// Planes beyond this index can not be tracked by the allocation bitmask
const MAX_PLANES: usize = 64;

fn read(resources: &RwLock<DrmResources>) -> RwLockReadGuard<'_, DrmResources> {
    resources.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(resources: &RwLock<DrmResources>) -> RwLockWriteGuard<'_, DrmResources> {
    resources.write().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
fn to_fixed(n: f64) -> u64 {
    f64::round(n * (1 << 16) as f64) as u64
}

fn require(
    prop: Option<property::Handle>,
    handle: impl Into<RawResourceHandle>,
    name: &'static str,
) -> Result<property::Handle, Error> {
    prop.ok_or(Error::UnknownProperty {
        handle: handle.into(),
        name,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeChange {
    Keep,
    Set(Mode),
    Unset,
}

#[derive(Default)]
struct LayerCallbacks {
    release: Option<ReleaseCallback>,
    deferred_release: Option<DeferredReleaseCallback>,
}

impl LayerCallbacks {
    fn run(self) {
        if let Some(release) = self.release {
            release();
        }
        if let Some(deferred_release) = self.deferred_release {
            deferred_release(None);
        }
    }
}

/// Callbacks of the layers of a built request.
///
/// Shared between the request and the device while the request is on screen, so neither
/// keeps the other alive. Whatever was not run by then runs once both let go.
struct LayerRelease {
    callbacks: Mutex<Vec<LayerCallbacks>>,
    span: tracing::Span,
}

impl LayerRelease {
    fn run(&self) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner));
        if callbacks.is_empty() {
            return;
        }
        let _guard = self.span.enter();
        trace!(layers = callbacks.len(), "Releasing framebuffers");
        for callbacks in callbacks {
            callbacks.run();
        }
    }
}

impl fmt::Debug for LayerRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerRelease")
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Drop for LayerRelease {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for LayerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerCallbacks")
            .field("release", &self.release.is_some())
            .field("deferred_release", &self.deferred_release.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct PlacedLayer {
    layer: KmsFbLayer,
    placement: LayerPlacement,
}

/// Builder of the request of one frame on one crtc
#[derive(Debug)]
pub struct KmsReqBuilder {
    device: Arc<DrmDevice>,
    resources: Arc<RwLock<DrmResources>>,
    crtc: crtc::Handle,
    legacy: bool,
    connector: Option<connector::Handle>,
    mode: ModeChange,
    layers: Vec<PlacedLayer>,
    callbacks: Vec<LayerCallbacks>,
    available_planes: u64,
    next_zpos: i64,
    span: tracing::Span,
}

impl KmsReqBuilder {
    /// Creates a builder using atomic modesetting if the device supports it
    pub fn new(
        device: Arc<DrmDevice>,
        resources: Arc<RwLock<DrmResources>>,
        crtc: crtc::Handle,
    ) -> Result<Self, Error> {
        let legacy = !device.is_atomic();
        Self::create(device, resources, crtc, legacy)
    }

    /// Creates a builder for an atomic request.
    ///
    /// Fails with [`Error::AtomicUnsupported`] if the device uses legacy modesetting.
    pub fn new_atomic(
        device: Arc<DrmDevice>,
        resources: Arc<RwLock<DrmResources>>,
        crtc: crtc::Handle,
    ) -> Result<Self, Error> {
        if !device.is_atomic() {
            return Err(Error::AtomicUnsupported);
        }
        Self::create(device, resources, crtc, false)
    }

    /// Creates a builder for the legacy api, which only supports a single layer
    pub fn new_legacy(
        device: Arc<DrmDevice>,
        resources: Arc<RwLock<DrmResources>>,
        crtc: crtc::Handle,
    ) -> Result<Self, Error> {
        Self::create(device, resources, crtc, true)
    }

    fn create(
        device: Arc<DrmDevice>,
        resources: Arc<RwLock<DrmResources>>,
        crtc: crtc::Handle,
        legacy: bool,
    ) -> Result<Self, Error> {
        let span = info_span!(parent: device.span(), "kms_req", crtc = ?crtc);
        let (available_planes, next_zpos) = {
            let res = read(&resources);
            let crtc_info = res.get_crtc(crtc).ok_or(Error::UnknownCrtc(crtc))?;
            if res.planes().len() > MAX_PLANES {
                let _guard = span.enter();
                warn!(
                    planes = res.planes().len(),
                    "Only the first {} planes can be allocated", MAX_PLANES
                );
            }
            let available = res
                .planes()
                .iter()
                .take(MAX_PLANES)
                .enumerate()
                .filter(|(_, plane)| plane.can_drive(crtc_info))
                .fold(0u64, |mask, (index, _)| mask | (1 << index));
            (available, res.min_zpos_for_crtc(crtc).unwrap_or(0))
        };

        Ok(KmsReqBuilder {
            device,
            resources,
            crtc,
            legacy,
            connector: None,
            mode: ModeChange::Keep,
            layers: Vec::new(),
            callbacks: Vec::new(),
            available_planes,
            next_zpos,
            span,
        })
    }

    /// The crtc of this request
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// Whether the request goes through the legacy api
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Programs `mode` with this request
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = ModeChange::Set(mode);
    }

    /// Disables the crtc with this request
    pub fn unset_mode(&mut self) {
        self.mode = ModeChange::Unset;
    }

    /// Binds `connector` to the crtc with this request
    pub fn set_connector(&mut self, connector: connector::Handle) -> Result<(), Error> {
        if read(&self.resources).get_connector(connector).is_none() {
            return Err(Error::UnknownConnector(connector));
        }
        self.connector = Some(connector);
        Ok(())
    }

    /// Number of layers pushed so far
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// The plane chosen for the layer at `index`
    pub fn placement(&self, index: usize) -> Option<LayerPlacement> {
        self.layers.get(index).map(|placed| placed.placement)
    }

    /// Bitmask of planes, by position in the resources, still free for this request
    pub fn available_planes(&self) -> u64 {
        self.available_planes
    }

    fn find_plane<'r>(
        &self,
        res: &'r DrmResources,
        constraints: &PlaneConstraints,
        filter: impl Fn(&Plane) -> bool,
    ) -> Option<(usize, &'r Plane)> {
        res.planes()
            .iter()
            .take(MAX_PLANES)
            .enumerate()
            .filter(|(index, _)| self.available_planes & (1 << index) != 0)
            .find(|(_, plane)| plane.qualifies(constraints) && filter(*plane))
    }

    /// Assigns a plane to `layer` and adds it on top of the layers pushed before.
    ///
    /// `release` is invoked once the framebuffer is no longer shown, either because a
    /// later request replaced this one on screen or because the request was dropped
    /// without being displayed. `deferred_release` is invoked at the same time without a
    /// fence.
    ///
    /// Returns the index of the layer. On error no layer is added.
    #[profiling::function]
    pub fn push_fb_layer(
        &mut self,
        layer: KmsFbLayer,
        release: Option<ReleaseCallback>,
        deferred_release: Option<DeferredReleaseCallback>,
    ) -> Result<usize, Error> {
        let _guard = self.span.enter();
        let index = self.layers.len();
        if index >= MAX_LAYERS {
            return Err(Error::TooManyLayers(self.crtc));
        }
        if self.legacy && index > 0 {
            return Err(Error::LegacyMultipleLayers(self.crtc));
        }

        let resources = self.resources.clone();
        let res = read(&resources);
        let constraints = |types: &'static [PlaneType], format: DrmFourcc, zpos, id_above| PlaneConstraints {
            types,
            format,
            modifier: layer.modifier,
            zpos,
            rotation: layer.rotation,
            id_above,
        };

        let mut choice = None;
        let mut as_cursor = false;
        if layer.prefer_cursor {
            choice = self.find_plane(&res, &constraints(&[PlaneType::Cursor], layer.format, None, None), |_| true);
            as_cursor = choice.is_some();
        }
        if choice.is_none() && index == 0 {
            choice = self.find_plane(&res, &constraints(&[PlaneType::Primary], layer.format, None, None), |_| true);
            if choice.is_none() {
                if let Some(opaque) = get_opaque(layer.format) {
                    trace!(format = ?layer.format, ?opaque, "Retrying with the opaque format");
                    choice = self.find_plane(&res, &constraints(&[PlaneType::Primary], opaque, None, None), |_| true);
                }
            }
            // nothing is below the bottom layer, alpha of an opaque buffer has no effect there
            if choice.is_none() {
                if let Some(alpha) = get_transparent(layer.format) {
                    trace!(format = ?layer.format, ?alpha, "Retrying with the alpha format");
                    choice = self.find_plane(&res, &constraints(&[PlaneType::Primary], alpha, None, None), |_| true);
                }
            }
        } else if choice.is_none() {
            choice = self.find_plane(
                &res,
                &constraints(&[PlaneType::Overlay], layer.format, Some((self.next_zpos, i64::MAX)), None),
                |_| true,
            );
            if choice.is_none() {
                let previous = self.layers.iter().rev().find_map(|placed| placed.placement.plane);
                choice = self.find_plane(
                    &res,
                    &constraints(&[PlaneType::Overlay], layer.format, None, previous),
                    |plane| plane.zpos().is_none(),
                );
            }
        }

        let placement = match choice {
            Some((position, plane)) => {
                let zpos = match plane.zpos() {
                    Some(_) if as_cursor => None,
                    Some(range) => {
                        let zpos = if range.hardcoded {
                            range.min
                        } else {
                            self.next_zpos.max(range.min)
                        };
                        if zpos > range.max {
                            return Err(Error::InvalidZpos {
                                min: zpos,
                                max: range.max,
                            });
                        }
                        self.next_zpos = self.next_zpos.max(zpos + 1);
                        Some(zpos)
                    }
                    None => None,
                };
                self.available_planes &= !(1 << position);
                LayerPlacement {
                    plane: Some(plane.handle()),
                    kind: plane.kind(),
                    zpos,
                }
            }
            None if self.legacy
                && !res
                    .possible_planes_for_crtc(self.crtc)
                    .iter()
                    .any(|plane| plane.kind() == PlaneType::Primary) =>
            {
                // without universal planes the primary plane is implicit
                LayerPlacement {
                    plane: None,
                    kind: PlaneType::Primary,
                    zpos: None,
                }
            }
            None => {
                debug!(index, format = ?layer.format, modifier = ?layer.modifier, "No plane qualifies for layer");
                return Err(Error::NoSuitablePlane { crtc: self.crtc, layer: index });
            }
        };
        drop(res);

        trace!(index, plane = ?placement.plane, kind = ?placement.kind, zpos = ?placement.zpos, "Allocated plane for layer");
        self.layers.push(PlacedLayer { layer, placement });
        self.callbacks.push(LayerCallbacks {
            release,
            deferred_release,
        });
        Ok(index)
    }

    /// Finishes the request
    pub fn build(mut self) -> Arc<KmsReq> {
        Arc::new(KmsReq {
            device: self.device.clone(),
            resources: self.resources.clone(),
            crtc: self.crtc,
            legacy: self.legacy,
            connector: self.connector,
            mode: self.mode,
            layers: std::mem::take(&mut self.layers),
            release: Arc::new(LayerRelease {
                callbacks: Mutex::new(std::mem::take(&mut self.callbacks)),
                span: self.span.clone(),
            }),
            committed: AtomicBool::new(false),
            span: self.span.clone(),
        })
    }
}

impl Drop for KmsReqBuilder {
    fn drop(&mut self) {
        for callbacks in self.callbacks.drain(..) {
            callbacks.run();
        }
    }
}

struct AtomicCommit {
    req: AtomicRequest,
    allow_modeset: bool,
    mode_blob: Option<Arc<ModeBlob>>,
    disabled: Vec<plane::Handle>,
}

enum LegacyCommit {
    Disable,
    Modeset {
        fb: framebuffer::Handle,
        connectors: Vec<connector::Handle>,
        mode: Option<Mode>,
        /// a page flip does not suffice
        required: bool,
    },
}

/// A finished request, committed at most once.
///
/// While the request is shown on screen the device keeps the release callbacks of its
/// layers, and invokes them once another commit replaced it. Requests that never made it
/// to the screen invoke them when dropped.
#[derive(Debug)]
pub struct KmsReq {
    device: Arc<DrmDevice>,
    resources: Arc<RwLock<DrmResources>>,
    crtc: crtc::Handle,
    legacy: bool,
    connector: Option<connector::Handle>,
    mode: ModeChange,
    layers: Vec<PlacedLayer>,
    release: Arc<LayerRelease>,
    committed: AtomicBool,
    span: tracing::Span,
}

impl KmsReq {
    /// The crtc of this request
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// Number of layers
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// The plane chosen for the layer at `index`
    pub fn placement(&self, index: usize) -> Option<LayerPlacement> {
        self.layers.get(index).map(|placed| placed.placement)
    }

    /// Whether the request was handed to the kernel
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<(), Error> {
        if self.committed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyCommitted(self.crtc));
        }
        Ok(())
    }

    /// Callback releasing the layers once the request left the screen
    fn keepalive(&self) -> ReleaseCallback {
        let release = self.release.clone();
        Box::new(move || release.run())
    }

    #[profiling::function]
    fn assemble(&self) -> Result<AtomicCommit, Error> {
        let res = read(&self.resources);
        let crtc = res.get_crtc(self.crtc).ok_or(Error::UnknownCrtc(self.crtc))?;
        let crtc_props = crtc.props();
        let mut req = AtomicRequest::new();
        let mut allow_modeset = false;
        let mut mode_blob = None;

        match &self.mode {
            ModeChange::Keep => {}
            ModeChange::Set(mode) => {
                let active = require(crtc_props.active, self.crtc, "ACTIVE")?;
                if crtc.committed().mode.as_ref() != Some(mode) {
                    let mode_id = require(crtc_props.mode_id, self.crtc, "MODE_ID")?;
                    let id = self
                        .device
                        .io()
                        .create_mode_blob(mode)
                        .map_err(self.device.access_error("Failed to create mode blob"))?;
                    trace!(blob = id, ?mode, "Uploaded mode");
                    mode_blob = Some(Arc::new(ModeBlob::new(id, self.device.io_handle())));
                    req.add_property(self.crtc, mode_id, id);
                    allow_modeset = true;
                }
                if !crtc.committed().active {
                    allow_modeset = true;
                }
                req.add_property(self.crtc, active, 1);
            }
            ModeChange::Unset => {
                let mode_id = require(crtc_props.mode_id, self.crtc, "MODE_ID")?;
                let active = require(crtc_props.active, self.crtc, "ACTIVE")?;
                req.add_property(self.crtc, mode_id, 0);
                req.add_property(self.crtc, active, 0);
                allow_modeset = true;
            }
        }

        if let Some(handle) = self.connector {
            let conn = res
                .get_connector(handle)
                .ok_or(Error::UnknownConnector(handle))?;
            let crtc_id = require(conn.props().crtc_id, handle, "CRTC_ID")?;
            let target = match self.mode {
                ModeChange::Unset => None,
                _ => Some(self.crtc),
            };
            if conn.committed().crtc != target {
                allow_modeset = true;
            }
            req.add_property(handle, crtc_id, target.map(u32::from).unwrap_or(0) as u64);
        }

        for placed in &self.layers {
            let Some(handle) = placed.placement.plane else {
                continue;
            };
            let plane = res.get_plane(handle).ok_or(Error::UnknownPlane(handle))?;
            let props = plane.props();
            let layer = &placed.layer;

            req.add_property(handle, require(props.crtc_id, handle, "CRTC_ID")?, u32::from(self.crtc) as u64);
            req.add_property(handle, require(props.fb_id, handle, "FB_ID")?, u32::from(layer.fb) as u64);
            // these are 16.16. fixed point
            req.add_property(handle, require(props.src_x, handle, "SRC_X")?, to_fixed(layer.src.loc.x));
            req.add_property(handle, require(props.src_y, handle, "SRC_Y")?, to_fixed(layer.src.loc.y));
            req.add_property(handle, require(props.src_w, handle, "SRC_W")?, to_fixed(layer.src.size.w));
            req.add_property(handle, require(props.src_h, handle, "SRC_H")?, to_fixed(layer.src.size.h));
            req.add_property(
                handle,
                require(props.crtc_x, handle, "CRTC_X")?,
                layer.dst.loc.x as i64 as u64,
            );
            req.add_property(
                handle,
                require(props.crtc_y, handle, "CRTC_Y")?,
                layer.dst.loc.y as i64 as u64,
            );
            req.add_property(handle, require(props.crtc_w, handle, "CRTC_W")?, layer.dst.size.w as u64);
            req.add_property(handle, require(props.crtc_h, handle, "CRTC_H")?, layer.dst.size.h as u64);

            if let (Some(zpos), Some(prop), Some(range)) = (placed.placement.zpos, props.zpos, plane.zpos()) {
                if !range.hardcoded {
                    req.add_property(handle, prop, zpos as u64);
                }
            }
            if let (Some(prop), Some(support)) = (props.rotation, plane.rotation()) {
                if !support.hardcoded {
                    let rotation = layer.rotation.unwrap_or(DrmRotation::ROTATE_0);
                    req.add_property(handle, prop, rotation.bits() as u64);
                }
            }
            match (props.alpha, plane.alpha_range()) {
                (Some(prop), Some((_, max))) => {
                    let alpha = layer.alpha.map(u64::from).unwrap_or(max);
                    req.add_property(handle, prop, alpha.min(max));
                }
                _ if layer.alpha.is_some_and(|alpha| alpha != u16::MAX) => {
                    return Err(Error::UnknownProperty {
                        handle: handle.into(),
                        name: "alpha",
                    });
                }
                _ => {}
            }
            if let Some(mode) = layer.blend_mode {
                let prop = require(props.pixel_blend_mode, handle, "pixel blend mode")?;
                let value = plane.blend_mode_value(mode).ok_or(Error::UnknownProperty {
                    handle: handle.into(),
                    name: "pixel blend mode",
                })?;
                req.add_property(handle, prop, value);
            }
            if let Some(fence) = layer.in_fence_fd.as_ref() {
                let prop = require(props.in_fence_fd, handle, "IN_FENCE_FD")?;
                req.add_property(handle, prop, fence.as_raw_fd() as u64);
            }
            if let Some(prop) = props.fb_damage_clips {
                req.add_property(handle, prop, 0);
            }
        }

        let mut disabled = Vec::new();
        for plane in res.planes() {
            if plane.committed().crtc != Some(self.crtc)
                || self.layers.iter().any(|placed| placed.placement.plane == Some(plane.handle()))
            {
                continue;
            }
            let props = plane.props();
            if let (Some(crtc_id), Some(fb_id)) = (props.crtc_id, props.fb_id) {
                req.add_property(plane.handle(), crtc_id, 0);
                req.add_property(plane.handle(), fb_id, 0);
                disabled.push(plane.handle());
            }
        }

        Ok(AtomicCommit {
            req,
            allow_modeset,
            mode_blob,
            disabled,
        })
    }

    fn plan_legacy(&self) -> Result<LegacyCommit, Error> {
        let res = read(&self.resources);
        let crtc = res.get_crtc(self.crtc).ok_or(Error::UnknownCrtc(self.crtc))?;
        if self.mode == ModeChange::Unset {
            return Ok(LegacyCommit::Disable);
        }
        let fb = self
            .layers
            .first()
            .map(|placed| placed.layer.fb)
            .ok_or(Error::MissingFramebuffer(self.crtc))?;
        let mode = match self.mode {
            ModeChange::Set(mode) => Some(mode),
            _ => crtc.committed().mode,
        };
        let rebind = self.connector.is_some_and(|handle| {
            res.get_connector(handle)
                .is_some_and(|conn| conn.committed().crtc != Some(self.crtc))
        });

        let required = rebind || !crtc.committed().active || mode != crtc.committed().mode;
        let connectors = match self.connector {
            Some(handle) => vec![handle],
            None => res
                .connectors()
                .iter()
                .filter(|conn| conn.committed().crtc == Some(self.crtc))
                .map(|conn| conn.handle())
                .collect(),
        };
        Ok(LegacyCommit::Modeset {
            fb,
            connectors,
            mode,
            required,
        })
    }

    /// Mirrors the just committed values into the resources
    fn apply(&self, mode_blob: Option<Arc<ModeBlob>>, disabled: &[plane::Handle]) {
        let mut res = write(&self.resources);
        if let Some(crtc) = res.get_crtc_mut(self.crtc) {
            match self.mode {
                ModeChange::Keep => {}
                ModeChange::Set(mode) => {
                    crtc.committed.active = true;
                    crtc.committed.mode = Some(mode);
                    if mode_blob.is_some() {
                        crtc.committed.mode_blob = mode_blob;
                    }
                }
                ModeChange::Unset => crtc.committed = CrtcCommitted::default(),
            }
        }
        if let Some(handle) = self.connector {
            if let Some(conn) = res.get_connector_mut(handle) {
                conn.committed.crtc = match self.mode {
                    ModeChange::Unset => None,
                    _ => Some(self.crtc),
                };
            }
        }
        for placed in &self.layers {
            let Some(plane) = placed.placement.plane.and_then(|handle| res.get_plane_mut(handle)) else {
                continue;
            };
            let layer = &placed.layer;
            let previous = plane.committed.clone();
            plane.committed = PlaneState {
                crtc: Some(self.crtc),
                fb: Some(layer.fb),
                src: layer.src,
                dst: layer.dst,
                zpos: placed.placement.zpos.or(previous.zpos),
                rotation: plane
                    .rotation()
                    .map(|support| {
                        if support.hardcoded {
                            support.supported
                        } else {
                            layer.rotation.unwrap_or(DrmRotation::ROTATE_0)
                        }
                    }),
                alpha: plane
                    .alpha_range()
                    .map(|(_, max)| layer.alpha.map(u64::from).unwrap_or(max).min(max) as u16),
                blend_mode: layer.blend_mode.or(previous.blend_mode),
                format: Some(layer.format),
            };
        }
        for handle in disabled {
            if let Some(plane) = res.get_plane_mut(*handle) {
                plane.committed.crtc = None;
                plane.committed.fb = None;
            }
        }
    }

    fn commit_now(self: &Arc<Self>) -> Result<Time<Monotonic>, Error> {
        let time = if self.legacy {
            let time = match self.plan_legacy()? {
                LegacyCommit::Disable => self.device.commit_legacy_sync(self.crtc, None, &[], None)?,
                LegacyCommit::Modeset {
                    fb, connectors, mode, ..
                } => self.device.commit_legacy_sync(self.crtc, Some(fb), &connectors, mode)?,
            };
            self.apply(None, &[]);
            time
        } else {
            let commit = self.assemble()?;
            let time = self.device.commit_atomic_sync(&commit.req, commit.allow_modeset)?;
            self.apply(commit.mode_blob, &commit.disabled);
            time
        };

        let on_release = match self.mode {
            ModeChange::Unset => None,
            _ => Some(self.keepalive()),
        };
        self.device.set_displayed(self.crtc, on_release);
        Ok(time)
    }

    /// Commits the request and waits until it is applied.
    ///
    /// Returns the time the commit completed. Failed commits change nothing and may be
    /// retried.
    #[instrument(level = "debug", parent = &self.span, skip(self), fields(layers = self.layers.len()))]
    pub fn commit_blocking(self: &Arc<Self>) -> Result<Time<Monotonic>, Error> {
        self.begin()?;
        let result = self.commit_now();
        if result.is_err() {
            self.committed.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Submits the request without waiting for it.
    ///
    /// `on_scanout` is invoked from [`DrmDevice::dispatch_modesetting`] once the frame is
    /// on screen. Requests changing the mode through the legacy api and requests
    /// disabling the crtc are applied right away and `on_scanout` is invoked before
    /// returning.
    #[instrument(level = "debug", parent = &self.span, skip(self, on_scanout), fields(layers = self.layers.len()))]
    pub fn commit_nonblocking(self: &Arc<Self>, on_scanout: Option<ScanoutCallback>) -> Result<(), Error> {
        self.begin()?;
        let result = self.submit(on_scanout);
        if result.is_err() {
            self.committed.store(false, Ordering::SeqCst);
        }
        result
    }

    fn submit(self: &Arc<Self>, on_scanout: Option<ScanoutCallback>) -> Result<(), Error> {
        let immediate = |time: Time<Monotonic>, on_scanout: Option<ScanoutCallback>| {
            if let Some(on_scanout) = on_scanout {
                on_scanout(&EventMetadata {
                    time: DrmEventTime::Monotonic(time),
                    sequence: 0,
                });
            }
        };

        if self.mode == ModeChange::Unset {
            let time = self.commit_now()?;
            immediate(time, on_scanout);
            return Ok(());
        }

        if self.legacy {
            return match self.plan_legacy()? {
                LegacyCommit::Modeset {
                    fb, required: false, ..
                } => {
                    let flip = PendingFlip {
                        on_scanout,
                        on_release: Some(self.keepalive()),
                    };
                    self.device.commit_legacy_async(self.crtc, fb, flip)?;
                    self.apply(None, &[]);
                    Ok(())
                }
                _ => {
                    let time = self.commit_now()?;
                    immediate(time, on_scanout);
                    Ok(())
                }
            };
        }

        let commit = self.assemble()?;
        let flip = PendingFlip {
            on_scanout,
            on_release: Some(self.keepalive()),
        };
        self.device
            .commit_atomic_async(&commit.req, commit.allow_modeset, self.crtc, flip)?;
        self.apply(commit.mode_blob, &commit.disabled);
        Ok(())
    }

    /// Checks the request with the kernel without applying it
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    pub fn test(&self, allow_modeset: bool) -> Result<(), Error> {
        if self.legacy {
            return self.plan_legacy().map(|_| ());
        }
        let commit = self.assemble()?;
        self.device
            .test_atomic(&commit.req, allow_modeset || commit.allow_modeset)
    }
}
