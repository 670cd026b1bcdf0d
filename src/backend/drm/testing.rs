//! In-memory [`KmsIo`] implementation for unit tests

use std::collections::HashMap;
use std::io;
use std::os::unix::io::BorrowedFd;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::Duration;

use drm::control::{
    connector, crtc, encoder, framebuffer, plane, property, AtomicCommitFlags, Mode, PlaneType,
    RawResourceHandle,
};
use drm::{ClientCapability, DriverCapability};
use drm_fourcc::{DrmFourcc, DrmModifier};

use super::device::io::{
    AtomicRequest, DrmObject, DumbAllocation, FramebufferDesc, KmsIo, MemoryMapping, PageFlip, PropertyInfo,
    PropertyKind, RawConnector, RawCrtc, RawEncoder, RawPlane, ResourceIds,
};
use super::resources::{formats, DrmRotation};

/// Installs a test subscriber once per test binary
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A 60Hz mode of the given size
pub(crate) fn mode(width: u16, height: u16) -> Mode {
    // SAFETY: plain old data, all zeroes is a valid value
    let mut raw: drm_ffi::drm_mode_modeinfo = unsafe { std::mem::zeroed() };
    raw.hdisplay = width;
    raw.hsync_start = width + 88;
    raw.hsync_end = width + 132;
    raw.htotal = width + 280;
    raw.vdisplay = height;
    raw.vsync_start = height + 4;
    raw.vsync_end = height + 9;
    raw.vtotal = height + 45;
    raw.vrefresh = 60;
    raw.clock = (raw.htotal as u32 * raw.vtotal as u32 * 60) / 1000;
    for (dst, src) in raw.name.iter_mut().zip(format!("{width}x{height}").bytes()) {
        *dst = src as _;
    }
    Mode::from(raw)
}

/// Plane description for [`FakeDevice::with_plane`]
#[derive(Debug, Clone)]
pub(crate) struct FakePlane {
    kind: PlaneType,
    formats: Vec<DrmFourcc>,
    modifiers: Vec<DrmModifier>,
    zpos: Option<(i64, i64, bool)>,
    rotation: Option<(DrmRotation, bool)>,
    alpha: bool,
    blend_modes: bool,
    possible_crtcs: Option<u32>,
}

impl FakePlane {
    pub(crate) fn new(kind: PlaneType, formats: &[DrmFourcc]) -> Self {
        FakePlane {
            kind,
            formats: formats.to_vec(),
            modifiers: Vec::new(),
            zpos: None,
            rotation: None,
            alpha: false,
            blend_modes: false,
            possible_crtcs: None,
        }
    }

    pub(crate) fn zpos(mut self, min: i64, max: i64, immutable: bool) -> Self {
        self.zpos = Some((min, max, immutable));
        self
    }

    pub(crate) fn rotation(mut self, rotation: DrmRotation, immutable: bool) -> Self {
        self.rotation = Some((rotation, immutable));
        self
    }

    pub(crate) fn with_alpha(mut self) -> Self {
        self.alpha = true;
        self
    }

    pub(crate) fn with_blend_modes(mut self) -> Self {
        self.blend_modes = true;
        self
    }

    /// Reports an `IN_FORMATS` blob listing every format with each of `modifiers`
    pub(crate) fn modifiers(mut self, modifiers: &[DrmModifier]) -> Self {
        self.modifiers = modifiers.to_vec();
        self
    }

    pub(crate) fn possible_crtcs(mut self, mask: u32) -> Self {
        self.possible_crtcs = Some(mask);
        self
    }
}

/// A call of the legacy api
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LegacyCall {
    SetCrtc {
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: Vec<connector::Handle>,
        mode: Option<Mode>,
    },
    PageFlip {
        crtc: crtc::Handle,
        fb: framebuffer::Handle,
    },
}

#[derive(Debug)]
struct FakeState {
    atomic: bool,
    next_object: u32,
    next_property: u32,
    next_blob: u64,

    connectors: Vec<RawConnector>,
    encoders: Vec<RawEncoder>,
    crtcs: Vec<RawCrtc>,
    planes: Vec<(RawPlane, Option<u32>)>,

    global_props: HashMap<String, property::Handle>,
    infos: HashMap<property::Handle, PropertyInfo>,
    values: HashMap<RawResourceHandle, Vec<(property::Handle, u64)>>,
    blobs: HashMap<u64, Vec<u8>>,
    created_mode_blobs: usize,

    framebuffers: Vec<FramebufferDesc>,
    fb_handles: Vec<framebuffer::Handle>,
    open_gem_handles: usize,
    dumb_buffers: usize,

    commits: Vec<(AtomicCommitFlags, AtomicRequest)>,
    legacy_calls: Vec<LegacyCall>,
    events: Vec<PageFlip>,
    hold_events: bool,
    sequence: u32,

    fail_commit: Option<i32>,
    fail_prime_import: Option<i32>,
    fail_plane_queries: Option<i32>,
}

/// A drm device living in memory
///
/// Records every commit and applies the property values of non-test commits. A commit
/// requesting events gets one for every crtc it sets properties on or whose planes it
/// changes.
#[derive(Debug)]
pub(crate) struct FakeDevice {
    state: Mutex<FakeState>,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn handle<T: drm::control::ResourceHandle>(id: u32) -> T {
    drm::control::from_u32(id).unwrap()
}

impl FakeState {
    fn object(&mut self) -> u32 {
        self.next_object += 1;
        self.next_object
    }

    fn new_property(&mut self, name: &str, kind: PropertyKind, immutable: bool) -> property::Handle {
        self.next_property += 1;
        let prop: property::Handle = handle(self.next_property);
        self.infos.insert(
            prop,
            PropertyInfo {
                handle: prop,
                name: name.to_owned(),
                immutable,
                atomic: false,
                kind,
            },
        );
        prop
    }

    fn global_property(&mut self, name: &str, kind: PropertyKind) -> property::Handle {
        if let Some(prop) = self.global_props.get(name) {
            return *prop;
        }
        let prop = self.new_property(name, kind, false);
        self.global_props.insert(name.to_owned(), prop);
        prop
    }

    fn attach(&mut self, object: impl Into<RawResourceHandle>, prop: property::Handle, value: u64) {
        self.values.entry(object.into()).or_default().push((prop, value));
    }

    fn value(&self, object: RawResourceHandle, prop: property::Handle) -> Option<u64> {
        self.values
            .get(&object)
            .and_then(|values| values.iter().find(|(handle, _)| *handle == prop))
            .map(|(_, value)| *value)
    }

    fn crtc_mask(&self) -> u32 {
        (1u32 << self.crtcs.len()) - 1
    }

    fn queue_flip(&mut self, crtc: crtc::Handle) {
        if self.hold_events {
            return;
        }
        self.sequence += 1;
        self.events.push(PageFlip {
            crtc,
            frame: self.sequence,
            duration: Duration::from_nanos(self.sequence as u64 * 16_666_667),
        });
    }
}

impl FakeDevice {
    /// A device without any objects
    pub(crate) fn new() -> Self {
        FakeDevice {
            state: Mutex::new(FakeState {
                atomic: true,
                next_object: 0,
                next_property: 100,
                next_blob: 1000,
                connectors: Vec::new(),
                encoders: Vec::new(),
                crtcs: Vec::new(),
                planes: Vec::new(),
                global_props: HashMap::new(),
                infos: HashMap::new(),
                values: HashMap::new(),
                blobs: HashMap::new(),
                created_mode_blobs: 0,
                framebuffers: Vec::new(),
                fb_handles: Vec::new(),
                open_gem_handles: 0,
                dumb_buffers: 0,
                commits: Vec::new(),
                legacy_calls: Vec::new(),
                events: Vec::new(),
                hold_events: false,
                sequence: 0,
                fail_commit: None,
                fail_prime_import: None,
                fail_plane_queries: None,
            }),
        }
    }

    /// One connected 1920x1080 connector, one crtc, a primary plane (ARGB8888/XRGB8888,
    /// zpos fixed to 0) and an overlay plane (ARGB8888, zpos 1 to 15, linear modifier)
    pub(crate) fn single_output() -> Self {
        FakeDevice::new()
            .with_connector(true)
            .with_crtc()
            .with_plane(FakePlane::new(PlaneType::Primary, &[DrmFourcc::Argb8888, DrmFourcc::Xrgb8888]).zpos(0, 0, true))
            .with_plane(
                FakePlane::new(PlaneType::Overlay, &[DrmFourcc::Argb8888])
                    .zpos(1, 15, false)
                    .modifiers(&[DrmModifier::Linear]),
            )
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Refuses the atomic client capability
    pub(crate) fn without_atomic(self) -> Self {
        self.state().atomic = false;
        self
    }

    /// Adds a connector with its own encoder
    pub(crate) fn with_connector(self, connected: bool) -> Self {
        {
            let mut state = self.state();
            let encoder: encoder::Handle = handle(state.object());
            let conn: connector::Handle = handle(state.object());
            state.encoders.push(RawEncoder {
                handle: encoder,
                kind: encoder::Kind::TMDS,
                crtc: None,
                possible_crtcs: 0,
                possible_clones: 0,
            });
            let interface_id = state.connectors.len() as u32 + 1;
            state.connectors.push(RawConnector {
                handle: conn,
                interface: connector::Interface::HDMIA,
                interface_id,
                state: if connected {
                    connector::State::Connected
                } else {
                    connector::State::Disconnected
                },
                size_mm: connected.then_some((520, 290)),
                subpixel: connector::SubPixel::Unknown,
                modes: if connected { vec![mode(1920, 1080)] } else { Vec::new() },
                encoders: vec![encoder],
                current_encoder: None,
            });
            let crtc_id = state.global_property("CRTC_ID", PropertyKind::Object);
            let dpms = state.global_property(
                "DPMS",
                PropertyKind::Enum(vec![("On".into(), 0), ("Off".into(), 3)]),
            );
            state.attach(conn, crtc_id, 0);
            state.attach(conn, dpms, 0);
        }
        self
    }

    pub(crate) fn with_crtc(self) -> Self {
        {
            let mut state = self.state();
            let crtc: crtc::Handle = handle(state.object());
            state.crtcs.push(RawCrtc {
                handle: crtc,
                mode: None,
                framebuffer: None,
                position: (0, 0),
                gamma_length: 256,
            });
            let active = state.global_property("ACTIVE", PropertyKind::Range { min: 0, max: 1 });
            let mode_id = state.global_property("MODE_ID", PropertyKind::Blob);
            state.attach(crtc, active, 0);
            state.attach(crtc, mode_id, 0);
        }
        self
    }

    pub(crate) fn with_plane(self, desc: FakePlane) -> Self {
        {
            let mut state = self.state();
            let plane: plane::Handle = handle(state.object());
            state.planes.push((
                RawPlane {
                    handle: plane,
                    crtc: None,
                    framebuffer: None,
                    possible_crtcs: 0,
                    formats: desc.formats.iter().map(|f| *f as u32).collect(),
                },
                desc.possible_crtcs,
            ));

            let kind = state.global_property(
                "type",
                PropertyKind::Enum(vec![
                    ("Overlay".into(), 0),
                    ("Primary".into(), 1),
                    ("Cursor".into(), 2),
                ]),
            );
            state.attach(plane, kind, desc.kind as u64);
            for name in ["SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_W", "CRTC_H"] {
                let prop = state.global_property(name, PropertyKind::Range { min: 0, max: u32::MAX as u64 });
                state.attach(plane, prop, 0);
            }
            for name in ["CRTC_X", "CRTC_Y"] {
                let prop = state.global_property(
                    name,
                    PropertyKind::SignedRange {
                        min: i32::MIN as i64,
                        max: i32::MAX as i64,
                    },
                );
                state.attach(plane, prop, 0);
            }
            for name in ["FB_ID", "CRTC_ID"] {
                let prop = state.global_property(name, PropertyKind::Object);
                state.attach(plane, prop, 0);
            }
            let fence = state.global_property("IN_FENCE_FD", PropertyKind::SignedRange { min: -1, max: i32::MAX as i64 });
            state.attach(plane, fence, u64::MAX);
            let damage = state.global_property("FB_DAMAGE_CLIPS", PropertyKind::Blob);
            state.attach(plane, damage, 0);

            if let Some((min, max, immutable)) = desc.zpos {
                let prop = state.new_property(
                    "zpos",
                    PropertyKind::Range {
                        min: min as u64,
                        max: max as u64,
                    },
                    immutable,
                );
                state.attach(plane, prop, min as u64);
            }
            if let Some((rotation, immutable)) = desc.rotation {
                let entries = [
                    "rotate-0",
                    "rotate-90",
                    "rotate-180",
                    "rotate-270",
                    "reflect-x",
                    "reflect-y",
                ]
                .iter()
                .enumerate()
                .filter(|(bit, _)| rotation.bits() & (1 << bit) != 0)
                .map(|(bit, name)| (name.to_string(), bit as u64))
                .collect();
                let prop = state.new_property("rotation", PropertyKind::Bitmask(entries), immutable);
                let value = if immutable {
                    rotation.bits()
                } else {
                    DrmRotation::ROTATE_0.bits()
                };
                state.attach(plane, prop, value as u64);
            }
            if desc.alpha {
                let prop = state.new_property("alpha", PropertyKind::Range { min: 0, max: 0xffff }, false);
                state.attach(plane, prop, 0xffff);
            }
            if desc.blend_modes {
                let prop = state.new_property(
                    "pixel blend mode",
                    PropertyKind::Enum(vec![
                        ("None".into(), 0),
                        ("Pre-multiplied".into(), 1),
                        ("Coverage".into(), 2),
                    ]),
                    false,
                );
                state.attach(plane, prop, 1);
            }
            if !desc.modifiers.is_empty() {
                let formats: Vec<u32> = desc.formats.iter().map(|f| *f as u32).collect();
                let mask = (1u64 << formats.len()) - 1;
                let entries: Vec<(u64, u32, u64)> = desc
                    .modifiers
                    .iter()
                    .map(|modifier| (mask, 0, u64::from(*modifier)))
                    .collect();
                state.next_blob += 1;
                let blob = state.next_blob;
                state.blobs.insert(blob, formats::build_in_formats(&formats, &entries));
                let prop = state.new_property("IN_FORMATS", PropertyKind::Blob, true);
                state.attach(plane, prop, blob);
            }
        }
        self
    }

    /// Adds a property unknown to the property tables to every plane
    pub(crate) fn with_extra_plane_property(self, name: &str, value: u64) -> Self {
        {
            let mut state = self.state();
            let planes: Vec<plane::Handle> = state.planes.iter().map(|(plane, _)| plane.handle).collect();
            for plane in planes {
                let prop = state.new_property(name, PropertyKind::Unknown, false);
                state.attach(plane, prop, value);
            }
        }
        self
    }

    pub(crate) fn connector_handle(&self, index: usize) -> connector::Handle {
        self.state().connectors[index].handle
    }

    pub(crate) fn encoder_handle(&self, index: usize) -> encoder::Handle {
        self.state().encoders[index].handle
    }

    pub(crate) fn crtc_handle(&self, index: usize) -> crtc::Handle {
        self.state().crtcs[index].handle
    }

    pub(crate) fn plane_handle(&self, index: usize) -> plane::Handle {
        self.state().planes[index].0.handle
    }

    pub(crate) fn plane_handles(&self) -> Vec<plane::Handle> {
        self.state().planes.iter().map(|(plane, _)| plane.handle).collect()
    }

    /// Id of a property shared by all objects, e.g. `FB_ID`
    pub(crate) fn prop(&self, name: &str) -> property::Handle {
        self.state().global_props[name]
    }

    /// Id of a per-plane property, e.g. `zpos`
    pub(crate) fn plane_prop(&self, plane: plane::Handle, name: &str) -> property::Handle {
        let state = self.state();
        state.values[&RawResourceHandle::from(plane)]
            .iter()
            .map(|(prop, _)| *prop)
            .find(|prop| state.infos[prop].name == name)
            .unwrap()
    }

    /// Current value of a property of an object
    pub(crate) fn value(&self, object: impl Into<RawResourceHandle>, prop: property::Handle) -> Option<u64> {
        self.state()
            .values
            .get(&object.into())?
            .iter()
            .find(|(handle, _)| *handle == prop)
            .map(|(_, value)| *value)
    }

    pub(crate) fn set_connected(&self, index: usize, connected: bool) {
        let mut state = self.state();
        let conn = &mut state.connectors[index];
        if connected {
            conn.state = connector::State::Connected;
            conn.modes = vec![mode(1920, 1080)];
        } else {
            conn.state = connector::State::Disconnected;
            conn.modes.clear();
        }
    }

    pub(crate) fn framebuffers(&self) -> Vec<FramebufferDesc> {
        self.state().framebuffers.clone()
    }

    pub(crate) fn dumb_buffers(&self) -> usize {
        self.state().dumb_buffers
    }

    pub(crate) fn open_gem_handles(&self) -> usize {
        self.state().open_gem_handles
    }

    pub(crate) fn created_mode_blobs(&self) -> usize {
        self.state().created_mode_blobs
    }

    pub(crate) fn commits(&self) -> Vec<(AtomicCommitFlags, AtomicRequest)> {
        self.state().commits.clone()
    }

    pub(crate) fn last_commit(&self) -> Option<(AtomicCommitFlags, AtomicRequest)> {
        self.state().commits.last().cloned()
    }

    pub(crate) fn legacy_calls(&self) -> Vec<LegacyCall> {
        self.state().legacy_calls.clone()
    }

    pub(crate) fn fail_next_commit(&self, code: i32) {
        self.state().fail_commit = Some(code);
    }

    pub(crate) fn fail_next_prime_import(&self, code: i32) {
        self.state().fail_prime_import = Some(code);
    }

    pub(crate) fn fail_plane_queries(&self, code: i32) {
        self.state().fail_plane_queries = Some(code);
    }

    /// Stops generating page-flip events, until [`FakeDevice::flip`] is called
    pub(crate) fn hold_events(&self, hold: bool) {
        self.state().hold_events = hold;
    }

    /// Queues a page-flip event for `crtc`, even while events are held
    pub(crate) fn flip(&self, crtc: crtc::Handle) {
        let mut state = self.state();
        let hold = std::mem::replace(&mut state.hold_events, false);
        state.queue_flip(crtc);
        state.hold_events = hold;
    }
}

impl KmsIo for FakeDevice {
    fn device_path(&self) -> Option<PathBuf> {
        None
    }

    fn set_client_capability(&self, cap: ClientCapability, _enable: bool) -> io::Result<()> {
        match cap {
            ClientCapability::Atomic if !self.state().atomic => Err(errno(libc::EOPNOTSUPP)),
            _ => Ok(()),
        }
    }

    fn driver_capability(&self, cap: DriverCapability) -> io::Result<u64> {
        match cap {
            DriverCapability::MonotonicTimestamp => Ok(1),
            _ => Ok(0),
        }
    }

    fn resource_ids(&self) -> io::Result<ResourceIds> {
        let state = self.state();
        Ok(ResourceIds {
            connectors: state.connectors.iter().map(|c| c.handle).collect(),
            encoders: state.encoders.iter().map(|e| e.handle).collect(),
            crtcs: state.crtcs.iter().map(|c| c.handle).collect(),
            planes: state.planes.iter().map(|(p, _)| p.handle).collect(),
        })
    }

    fn connector(&self, handle: connector::Handle) -> io::Result<RawConnector> {
        self.state()
            .connectors
            .iter()
            .find(|c| c.handle == handle)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn encoder(&self, handle: encoder::Handle) -> io::Result<RawEncoder> {
        let state = self.state();
        let mut encoder = state
            .encoders
            .iter()
            .find(|e| e.handle == handle)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))?;
        encoder.possible_crtcs = state.crtc_mask();
        Ok(encoder)
    }

    fn crtc(&self, handle: crtc::Handle) -> io::Result<RawCrtc> {
        self.state()
            .crtcs
            .iter()
            .find(|c| c.handle == handle)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn plane(&self, handle: plane::Handle) -> io::Result<RawPlane> {
        let state = self.state();
        if let Some(code) = state.fail_plane_queries {
            return Err(errno(code));
        }
        let (plane, mask) = state
            .planes
            .iter()
            .find(|(p, _)| p.handle == handle)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))?;
        Ok(RawPlane {
            possible_crtcs: mask.unwrap_or_else(|| state.crtc_mask()),
            ..plane
        })
    }

    fn object_properties(&self, object: DrmObject) -> io::Result<Vec<(property::Handle, u64)>> {
        Ok(self
            .state()
            .values
            .get(&RawResourceHandle::from(object))
            .cloned()
            .unwrap_or_default())
    }

    fn property_info(&self, handle: property::Handle) -> io::Result<PropertyInfo> {
        self.state()
            .infos
            .get(&handle)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn property_blob(&self, blob: u64) -> io::Result<Vec<u8>> {
        self.state().blobs.get(&blob).cloned().ok_or_else(|| errno(libc::ENOENT))
    }

    fn create_mode_blob(&self, _mode: &Mode) -> io::Result<u64> {
        let mut state = self.state();
        state.next_blob += 1;
        let blob = state.next_blob;
        state.blobs.insert(blob, Vec::new());
        state.created_mode_blobs += 1;
        Ok(blob)
    }

    fn destroy_blob(&self, blob: u64) -> io::Result<()> {
        self.state()
            .blobs
            .remove(&blob)
            .map(|_| ())
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn atomic_commit(&self, flags: AtomicCommitFlags, req: &AtomicRequest) -> io::Result<()> {
        let mut state = self.state();
        if let Some(code) = state.fail_commit.take() {
            return Err(errno(code));
        }
        state.commits.push((flags, req.clone()));
        if flags.contains(AtomicCommitFlags::TEST_ONLY) {
            return Ok(());
        }

        // crtcs a plane is moved away from flip as well
        let mut plane_crtcs: Vec<u64> = Vec::new();
        for (object, prop, value) in req.iter() {
            if state.infos.get(&prop).is_some_and(|info| info.name == "CRTC_ID")
                && state.planes.iter().any(|(plane, _)| RawResourceHandle::from(plane.handle) == object)
            {
                plane_crtcs.push(value);
                if let Some(previous) = state.value(object, prop) {
                    plane_crtcs.push(previous);
                }
            }
        }

        for (object, prop, value) in req.iter() {
            if let Some(entry) = state
                .values
                .get_mut(&object)
                .and_then(|values| values.iter_mut().find(|(handle, _)| *handle == prop))
            {
                entry.1 = value;
            }
        }
        if flags.contains(AtomicCommitFlags::PAGE_FLIP_EVENT) {
            let crtcs: Vec<crtc::Handle> = state
                .crtcs
                .iter()
                .map(|c| c.handle)
                .filter(|crtc| {
                    req.iter().any(|(object, _, _)| object == RawResourceHandle::from(*crtc))
                        || plane_crtcs.contains(&(u32::from(*crtc) as u64))
                })
                .collect();
            for crtc in crtcs {
                state.queue_flip(crtc);
            }
        }
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> io::Result<()> {
        let mut state = self.state();
        if let Some(code) = state.fail_commit.take() {
            return Err(errno(code));
        }
        state.legacy_calls.push(LegacyCall::SetCrtc {
            crtc,
            fb,
            connectors: connectors.to_vec(),
            mode,
        });
        Ok(())
    }

    fn page_flip(&self, crtc: crtc::Handle, fb: framebuffer::Handle) -> io::Result<()> {
        let mut state = self.state();
        if let Some(code) = state.fail_commit.take() {
            return Err(errno(code));
        }
        state.legacy_calls.push(LegacyCall::PageFlip { crtc, fb });
        state.queue_flip(crtc);
        Ok(())
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<framebuffer::Handle> {
        let mut state = self.state();
        let fb: framebuffer::Handle = handle(state.object() + 500);
        state.framebuffers.push(*desc);
        state.fb_handles.push(fb);
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: framebuffer::Handle) -> io::Result<()> {
        let mut state = self.state();
        let index = state
            .fb_handles
            .iter()
            .position(|handle| *handle == fb)
            .ok_or_else(|| errno(libc::ENOENT))?;
        state.fb_handles.remove(index);
        state.framebuffers.remove(index);
        Ok(())
    }

    fn prime_fd_to_handle(&self, _fd: BorrowedFd<'_>) -> io::Result<u32> {
        let mut state = self.state();
        if let Some(code) = state.fail_prime_import.take() {
            return Err(errno(code));
        }
        state.open_gem_handles += 1;
        Ok(state.object() + 2000)
    }

    fn close_gem_handle(&self, _handle: u32) -> io::Result<()> {
        let mut state = self.state();
        state.open_gem_handles = state.open_gem_handles.saturating_sub(1);
        Ok(())
    }

    fn create_dumb(&self, size: (u32, u32), bpp: u32) -> io::Result<DumbAllocation> {
        let mut state = self.state();
        state.dumb_buffers += 1;
        let pitch = size.0 * bpp.div_ceil(8);
        Ok(DumbAllocation {
            handle: state.object() + 3000,
            pitch,
            size: pitch as u64 * size.1 as u64,
        })
    }

    fn map_dumb(&self, _handle: u32) -> io::Result<u64> {
        Ok(0)
    }

    fn mmap(&self, _offset: u64, len: usize) -> io::Result<MemoryMapping> {
        use rustix::mm::{mmap_anonymous, MapFlags, ProtFlags};

        // SAFETY: a fresh private mapping, owned by the returned MemoryMapping
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| errno(libc::ENOMEM))?;
        // SAFETY: see above
        Ok(unsafe { MemoryMapping::from_raw(ptr, len) })
    }

    fn destroy_dumb(&self, _handle: u32) -> io::Result<()> {
        let mut state = self.state();
        state.dumb_buffers = state.dumb_buffers.saturating_sub(1);
        Ok(())
    }

    fn receive_events(&self) -> io::Result<Vec<PageFlip>> {
        Ok(std::mem::take(&mut self.state().events))
    }
}
