use std::os::unix::io::BorrowedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use calloop::generic::Generic;
use calloop::{EventSource, Interest, Poll, PostAction, Readiness, Token, TokenFactory};
use drm::control::{connector, crtc, framebuffer, AtomicCommitFlags, Mode};
use drm::{ClientCapability, DriverCapability};
use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, info, info_span, instrument, trace, warn};

pub(super) mod dumb;
pub(super) mod fd;
pub mod io;
pub mod pageflip;

use self::io::{AtomicRequest, FramebufferDesc, KmsIo, PageFlip};
use self::pageflip::{CompletedFlip, PageflipTable, PendingFlip, ReleaseCallback};
use super::error::{AccessError, Error};
use super::resources::DrmResources;
use crate::utils::{lock, Clock, Monotonic, Time};

pub use self::dumb::DumbFramebuffer;
pub use self::fd::DrmDeviceFd;

/// Configuration of a [`DrmDevice`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrmDeviceConfig {
    /// Disable all connectors, crtcs and planes when opening the device.
    ///
    /// Leaving this `false` keeps whatever the previous user of the device left on screen,
    /// which avoids flicker, but unused outputs continue to show stale content.
    pub disable_connectors: bool,
}

/// Registration record of a framebuffer created through a [`DrmDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    /// Handle of the framebuffer
    pub handle: framebuffer::Handle,
    /// Width and height in pixels
    pub size: (u32, u32),
    /// Pixel format
    pub format: DrmFourcc,
    /// Layout modifier, if one was given
    pub modifier: Option<DrmModifier>,
}

/// Either a realtime or monotonic timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmEventTime {
    /// Monotonic time stamp
    Monotonic(Time<Monotonic>),
    /// Realtime time stamp
    Realtime(SystemTime),
}

impl DrmEventTime {
    /// Returns the timestamp if it was taken from the monotonic clock
    pub fn monotonic(&self) -> Option<Time<Monotonic>> {
        match self {
            DrmEventTime::Monotonic(time) => Some(*time),
            DrmEventTime::Realtime(_) => None,
        }
    }
}

/// Timing metadata for page-flip events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMetadata {
    /// The time the frame flip happend
    pub time: DrmEventTime,
    /// The sequence number of the frame
    pub sequence: u32,
}

/// Events that can be generated by a [`DrmDeviceNotifier`]
#[derive(Debug)]
pub enum DrmEvent {
    /// A vblank blank event on the provided crtc has happened
    VBlank(crtc::Handle),
    /// An error happened while processing events
    Error(Error),
}

/// An open drm device
///
/// Owns the kernel interface of the device, keeps records of all framebuffers registered
/// through it and routes page-flip events to the commits waiting for them.
#[derive(Debug)]
pub struct DrmDevice {
    io: Arc<dyn KmsIo>,
    fd: Option<DrmDeviceFd>,
    atomic: bool,
    has_universal_planes: bool,
    has_monotonic_timestamps: bool,
    active: AtomicBool,
    framebuffers: Mutex<Vec<FramebufferInfo>>,
    pageflips: Mutex<PageflipTable>,
    span: tracing::Span,
}

fn force_legacy() -> bool {
    std::env::var("KMS_PRESENT_USE_LEGACY")
        .map(|x| {
            x == "1" || x.to_lowercase() == "true" || x.to_lowercase() == "yes" || x.to_lowercase() == "y"
        })
        .unwrap_or(false)
}

impl DrmDevice {
    /// Create a new [`DrmDevice`] from an open drm node
    ///
    /// Returns the device together with a [`DrmDeviceNotifier`], which has to be inserted
    /// into an event loop for asynchronous commits to ever complete.
    pub fn new(fd: DrmDeviceFd, config: DrmDeviceConfig) -> Result<(Arc<DrmDevice>, DrmDeviceNotifier), Error> {
        let io: Arc<dyn KmsIo> = Arc::new(fd.clone());
        let device = Arc::new(Self::initialize(io, Some(fd.clone()), config)?);
        let notifier = DrmDeviceNotifier {
            device: device.clone(),
            source: Generic::new(fd, Interest::READ, calloop::Mode::Level),
        };
        Ok((device, notifier))
    }

    /// Create a [`DrmDevice`] on top of any [`KmsIo`] implementation.
    ///
    /// Page-flip events have to be dispatched manually through
    /// [`DrmDevice::dispatch_modesetting`].
    pub fn with_io(io: Arc<dyn KmsIo>, config: DrmDeviceConfig) -> Result<Arc<DrmDevice>, Error> {
        Ok(Arc::new(Self::initialize(io, None, config)?))
    }

    fn initialize(io: Arc<dyn KmsIo>, fd: Option<DrmDeviceFd>, config: DrmDeviceConfig) -> Result<Self, Error> {
        let span = info_span!("drm_device", path = ?io.device_path());
        let _guard = span.enter();
        info!("DrmDevice initializing");

        let has_universal_planes = io
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .is_ok();
        if !has_universal_planes {
            warn!("Universal planes are not supported, only overlay planes will be visible");
        }
        let has_monotonic_timestamps = io
            .driver_capability(DriverCapability::MonotonicTimestamp)
            .unwrap_or(0)
            == 1;

        let force_legacy = force_legacy();
        if force_legacy {
            info!("KMS_PRESENT_USE_LEGACY is set. Forcing legacy modesetting.");
        }
        let atomic = !force_legacy && io.set_client_capability(ClientCapability::Atomic, true).is_ok();
        if !atomic {
            info!("Falling back to legacy modesetting");
        }

        drop(_guard);
        let device = DrmDevice {
            io,
            fd,
            atomic,
            has_universal_planes,
            has_monotonic_timestamps,
            active: AtomicBool::new(true),
            framebuffers: Mutex::new(Vec::new()),
            pageflips: Mutex::new(PageflipTable::default()),
            span,
        };

        if config.disable_connectors {
            let resources = DrmResources::new(&device)?;
            device.reset_state(&resources)?;
        }

        Ok(device)
    }

    pub(crate) fn io(&self) -> &dyn KmsIo {
        &*self.io
    }

    pub(crate) fn io_handle(&self) -> Arc<dyn KmsIo> {
        self.io.clone()
    }

    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub(crate) fn access_error(&self, errmsg: &'static str) -> impl FnOnce(std::io::Error) -> Error + '_ {
        move |source| {
            Error::Access(AccessError {
                errmsg,
                dev: self.io.device_path(),
                source,
            })
        }
    }

    /// Returns the underlying file descriptor, if the device was opened from one
    pub fn device_fd(&self) -> Option<&DrmDeviceFd> {
        self.fd.as_ref()
    }

    /// Returns the path of the device node, if known
    pub fn dev_path(&self) -> Option<PathBuf> {
        self.io.device_path()
    }

    /// Returns if the device uses atomic-modesetting or not.
    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// Returns if the driver exposes primary and cursor planes as well
    pub fn has_universal_planes(&self) -> bool {
        self.has_universal_planes
    }

    /// Returns if page-flip timestamps are taken from the monotonic clock
    pub fn has_monotonic_timestamps(&self) -> bool {
        self.has_monotonic_timestamps
    }

    /// Returns if the device currently accepts commits
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Rejects all commits until [`DrmDevice::activate`] is called, e.g. while the session
    /// is switched away.
    pub fn pause(&self) {
        let _guard = self.span.enter();
        info!("Pausing device");
        self.active.store(false, Ordering::SeqCst);
    }

    /// Accepts commits again after [`DrmDevice::pause`]
    pub fn activate(&self) {
        let _guard = self.span.enter();
        info!("Activating device");
        self.active.store(true, Ordering::SeqCst);
    }

    fn ensure_active(&self) -> Result<(), Error> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::DeviceInactive)
        }
    }

    /// Disables every connector, crtc and plane of the device
    pub fn reset_state(&self, resources: &DrmResources) -> Result<(), Error> {
        let _guard = self.span.enter();
        debug!("Resetting drm device to known state");
        self.ensure_active()?;

        if !self.atomic {
            for crtc in resources.crtcs() {
                self.io
                    .set_crtc(crtc.handle(), None, &[], None)
                    .map_err(self.access_error("Error disabling crtc"))?;
            }
            return Ok(());
        }

        let mut req = AtomicRequest::new();
        for conn in resources.connectors() {
            if let Some(prop) = conn.props().crtc_id {
                req.add_property(conn.handle(), prop, 0);
            }
        }
        for plane in resources.planes() {
            let props = plane.props();
            if let (Some(crtc_id), Some(fb_id)) = (props.crtc_id, props.fb_id) {
                req.add_property(plane.handle(), crtc_id, 0);
                req.add_property(plane.handle(), fb_id, 0);
            }
        }
        for crtc in resources.crtcs() {
            let props = crtc.props();
            if let Some(active) = props.active {
                req.add_property(crtc.handle(), active, 0);
            }
            if let Some(mode_id) = props.mode_id {
                req.add_property(crtc.handle(), mode_id, 0);
            }
        }

        self.io
            .atomic_commit(AtomicCommitFlags::ALLOW_MODESET, &req)
            .map_err(self.access_error("Failed to disable connectors"))
    }

    fn record_framebuffer(&self, info: FramebufferInfo) {
        trace!(fb = ?info.handle, format = ?info.format, modifier = ?info.modifier, "Added framebuffer");
        lock(&self.framebuffers).push(info);
    }

    /// Registers a single-planar buffer, referenced by its GEM handle, as framebuffer
    pub fn add_fb(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
        modifier: Option<DrmModifier>,
        handle: u32,
        pitch: u32,
        offset: u32,
    ) -> Result<framebuffer::Handle, Error> {
        self.add_fb_multiplanar(
            size,
            format,
            modifier,
            [handle, 0, 0, 0],
            [pitch, 0, 0, 0],
            [offset, 0, 0, 0],
        )
    }

    /// Registers a buffer with up to four planes, referenced by GEM handles, as framebuffer
    #[profiling::function]
    pub fn add_fb_multiplanar(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
        modifier: Option<DrmModifier>,
        handles: [u32; 4],
        pitches: [u32; 4],
        offsets: [u32; 4],
    ) -> Result<framebuffer::Handle, Error> {
        let _guard = self.span.enter();
        let desc = FramebufferDesc {
            size,
            format,
            modifier,
            handles,
            pitches,
            offsets,
        };
        let handle = self
            .io
            .add_framebuffer(&desc)
            .map_err(self.access_error("Failed to add framebuffer"))?;
        self.record_framebuffer(FramebufferInfo {
            handle,
            size,
            format,
            modifier,
        });
        Ok(handle)
    }

    /// Imports a single-planar dma-buf and registers it as framebuffer
    pub fn add_fb_from_dmabuf(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
        modifier: Option<DrmModifier>,
        fd: BorrowedFd<'_>,
        pitch: u32,
        offset: u32,
    ) -> Result<framebuffer::Handle, Error> {
        self.add_fb_from_dmabuf_multiplanar(
            size,
            format,
            modifier,
            [Some(fd), None, None, None],
            [pitch, 0, 0, 0],
            [offset, 0, 0, 0],
        )
    }

    /// Imports a dma-buf with up to four planes and registers it as framebuffer.
    ///
    /// The GEM handles of the import are closed again afterwards, the framebuffer keeps
    /// the underlying buffer alive.
    #[profiling::function]
    pub fn add_fb_from_dmabuf_multiplanar(
        &self,
        size: (u32, u32),
        format: DrmFourcc,
        modifier: Option<DrmModifier>,
        fds: [Option<BorrowedFd<'_>>; 4],
        pitches: [u32; 4],
        offsets: [u32; 4],
    ) -> Result<framebuffer::Handle, Error> {
        let mut handles = [0u32; 4];
        let mut imported = Vec::with_capacity(4);
        let mut result = Ok(());
        for (i, fd) in fds.iter().enumerate() {
            let Some(fd) = fd else {
                continue;
            };
            match self.io.prime_fd_to_handle(*fd) {
                Ok(handle) => {
                    handles[i] = handle;
                    if !imported.contains(&handle) {
                        imported.push(handle);
                    }
                }
                Err(source) => {
                    result = Err(self.access_error("Failed to import dma-buf")(source));
                    break;
                }
            }
        }

        let result =
            result.and_then(|_| self.add_fb_multiplanar(size, format, modifier, handles, pitches, offsets));

        for handle in imported {
            if let Err(err) = self.io.close_gem_handle(handle) {
                warn!(handle, ?err, "Failed to close GEM handle of imported dma-buf");
            }
        }
        result
    }

    /// Registers a gbm buffer object as framebuffer
    #[cfg(feature = "backend_gbm")]
    pub fn add_fb_from_gbm_bo<T: 'static>(
        &self,
        bo: &gbm::BufferObject<T>,
        use_opaque: bool,
    ) -> Result<framebuffer::Handle, Error> {
        let format = bo.format();
        let format = if use_opaque {
            crate::backend::allocator::format::get_opaque(format).unwrap_or(format)
        } else {
            format
        };
        let modifier = match bo.modifier() {
            DrmModifier::Invalid => None,
            modifier => Some(modifier),
        };

        let mut handles = [0u32; 4];
        let mut pitches = [0u32; 4];
        let mut offsets = [0u32; 4];
        for i in 0..(bo.plane_count() as usize).min(4) {
            // SAFETY: every variant of the handle union is a plain integer
            handles[i] = unsafe { bo.handle_for_plane(i as i32).u32_ };
            pitches[i] = bo.stride_for_plane(i as i32);
            offsets[i] = bo.offset(i as i32);
        }

        self.add_fb_multiplanar((bo.width(), bo.height()), format, modifier, handles, pitches, offsets)
    }

    /// Removes a framebuffer.
    ///
    /// The framebuffer must not be used by any plane anymore.
    pub fn rm_fb(&self, fb: framebuffer::Handle) -> Result<(), Error> {
        let _guard = self.span.enter();
        lock(&self.framebuffers).retain(|info| info.handle != fb);
        trace!(?fb, "Removing framebuffer");
        self.io
            .remove_framebuffer(fb)
            .map_err(self.access_error("Failed to remove framebuffer"))
    }

    /// Returns the recorded metadata of a framebuffer created through this device
    pub fn framebuffer_info(&self, fb: framebuffer::Handle) -> Option<FramebufferInfo> {
        lock(&self.framebuffers).iter().find(|info| info.handle == fb).copied()
    }

    /// Commits an atomic request and waits for it to be applied.
    ///
    /// Returns the time the commit completed.
    #[instrument(level = "debug", parent = &self.span, skip(self, req), fields(props = req.len()))]
    pub fn commit_atomic_sync(&self, req: &AtomicRequest, allow_modeset: bool) -> Result<Time<Monotonic>, Error> {
        self.ensure_active()?;
        let flags = if allow_modeset {
            AtomicCommitFlags::ALLOW_MODESET
        } else {
            AtomicCommitFlags::empty()
        };
        self.io
            .atomic_commit(flags, req)
            .map_err(self.access_error("Error committing atomic request"))?;
        Ok(Clock::<Monotonic>::new().now())
    }

    /// Submits an atomic request for `crtc` without waiting for it.
    ///
    /// The callbacks of `flip` are invoked from [`DrmDevice::dispatch_modesetting`] once the
    /// page-flip event of the commit arrives. On error they are dropped without being called.
    #[instrument(level = "debug", parent = &self.span, skip(self, req, flip), fields(props = req.len()))]
    pub fn commit_atomic_async(
        &self,
        req: &AtomicRequest,
        allow_modeset: bool,
        crtc: crtc::Handle,
        flip: PendingFlip,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        let mut flags = AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT;
        if allow_modeset {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }

        // registered first, the event may be dispatched on another thread before the ioctl returns
        lock(&self.pageflips)
            .register(crtc, flip)
            .map_err(|_| Error::PageflipQueueFull(crtc))?;

        if let Err(source) = self.io.atomic_commit(flags, req) {
            let _ = lock(&self.pageflips).unregister_last(crtc);
            return Err(self.access_error("Error committing atomic request")(source));
        }
        Ok(())
    }

    /// Checks an atomic request with the kernel without applying it
    #[instrument(level = "trace", parent = &self.span, skip(self, req), fields(props = req.len()))]
    pub fn test_atomic(&self, req: &AtomicRequest, allow_modeset: bool) -> Result<(), Error> {
        self.ensure_active()?;
        let mut flags = AtomicCommitFlags::TEST_ONLY;
        if allow_modeset {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }
        self.io
            .atomic_commit(flags, req)
            .map_err(self.access_error("Error testing atomic request"))
    }

    /// Programs `crtc` through the legacy api and waits for it to be applied
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn commit_legacy_sync(
        &self,
        crtc: crtc::Handle,
        fb: Option<framebuffer::Handle>,
        connectors: &[connector::Handle],
        mode: Option<Mode>,
    ) -> Result<Time<Monotonic>, Error> {
        self.ensure_active()?;
        self.io
            .set_crtc(crtc, fb, connectors, mode)
            .map_err(self.access_error("Error setting crtc"))?;
        Ok(Clock::<Monotonic>::new().now())
    }

    /// Queues a legacy page flip of `crtc` to `fb`
    #[instrument(level = "debug", parent = &self.span, skip(self, flip))]
    pub fn commit_legacy_async(
        &self,
        crtc: crtc::Handle,
        fb: framebuffer::Handle,
        flip: PendingFlip,
    ) -> Result<(), Error> {
        self.ensure_active()?;
        lock(&self.pageflips)
            .register(crtc, flip)
            .map_err(|_| Error::PageflipQueueFull(crtc))?;
        if let Err(source) = self.io.page_flip(crtc, fb) {
            let _ = lock(&self.pageflips).unregister_last(crtc);
            return Err(self.access_error("Failed to queue page flip")(source));
        }
        Ok(())
    }

    /// Records the commit now shown on `crtc` after a blocking commit.
    ///
    /// The release callback of the commit shown before is invoked.
    pub fn set_displayed(&self, crtc: crtc::Handle, on_release: Option<ReleaseCallback>) {
        let released = lock(&self.pageflips).replace_displayed(crtc, on_release);
        if let Some(released) = released {
            released();
        }
    }

    /// Number of asynchronous commits on `crtc` still waiting for their page-flip event
    pub fn pending_flips(&self, crtc: crtc::Handle) -> usize {
        lock(&self.pageflips).pending(crtc)
    }

    /// Forgets all commits recorded for `crtc`, invoking their release callbacks.
    ///
    /// Used after the crtc was disabled, when no page-flip events will arrive anymore.
    pub fn clear_pending(&self, crtc: crtc::Handle) {
        let released = lock(&self.pageflips).clear(crtc);
        for release in released {
            release();
        }
    }

    fn metadata(&self, flip: &PageFlip) -> EventMetadata {
        EventMetadata {
            time: if self.has_monotonic_timestamps {
                DrmEventTime::Monotonic(Time::from(flip.duration))
            } else {
                DrmEventTime::Realtime(SystemTime::UNIX_EPOCH + flip.duration)
            },
            sequence: flip.frame,
        }
    }

    /// Reads all pending page-flip events and completes the commits waiting for them.
    ///
    /// Has to be called whenever the device fd becomes readable. Callbacks are invoked
    /// after the internal bookkeeping is done, so they may issue new commits right away.
    #[profiling::function]
    pub fn dispatch_modesetting(&self) -> Result<Vec<(crtc::Handle, EventMetadata)>, Error> {
        let _guard = self.span.enter();
        let flips = self
            .io
            .receive_events()
            .map_err(self.access_error("Error processing drm events"))?;

        let completed: Vec<(crtc::Handle, EventMetadata, Option<CompletedFlip>)> = {
            let mut table = lock(&self.pageflips);
            flips
                .iter()
                .map(|flip| {
                    trace!(crtc = ?flip.crtc, sequence = flip.frame, "Got a page-flip event");
                    let done = table.complete(flip.crtc);
                    if done.is_none() {
                        warn!(crtc = ?flip.crtc, "Dropping page-flip event without a pending commit");
                    }
                    (flip.crtc, self.metadata(flip), done)
                })
                .collect()
        };

        Ok(completed
            .into_iter()
            .map(|(crtc, metadata, done)| {
                if let Some(done) = done {
                    done.run(&metadata);
                }
                (crtc, metadata)
            })
            .collect())
    }
}

/// Event source of a [`DrmDevice`]
///
/// Dispatches the page-flip events of the device whenever its fd becomes readable and
/// forwards a [`DrmEvent::VBlank`] per completed flip.
#[derive(Debug)]
pub struct DrmDeviceNotifier {
    device: Arc<DrmDevice>,
    source: Generic<DrmDeviceFd>,
}

impl DrmDeviceNotifier {
    /// The device this notifier dispatches events of
    pub fn device(&self) -> &Arc<DrmDevice> {
        &self.device
    }
}

impl EventSource for DrmDeviceNotifier {
    type Event = DrmEvent;
    type Metadata = Option<EventMetadata>;
    type Ret = ();
    type Error = std::io::Error;

    #[profiling::function]
    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> Result<PostAction, Self::Error>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let device = &self.device;
        self.source.process_events(readiness, token, |_, _| {
            match device.dispatch_modesetting() {
                Ok(events) => {
                    for (crtc, metadata) in events {
                        callback(DrmEvent::VBlank(crtc), &mut Some(metadata));
                    }
                }
                Err(err) => callback(DrmEvent::Error(err), &mut None),
            }
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, factory)
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use drm::control::AtomicCommitFlags;
    use drm_fourcc::{DrmFourcc, DrmModifier};

    use super::pageflip::PendingFlip;
    use super::*;
    use crate::backend::drm::testing::{self, FakeDevice};

    fn device(fake: &Arc<FakeDevice>) -> Arc<DrmDevice> {
        DrmDevice::with_io(fake.clone(), DrmDeviceConfig::default()).unwrap()
    }

    #[test]
    fn negotiates_capabilities() {
        testing::init_logging();
        let fake = Arc::new(FakeDevice::single_output());
        let device = device(&fake);
        assert!(device.is_atomic());
        assert!(device.has_universal_planes());
        assert!(device.has_monotonic_timestamps());

        let fake = Arc::new(FakeDevice::single_output().without_atomic());
        assert!(!self::device(&fake).is_atomic());
    }

    #[test]
    fn framebuffers_are_recorded() {
        testing::init_logging();
        let fake = Arc::new(FakeDevice::single_output());
        let device = device(&fake);

        let fb = device
            .add_fb(
                (1920, 1080),
                DrmFourcc::Argb8888,
                Some(DrmModifier::Linear),
                7,
                1920 * 4,
                0,
            )
            .unwrap();
        let info = device.framebuffer_info(fb).unwrap();
        assert_eq!(info.size, (1920, 1080));
        assert_eq!(info.format, DrmFourcc::Argb8888);
        assert_eq!(info.modifier, Some(DrmModifier::Linear));
        assert_eq!(fake.framebuffers().len(), 1);

        device.rm_fb(fb).unwrap();
        assert!(device.framebuffer_info(fb).is_none());
        assert!(fake.framebuffers().is_empty());
    }

    #[test]
    fn dmabuf_import_failure_adds_nothing() {
        testing::init_logging();
        let fake = Arc::new(FakeDevice::single_output());
        fake.fail_next_prime_import(libc::EBADF);
        let device = device(&fake);

        let file = std::fs::File::open("/dev/null").unwrap();
        let err = device
            .add_fb_from_dmabuf(
                (64, 64),
                DrmFourcc::Xrgb8888,
                None,
                std::os::unix::io::AsFd::as_fd(&file),
                256,
                0,
            )
            .unwrap_err();
        assert_eq!(err.errno(), libc::EBADF);
        assert!(fake.framebuffers().is_empty());
    }

    #[test]
    fn dmabuf_import_closes_gem_handles() {
        testing::init_logging();
        let fake = Arc::new(FakeDevice::single_output());
        let device = device(&fake);

        let file = std::fs::File::open("/dev/null").unwrap();
        let fb = device
            .add_fb_from_dmabuf(
                (64, 64),
                DrmFourcc::Xrgb8888,
                None,
                std::os::unix::io::AsFd::as_fd(&file),
                256,
                0,
            )
            .unwrap();
        assert!(device.framebuffer_info(fb).is_some());
        assert_eq!(fake.open_gem_handles(), 0);
    }

    #[test]
    fn async_commit_completes_on_dispatch() {
        testing::init_logging();
        let fake = Arc::new(FakeDevice::single_output());
        let device = device(&fake);
        let crtc = fake.crtc_handle(0);

        let scanouts = Arc::new(AtomicUsize::new(0));
        let counter = scanouts.clone();
        let flip = PendingFlip {
            on_scanout: Some(Box::new(move |metadata| {
                assert_eq!(metadata.sequence, 1);
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            on_release: None,
        };
        let mut req = AtomicRequest::new();
        req.add_property(crtc, fake.prop("ACTIVE"), 1);
        device.commit_atomic_async(&req, false, crtc, flip).unwrap();
        let (flags, _) = fake.last_commit().unwrap();
        assert!(flags.contains(AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT));
        assert_eq!(device.pending_flips(crtc), 1);
        assert_eq!(scanouts.load(Ordering::SeqCst), 0);

        let events = device.dispatch_modesetting().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, crtc);
        assert_eq!(scanouts.load(Ordering::SeqCst), 1);
        assert_eq!(device.pending_flips(crtc), 0);
    }

    #[test]
    fn failed_async_commit_unregisters() {
        testing::init_logging();
        let fake = Arc::new(FakeDevice::single_output());
        let device = device(&fake);
        let crtc = fake.crtc_handle(0);

        fake.fail_next_commit(libc::EINVAL);
        let err = device
            .commit_atomic_async(&AtomicRequest::new(), false, crtc, PendingFlip::default())
            .unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(device.pending_flips(crtc), 0);
    }

    #[test]
    fn third_commit_in_flight_is_rejected() {
        testing::init_logging();
        let fake = Arc::new(FakeDevice::single_output());
        fake.hold_events(true);
        let device = device(&fake);
        let crtc = fake.crtc_handle(0);

        for _ in 0..2 {
            device
                .commit_atomic_async(&AtomicRequest::new(), false, crtc, PendingFlip::default())
                .unwrap();
        }
        let err = device
            .commit_atomic_async(&AtomicRequest::new(), false, crtc, PendingFlip::default())
            .unwrap_err();
        assert!(matches!(err, Error::PageflipQueueFull(_)));
        assert_eq!(err.errno(), libc::EBUSY);
    }

    #[test]
    fn paused_device_rejects_commits() {
        testing::init_logging();
        let fake = Arc::new(FakeDevice::single_output());
        let device = device(&fake);

        device.pause();
        let err = device.commit_atomic_sync(&AtomicRequest::new(), true).unwrap_err();
        assert_eq!(err.errno(), libc::EBUSY);
        assert!(fake.last_commit().is_none());

        device.activate();
        device.commit_atomic_sync(&AtomicRequest::new(), true).unwrap();
        let (flags, _) = fake.last_commit().unwrap();
        assert_eq!(flags, AtomicCommitFlags::ALLOW_MODESET);
    }

    #[test]
    fn disable_connectors_resets_everything() {
        testing::init_logging();
        let fake = Arc::new(FakeDevice::single_output());
        let _device = DrmDevice::with_io(
            fake.clone(),
            DrmDeviceConfig {
                disable_connectors: true,
            },
        )
        .unwrap();

        let (flags, req) = fake.last_commit().unwrap();
        assert!(flags.contains(AtomicCommitFlags::ALLOW_MODESET));
        let crtc = fake.crtc_handle(0);
        assert_eq!(req.get(crtc, fake.prop("ACTIVE")), Some(0));
        assert_eq!(req.get(crtc, fake.prop("MODE_ID")), Some(0));
        for plane in fake.plane_handles() {
            assert_eq!(req.get(plane, fake.prop("FB_ID")), Some(0));
        }
    }
}
