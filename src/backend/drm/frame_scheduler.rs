//! Pacing of frame presentation against scanout.
//!
//! A [`FrameScheduler`] makes sure at most one frame per output is waiting for scanout.
//! Frames presented while another one is in flight are queued, and a newer frame always
//! replaces the queued one, whose cancel callback is invoked instead.
//!
//! ```rust,ignore
//! let scheduler = Arc::new(FrameScheduler::new(FrameSchedulerConfig::default()));
//!
//! // render thread
//! scheduler.present_frame(Box::new(move || commit_frame(req)), Some(Box::new(|| drop_frame())));
//!
//! // event thread, from the scanout callback of the commit
//! scheduler.on_scanout(metadata.time.monotonic());
//! ```
//!
//! All callbacks are invoked without holding the internal lock, so they may call back
//! into the scheduler.

use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info_span, trace, warn};

use crate::utils::{lock, Clock, Monotonic, Time};

/// Callback presenting a frame, expected to issue the commit of the frame
pub type PresentCallback = Box<dyn FnOnce() + Send>;
/// Callback invoked instead of [`PresentCallback`] when a queued frame was replaced
pub type CancelCallback = Box<dyn FnOnce() + Send>;
/// Reply to a vsync request, receives the baton of the request and the predicted start
/// and end of the frame interval to render for
pub type VsyncCallback = Box<dyn FnOnce(VsyncBaton, Time<Monotonic>, Time<Monotonic>) + Send>;

/// Opaque token of a vsync request, handed back unchanged with the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsyncBaton(pub isize);

/// Buffering strategy of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentMode {
    /// One buffer on screen, one being rendered
    #[default]
    DoubleBufferedVsync,
    /// One buffer on screen, one queued and one being rendered
    TripleBufferedVsync,
}

impl PresentMode {
    /// Number of buffers in flight at most
    pub fn buffer_count(&self) -> usize {
        match self {
            PresentMode::DoubleBufferedVsync => 2,
            PresentMode::TripleBufferedVsync => 3,
        }
    }
}

/// Configuration of a [`FrameScheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSchedulerConfig {
    /// Buffering strategy
    pub present_mode: PresentMode,
    /// Whether the renderer asks when to start frames through [`FrameScheduler::on_vsync_request`]
    pub uses_frame_requests: bool,
    /// Refresh rate of the output in mHz
    pub refresh_rate_mhz: u32,
}

impl Default for FrameSchedulerConfig {
    fn default() -> Self {
        FrameSchedulerConfig {
            present_mode: PresentMode::DoubleBufferedVsync,
            uses_frame_requests: true,
            refresh_rate_mhz: 60_000,
        }
    }
}

impl FrameSchedulerConfig {
    /// Duration of one refresh cycle, zero if the refresh rate is unknown
    pub fn refresh_period(&self) -> Duration {
        if self.refresh_rate_mhz == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(1_000_000_000_000 / self.refresh_rate_mhz as u64)
    }
}

/// First vblank after `now`, given the time of the last observed vblank
fn predict_vblank(last: Option<Time<Monotonic>>, now: Time<Monotonic>, period: Duration) -> Time<Monotonic> {
    let period_ns = period.as_nanos() as u64;
    match last {
        Some(last) if period_ns > 0 && last <= now => {
            let elapsed = now.as_nanos() - last.as_nanos();
            let periods = elapsed / period_ns + 1;
            Time::from_nanos(last.as_nanos().saturating_add(periods.saturating_mul(period_ns)))
        }
        Some(last) if last > now => last,
        _ => now,
    }
}

struct QueuedFrame {
    present: PresentCallback,
    cancel: Option<CancelCallback>,
}

#[derive(Default)]
struct SchedulerState {
    waiting_for_scanout: bool,
    queued: Option<QueuedFrame>,
    last_scanout: Option<Time<Monotonic>>,
    parked: Vec<(VsyncBaton, VsyncCallback)>,
    outstanding_buffers: usize,
}

impl fmt::Debug for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerState")
            .field("waiting_for_scanout", &self.waiting_for_scanout)
            .field("queued", &self.queued.is_some())
            .field("last_scanout", &self.last_scanout)
            .field("parked", &self.parked.len())
            .field("outstanding_buffers", &self.outstanding_buffers)
            .finish()
    }
}

/// Presentation state machine of one output
#[derive(Debug)]
pub struct FrameScheduler {
    config: FrameSchedulerConfig,
    state: Mutex<SchedulerState>,
    buffer_released: Condvar,
    clock: Clock<Monotonic>,
    span: tracing::Span,
}

impl FrameScheduler {
    /// Creates an idle scheduler
    pub fn new(config: FrameSchedulerConfig) -> Self {
        FrameScheduler {
            config,
            state: Mutex::new(SchedulerState::default()),
            buffer_released: Condvar::new(),
            clock: Clock::new(),
            span: info_span!("frame_scheduler", mode = ?config.present_mode),
        }
    }

    /// The configuration of this scheduler
    pub fn config(&self) -> &FrameSchedulerConfig {
        &self.config
    }

    /// Whether a frame is waiting for scanout
    pub fn is_presenting(&self) -> bool {
        lock(&self.state).waiting_for_scanout
    }

    /// Whether a frame is queued behind the one waiting for scanout
    pub fn has_queued_frame(&self) -> bool {
        lock(&self.state).queued.is_some()
    }

    /// Time of the last scanout
    pub fn last_scanout(&self) -> Option<Time<Monotonic>> {
        lock(&self.state).last_scanout
    }

    /// Presents a frame.
    ///
    /// If no frame is waiting for scanout `present` is invoked right away. Otherwise the
    /// frame is queued and presented from [`FrameScheduler::on_scanout`]. A frame queued
    /// before is dropped and its `cancel` callback invoked.
    #[profiling::function]
    pub fn present_frame(&self, present: PresentCallback, cancel: Option<CancelCallback>) {
        let _guard = self.span.enter();
        let mut state = lock(&self.state);
        if !state.waiting_for_scanout {
            state.waiting_for_scanout = true;
            drop(state);
            trace!("Presenting frame");
            present();
            return;
        }

        let evicted = state.queued.replace(QueuedFrame { present, cancel });
        drop(state);
        trace!("Frame queued behind the one in flight");
        if let Some(evicted) = evicted {
            debug!("Cancelling superseded frame");
            if let Some(cancel) = evicted.cancel {
                cancel();
            }
        }
    }

    /// Hook for renderers finishing frames asynchronously, presents the frame
    pub fn on_rendering_complete(&self, present: PresentCallback, cancel: Option<CancelCallback>) {
        self.present_frame(present, cancel)
    }

    /// Records that the frame in flight reached the display.
    ///
    /// `timestamp` is the vblank time reported by the kernel, the current time is used if
    /// it is unknown. A queued frame is presented right away.
    #[profiling::function]
    pub fn on_scanout(&self, timestamp: Option<Time<Monotonic>>) {
        let _guard = self.span.enter();
        let now = self.clock.now();
        let mut state = lock(&self.state);
        if !state.waiting_for_scanout {
            warn!("Scanout without a frame in flight");
        }
        let last_scanout = timestamp.unwrap_or(now);
        state.last_scanout = Some(last_scanout);
        let next = state.queued.take();
        state.waiting_for_scanout = next.is_some();
        let parked = std::mem::take(&mut state.parked);
        drop(state);

        if let Some(next) = next {
            trace!("Presenting queued frame");
            (next.present)();
        }
        if !parked.is_empty() {
            let start = predict_vblank(Some(last_scanout), now, self.config.refresh_period());
            let end = start.saturating_add(self.config.refresh_period());
            for (baton, reply) in parked {
                reply(baton, start, end);
            }
        }
    }

    /// Answers when the next frame should be rendered.
    ///
    /// `reply` is invoked exactly once with `baton` and the predicted interval of the next
    /// vblank. With double buffering a request arriving while a frame is in flight is
    /// answered once that frame reached the display.
    pub fn on_vsync_request(&self, baton: VsyncBaton, reply: VsyncCallback) {
        let _guard = self.span.enter();
        if !self.config.uses_frame_requests {
            warn!(?baton, "Vsync request on a scheduler not configured for frame requests");
        }

        let now = self.clock.now();
        let mut state = lock(&self.state);
        if self.config.uses_frame_requests
            && self.config.present_mode == PresentMode::DoubleBufferedVsync
            && state.waiting_for_scanout
        {
            trace!(?baton, "Parking vsync request until scanout");
            state.parked.push((baton, reply));
            return;
        }
        let last_scanout = state.last_scanout;
        drop(state);

        let period = self.config.refresh_period();
        let start = predict_vblank(last_scanout, now, period);
        reply(baton, start, start.saturating_add(period));
    }

    /// Reserves a buffer, blocking while all buffers of the present mode are in use
    pub fn request_fb(&self) {
        let limit = self.config.present_mode.buffer_count();
        let mut state = lock(&self.state);
        while state.outstanding_buffers >= limit {
            state = self
                .buffer_released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.outstanding_buffers += 1;
    }

    /// Reserves a buffer if one is free
    pub fn try_request_fb(&self) -> bool {
        let mut state = lock(&self.state);
        if state.outstanding_buffers >= self.config.present_mode.buffer_count() {
            return false;
        }
        state.outstanding_buffers += 1;
        true
    }

    /// Returns a buffer reserved with [`FrameScheduler::request_fb`]
    pub fn on_fb_released(&self) {
        let mut state = lock(&self.state);
        if state.outstanding_buffers == 0 {
            let _guard = self.span.enter();
            warn!("Buffer released that was never requested");
            return;
        }
        state.outstanding_buffers -= 1;
        drop(state);
        self.buffer_released.notify_one();
    }

    /// Number of buffers currently reserved
    pub fn outstanding_buffers(&self) -> usize {
        lock(&self.state).outstanding_buffers
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let queued = state.queued.take();
        let parked = std::mem::take(&mut state.parked);
        let last_scanout = state.last_scanout;

        if let Some(cancel) = queued.and_then(|frame| frame.cancel) {
            cancel();
        }
        let now = self.clock.now();
        let period = self.config.refresh_period();
        let start = predict_vblank(last_scanout, now, period);
        for (baton, reply) in parked {
            reply(baton, start, start.saturating_add(period));
        }
    }
}
