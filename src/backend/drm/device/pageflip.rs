//! Per-crtc bookkeeping of commits waiting for their page-flip event.
//!
//! Every crtc owns a ring of two slots. A commit registers itself in the next free slot,
//! the page-flip event completes the slot at the ring's read index and advances it.
//! This allows a new commit to be queued while the previous one is still in flight,
//! without overwriting its callbacks.
//!
//! A blocking commit reaches the display without an event. It supersedes the commits
//! still in flight on its crtc: their events only release their own framebuffers and
//! never replace the blocking commit as the displayed one.

use std::{collections::HashMap, fmt};

use drm::control::crtc;

use super::EventMetadata;

/// Callback invoked once the framebuffers of a commit are being scanned out
pub type ScanoutCallback = Box<dyn FnOnce(&EventMetadata) + Send>;
/// Callback invoked once the framebuffers of a commit are no longer shown
pub type ReleaseCallback = Box<dyn FnOnce() + Send>;

/// Callbacks of one in-flight commit
#[derive(Default)]
pub struct PendingFlip {
    /// Invoked when the commit reaches the display
    pub on_scanout: Option<ScanoutCallback>,
    /// Invoked when a later commit replaced this one on the display
    pub on_release: Option<ReleaseCallback>,
}

impl fmt::Debug for PendingFlip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingFlip")
            .field("on_scanout", &self.on_scanout.is_some())
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}

/// Work left to do after a page-flip event was recorded, run outside of any lock
#[must_use]
pub struct CompletedFlip {
    pub(crate) on_scanout: Option<ScanoutCallback>,
    pub(crate) released: Option<ReleaseCallback>,
}

impl CompletedFlip {
    /// Invokes the scanout callback of the completed commit, then the release
    /// callback of the commit it replaced.
    pub fn run(self, metadata: &EventMetadata) {
        if let Some(on_scanout) = self.on_scanout {
            on_scanout(metadata);
        }
        if let Some(released) = self.released {
            released();
        }
    }
}

impl fmt::Debug for CompletedFlip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedFlip")
            .field("on_scanout", &self.on_scanout.is_some())
            .field("released", &self.released.is_some())
            .finish()
    }
}

struct Slot {
    flip: PendingFlip,
    superseded: bool,
}

#[derive(Default)]
struct CrtcFlips {
    slots: [Option<Slot>; 2],
    index: usize,
    displayed: Option<ReleaseCallback>,
}

impl CrtcFlips {
    fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Table of pending page flips of all crtcs of a device
#[derive(Default)]
pub struct PageflipTable {
    crtcs: HashMap<crtc::Handle, CrtcFlips>,
}

impl fmt::Debug for PageflipTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.crtcs.iter().map(|(crtc, flips)| (crtc, flips.occupied())))
            .finish()
    }
}

impl PageflipTable {
    /// Registers the callbacks of a commit that is about to be submitted.
    ///
    /// Returns the callbacks back if two commits are already in flight on this crtc.
    pub fn register(&mut self, crtc: crtc::Handle, flip: PendingFlip) -> Result<(), PendingFlip> {
        let flips = self.crtcs.entry(crtc).or_default();
        let occupied = flips.occupied();
        if occupied == 2 {
            return Err(flip);
        }
        let slot = (flips.index + occupied) % 2;
        flips.slots[slot] = Some(Slot {
            flip,
            superseded: false,
        });
        Ok(())
    }

    /// Removes the most recently registered commit again, used when submitting it failed.
    pub fn unregister_last(&mut self, crtc: crtc::Handle) -> Option<PendingFlip> {
        let flips = self.crtcs.get_mut(&crtc)?;
        let occupied = flips.occupied();
        if occupied == 0 {
            return None;
        }
        let slot = (flips.index + occupied - 1) % 2;
        flips.slots[slot].take().map(|slot| slot.flip)
    }

    /// Number of commits waiting for their page-flip event on `crtc`
    pub fn pending(&self, crtc: crtc::Handle) -> usize {
        self.crtcs.get(&crtc).map(CrtcFlips::occupied).unwrap_or(0)
    }

    /// Records the page-flip event of `crtc`.
    ///
    /// The oldest in-flight commit becomes the displayed one, unless a blocking commit
    /// superseded it, in which case it is released right away. Returns `None` for
    /// events nothing was registered for.
    pub fn complete(&mut self, crtc: crtc::Handle) -> Option<CompletedFlip> {
        let flips = self.crtcs.get_mut(&crtc)?;
        let Slot { flip, superseded } = flips.slots[flips.index].take()?;
        flips.index ^= 1;
        let released = if superseded {
            flip.on_release
        } else {
            std::mem::replace(&mut flips.displayed, flip.on_release)
        };
        Some(CompletedFlip {
            on_scanout: flip.on_scanout,
            released,
        })
    }

    /// Makes `on_release` the callback of the displayed commit, used for blocking commits
    /// which reach the display without an event. Commits still in flight are marked as
    /// superseded. Returns the callback of the replaced commit.
    pub fn replace_displayed(
        &mut self,
        crtc: crtc::Handle,
        on_release: Option<ReleaseCallback>,
    ) -> Option<ReleaseCallback> {
        let flips = self.crtcs.entry(crtc).or_default();
        for slot in flips.slots.iter_mut().flatten() {
            slot.superseded = true;
        }
        std::mem::replace(&mut flips.displayed, on_release)
    }

    /// Drops every record of `crtc`, returning all callbacks that still need to run
    pub fn clear(&mut self, crtc: crtc::Handle) -> Vec<ReleaseCallback> {
        let Some(flips) = self.crtcs.remove(&crtc) else {
            return Vec::new();
        };
        let CrtcFlips { slots, displayed, .. } = flips;
        slots
            .into_iter()
            .flatten()
            .filter_map(|slot| slot.flip.on_release)
            .chain(displayed)
            .collect()
    }
}
