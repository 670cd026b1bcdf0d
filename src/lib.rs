#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like CRTC
#![allow(clippy::upper_case_acronyms)]

//! # kms-present: putting rendered frames on a KMS display
//!
//! This crate implements the presentation half of an embedder that drives a Linux display
//! directly through kernel mode-setting. Rendering backends hand it opaque framebuffers,
//! and it decides which hardware planes show them, assembles the atomic commits and paces
//! the whole pipeline against the display's vertical blank.
//!
//! ## Structure of the crate
//!
//! - [`backend::drm`] contains the core:
//!   - [`DrmResources`](backend::drm::DrmResources), a snapshot of the connectors, encoders,
//!     crtcs and planes of a device together with their committed property values,
//!   - [`DrmDevice`](backend::drm::DrmDevice), the open device node, framebuffer bookkeeping
//!     and page-flip event dispatch,
//!   - [`KmsReqBuilder`](backend::drm::KmsReqBuilder) and [`KmsReq`](backend::drm::KmsReq),
//!     which allocate planes for a list of framebuffer layers and commit them,
//!   - [`FrameScheduler`](backend::drm::FrameScheduler), which keeps at most one frame in
//!     flight per output and answers vsync requests of the renderer.
//! - [`backend::udev`] finds the primary KMS device of a seat and reports hotplug uevents.
//! - [`backend::session`] abstracts how device nodes are opened.
//!
//! ## The event loop
//!
//! Nothing in this crate spawns threads. Asynchronous completion is callback based and
//! driven by [`DrmDevice::dispatch_modesetting`](backend::drm::DrmDevice::dispatch_modesetting),
//! which is usually called from a [`calloop`] event source
//! ([`DrmDeviceNotifier`](backend::drm::DrmDeviceNotifier)) whenever the device fd becomes readable.
//!
//! ### Logging
//!
//! The crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time,
//! for example:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod utils;

pub mod reexports;
