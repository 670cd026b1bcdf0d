//! Pixel formats of scanout buffers.
//!
//! Framebuffers are described by a [`Fourcc`] code and an optional [`Modifier`]
//! (tiling/compression layout). The [`format`] module contains lookup tables to
//! reason about alpha channels and pixel sizes.

pub mod format;

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, UnrecognizedFourcc,
};
