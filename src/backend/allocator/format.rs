//! Format info tables for scanout formats.
//!
//! [`get_opaque`] returns the opaque alternative of a DRM format with an alpha channel.
//! Some display controllers refuse a bottom-most plane with an alpha channel, so the
//! plane allocator retries the primary plane with this variant.
//!
//! ```
//! # use kms_present::backend::allocator::Fourcc;
//! # use kms_present::backend::allocator::format::get_opaque;
//! assert_eq!(Some(Fourcc::Xrgb8888), get_opaque(Fourcc::Argb8888));
//! ```
//!
//! [`get_transparent`] is the inverse, used when a primary plane only lists the alpha
//! variant of an opaque bottom layer.
//!
//! [`has_alpha`], [`get_bpp`] and [`get_depth`] describe the pixel layout, the latter two
//! are needed to create dumb buffers.

/// Generates the lookup functions of this module from one table.
macro_rules! format_tables {
    (
        $($fourcc: ident {
            $(opaque: $opaque: ident,)?
            alpha: $alpha: expr,
            bpp: $bpp: expr,
            depth: $depth: expr $(,)?
        }),* $(,)?
    ) => {
        /// Returns the opaque alternative of the specified format.
        ///
        /// Formats without an alpha channel and unknown formats return [`None`].
        pub const fn get_opaque(fourcc: $crate::backend::allocator::Fourcc) -> Option<$crate::backend::allocator::Fourcc> {
            match fourcc {
                $($(
                    $crate::backend::allocator::Fourcc::$fourcc => Some($crate::backend::allocator::Fourcc::$opaque),
                )?)*
                _ => None,
            }
        }

        /// Returns the variant with an alpha channel of the specified opaque format.
        pub const fn get_transparent(fourcc: $crate::backend::allocator::Fourcc) -> Option<$crate::backend::allocator::Fourcc> {
            match fourcc {
                $($(
                    $crate::backend::allocator::Fourcc::$opaque => Some($crate::backend::allocator::Fourcc::$fourcc),
                )?)*
                _ => None,
            }
        }

        /// Returns true if the format has an alpha channel.
        ///
        /// Unknown formats will always return `false`.
        pub const fn has_alpha(fourcc: $crate::backend::allocator::Fourcc) -> bool {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => $alpha,)*
                _ => false,
            }
        }

        /// Returns the bits per pixel of the specified format.
        pub const fn get_bpp(fourcc: $crate::backend::allocator::Fourcc) -> Option<usize> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        /// Returns the depth (used bits, excluding padding) of the specified format.
        pub const fn get_depth(fourcc: $crate::backend::allocator::Fourcc) -> Option<usize> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some($depth),)*
                _ => None,
            }
        }
    };
}

format_tables! {
    // 16-bit RGB
    Argb4444 { opaque: Xrgb4444, alpha: true, bpp: 16, depth: 16 },
    Xrgb4444 { alpha: false, bpp: 16, depth: 12 },
    Abgr4444 { opaque: Xbgr4444, alpha: true, bpp: 16, depth: 16 },
    Xbgr4444 { alpha: false, bpp: 16, depth: 12 },
    Rgba4444 { opaque: Rgbx4444, alpha: true, bpp: 16, depth: 16 },
    Rgbx4444 { alpha: false, bpp: 16, depth: 12 },
    Bgra4444 { opaque: Bgrx4444, alpha: true, bpp: 16, depth: 16 },
    Bgrx4444 { alpha: false, bpp: 16, depth: 12 },
    Argb1555 { opaque: Xrgb1555, alpha: true, bpp: 16, depth: 16 },
    Xrgb1555 { alpha: false, bpp: 16, depth: 15 },
    Abgr1555 { opaque: Xbgr1555, alpha: true, bpp: 16, depth: 16 },
    Xbgr1555 { alpha: false, bpp: 16, depth: 15 },
    Rgba5551 { opaque: Rgbx5551, alpha: true, bpp: 16, depth: 16 },
    Rgbx5551 { alpha: false, bpp: 16, depth: 15 },
    Bgra5551 { opaque: Bgrx5551, alpha: true, bpp: 16, depth: 16 },
    Bgrx5551 { alpha: false, bpp: 16, depth: 15 },
    Rgb565 { alpha: false, bpp: 16, depth: 16 },
    Bgr565 { alpha: false, bpp: 16, depth: 16 },

    // 24-bit RGB
    Rgb888 { alpha: false, bpp: 24, depth: 24 },
    Bgr888 { alpha: false, bpp: 24, depth: 24 },

    // 32-bit RGB, 8 bits per channel
    Argb8888 { opaque: Xrgb8888, alpha: true, bpp: 32, depth: 32 },
    Xrgb8888 { alpha: false, bpp: 32, depth: 24 },
    Abgr8888 { opaque: Xbgr8888, alpha: true, bpp: 32, depth: 32 },
    Xbgr8888 { alpha: false, bpp: 32, depth: 24 },
    Rgba8888 { opaque: Rgbx8888, alpha: true, bpp: 32, depth: 32 },
    Rgbx8888 { alpha: false, bpp: 32, depth: 24 },
    Bgra8888 { opaque: Bgrx8888, alpha: true, bpp: 32, depth: 32 },
    Bgrx8888 { alpha: false, bpp: 32, depth: 24 },

    // 32-bit RGB, 10 bits per color channel
    Argb2101010 { opaque: Xrgb2101010, alpha: true, bpp: 32, depth: 32 },
    Xrgb2101010 { alpha: false, bpp: 32, depth: 30 },
    Abgr2101010 { opaque: Xbgr2101010, alpha: true, bpp: 32, depth: 32 },
    Xbgr2101010 { alpha: false, bpp: 32, depth: 30 },
    Rgba1010102 { opaque: Rgbx1010102, alpha: true, bpp: 32, depth: 32 },
    Rgbx1010102 { alpha: false, bpp: 32, depth: 30 },
    Bgra1010102 { opaque: Bgrx1010102, alpha: true, bpp: 32, depth: 32 },
    Bgrx1010102 { alpha: false, bpp: 32, depth: 30 },
}
