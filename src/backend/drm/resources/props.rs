//! Property name tables of connectors, crtcs and planes.
//!
//! Property ids differ between devices, so they are looked up by the exact names the
//! kernel reports. Names missing from these tables are ignored.

use drm::control::property;

macro_rules! property_table {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($field:ident => $prop:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name {
            $(
                #[doc = concat!("Id of the `", $prop, "` property")]
                pub $field: Option<property::Handle>,
            )*
        }

        impl $name {
            /// Names of all properties in this table
            pub const NAMES: &'static [&'static str] = &[$($prop),*];

            /// Stores `handle` if `name` is part of this table.
            ///
            /// Returns `false` for unknown names.
            pub fn assign(&mut self, name: &str, handle: property::Handle) -> bool {
                match name {
                    $($prop => {
                        self.$field = Some(handle);
                        true
                    })*
                    _ => false,
                }
            }
        }
    };
}

property_table! {
    /// Property ids of a connector
    ConnectorProps {
        crtc_id => "CRTC_ID",
        dpms => "DPMS",
        edid => "EDID",
        path => "PATH",
        tile => "TILE",
        link_status => "link-status",
        non_desktop => "non-desktop",
        max_bpc => "max bpc",
        colorspace => "Colorspace",
        content_type => "content type",
        vrr_capable => "vrr_capable",
        hdr_output_metadata => "HDR_OUTPUT_METADATA",
        scaling_mode => "scaling mode",
    }
}

property_table! {
    /// Property ids of a crtc
    CrtcProps {
        active => "ACTIVE",
        mode_id => "MODE_ID",
        out_fence_ptr => "OUT_FENCE_PTR",
        vrr_enabled => "VRR_ENABLED",
        degamma_lut => "DEGAMMA_LUT",
        degamma_lut_size => "DEGAMMA_LUT_SIZE",
        ctm => "CTM",
        gamma_lut => "GAMMA_LUT",
        gamma_lut_size => "GAMMA_LUT_SIZE",
    }
}

property_table! {
    /// Property ids of a plane
    PlaneProps {
        kind => "type",
        src_x => "SRC_X",
        src_y => "SRC_Y",
        src_w => "SRC_W",
        src_h => "SRC_H",
        crtc_x => "CRTC_X",
        crtc_y => "CRTC_Y",
        crtc_w => "CRTC_W",
        crtc_h => "CRTC_H",
        fb_id => "FB_ID",
        in_fence_fd => "IN_FENCE_FD",
        crtc_id => "CRTC_ID",
        in_formats => "IN_FORMATS",
        rotation => "rotation",
        zpos => "zpos",
        alpha => "alpha",
        pixel_blend_mode => "pixel blend mode",
        fb_damage_clips => "FB_DAMAGE_CLIPS",
        color_encoding => "COLOR_ENCODING",
        color_range => "COLOR_RANGE",
        scaling_filter => "SCALING_FILTER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_by_exact_name() {
        let handle: property::Handle = drm::control::from_u32(12).unwrap();
        let mut props = PlaneProps::default();

        assert!(props.assign("pixel blend mode", handle));
        assert_eq!(props.pixel_blend_mode, Some(handle));
        assert!(!props.assign("Pixel Blend Mode", handle));
        assert!(!props.assign("zpos ", handle));
        assert_eq!(props.zpos, None);
    }

    #[test]
    fn tables_are_disjoint_per_kind() {
        for names in [ConnectorProps::NAMES, CrtcProps::NAMES, PlaneProps::NAMES] {
            let mut sorted = names.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), names.len());
        }
    }
}
