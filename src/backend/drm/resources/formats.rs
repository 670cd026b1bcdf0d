//! Parser of the `IN_FORMATS` plane property blob.
//!
//! The blob starts with a header
//!
//! ```text
//! u32 version, u32 flags,
//! u32 count_formats, u32 formats_offset,
//! u32 count_modifiers, u32 modifiers_offset
//! ```
//!
//! followed by an array of fourcc codes and an array of modifier entries
//! `{ u64 formats, u32 offset, u32 pad, u64 modifier }`, where bit `n` of `formats`
//! marks the fourcc at index `offset + n` as supported with `modifier`.

use tracing::warn;

const HEADER_LEN: usize = 24;
const MODIFIER_LEN: usize = 24;

fn read_u32(blob: &[u8], offset: usize) -> Option<u32> {
    let bytes = blob.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_u64(blob: &[u8], offset: usize) -> Option<u64> {
    let bytes = blob.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}

/// Parses an `IN_FORMATS` blob into `(fourcc, modifier)` pairs.
///
/// Returns `None` if the blob is truncated or references entries outside of itself.
pub fn parse_in_formats(blob: &[u8]) -> Option<Vec<(u32, u64)>> {
    if blob.len() < HEADER_LEN {
        return None;
    }
    let count_formats = read_u32(blob, 8)? as usize;
    let formats_offset = read_u32(blob, 12)? as usize;
    let count_modifiers = read_u32(blob, 16)? as usize;
    let modifiers_offset = read_u32(blob, 20)? as usize;

    let formats = (0..count_formats)
        .map(|i| read_u32(blob, formats_offset.checked_add(i.checked_mul(4)?)?))
        .collect::<Option<Vec<u32>>>()?;

    let mut pairs = Vec::new();
    for i in 0..count_modifiers {
        let entry = modifiers_offset.checked_add(i.checked_mul(MODIFIER_LEN)?)?;
        let mask = read_u64(blob, entry)?;
        let offset = read_u32(blob, entry + 8)? as usize;
        let modifier = read_u64(blob, entry + 16)?;

        for bit in 0..64 {
            if mask & (1u64 << bit) == 0 {
                continue;
            }
            match formats.get(offset + bit) {
                Some(fourcc) => pairs.push((*fourcc, modifier)),
                None => {
                    warn!(offset, bit, "IN_FORMATS modifier references a format out of range");
                    return None;
                }
            }
        }
    }
    Some(pairs)
}

#[cfg(test)]
pub(crate) fn build_in_formats(formats: &[u32], modifiers: &[(u64, u32, u64)]) -> Vec<u8> {
    let formats_offset = HEADER_LEN;
    let modifiers_offset = formats_offset + formats.len() * 4;
    let mut blob = Vec::new();
    for value in [
        1u32,
        0,
        formats.len() as u32,
        formats_offset as u32,
        modifiers.len() as u32,
        modifiers_offset as u32,
    ] {
        blob.extend_from_slice(&value.to_ne_bytes());
    }
    for format in formats {
        blob.extend_from_slice(&format.to_ne_bytes());
    }
    for (mask, offset, modifier) in modifiers {
        blob.extend_from_slice(&mask.to_ne_bytes());
        blob.extend_from_slice(&offset.to_ne_bytes());
        blob.extend_from_slice(&0u32.to_ne_bytes());
        blob.extend_from_slice(&modifier.to_ne_bytes());
    }
    blob
}

#[cfg(test)]
mod tests {
    use drm_fourcc::{DrmFourcc, DrmModifier};

    use super::*;

    #[test]
    fn expands_format_masks() {
        let argb = DrmFourcc::Argb8888 as u32;
        let xrgb = DrmFourcc::Xrgb8888 as u32;
        let nv12 = DrmFourcc::Nv12 as u32;
        let linear: u64 = DrmModifier::Linear.into();
        let tiled = 0x0100_0000_0000_0001;

        let blob = build_in_formats(&[argb, xrgb, nv12], &[(0b111, 0, linear), (0b10, 0, tiled)]);
        let pairs = parse_in_formats(&blob).unwrap();
        assert_eq!(
            pairs,
            vec![(argb, linear), (xrgb, linear), (nv12, linear), (xrgb, tiled)]
        );
    }

    #[test]
    fn honors_the_entry_offset() {
        let formats: Vec<u32> = (0..70).collect();
        let blob = build_in_formats(&formats, &[(0b1, 65, 7)]);
        assert_eq!(parse_in_formats(&blob).unwrap(), vec![(65, 7)]);
    }

    #[test]
    fn rejects_malformed_blobs() {
        assert!(parse_in_formats(&[0u8; 10]).is_none());

        let mut blob = build_in_formats(&[1, 2], &[(0b1, 0, 0)]);
        blob.truncate(blob.len() - 4);
        assert!(parse_in_formats(&blob).is_none());

        let blob = build_in_formats(&[1, 2], &[(0b100, 0, 0)]);
        assert!(parse_in_formats(&blob).is_none());
    }
}
