//! wl_shm pixel format bookkeeping.
//!
//! The capture pipeline normalizes everything to a 32-bit format; these
//! helpers classify what the compositor hands us and tell downstream
//! encoders whether the red and blue channels need swapping.

use wayland_client::protocol::wl_shm::Format;

/// Bytes per pixel for the formats the pipeline understands.
///
/// Returns `None` for formats we do not handle; callers fail the capture
/// explicitly rather than guessing.
pub fn bytes_per_pixel(format: Format) -> Option<usize> {
    match format {
        Format::Argb8888
        | Format::Xrgb8888
        | Format::Abgr8888
        | Format::Xbgr8888
        | Format::Argb2101010
        | Format::Xrgb2101010
        | Format::Abgr2101010
        | Format::Xbgr2101010 => Some(4),
        Format::Rgb888 | Format::Bgr888 => Some(3),
        _ => None,
    }
}

/// Whether the format is packed 24-bit RGB that must be expanded before the
/// rest of the pipeline can touch it.
pub fn is_24bit(format: Format) -> bool {
    matches!(format, Format::Rgb888 | Format::Bgr888)
}

/// The 32-bit format a packed 24-bit buffer expands into.
///
/// Identity for anything that is not 24-bit.
pub fn expanded_format(format: Format) -> Format {
    match format {
        Format::Rgb888 => Format::Xrgb8888,
        Format::Bgr888 => Format::Xbgr8888,
        other => other,
    }
}

/// Whether an encoder reading bytes as R,G,B must swap red and blue.
///
/// The *BGR* layouts store red in byte 0 and need no swap; everything else
/// we emit stores blue first.
pub fn swap_rb(format: Format) -> bool {
    !matches!(
        format,
        Format::Abgr8888 | Format::Xbgr8888 | Format::Abgr2101010 | Format::Xbgr2101010
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_24bit_formats() {
        assert!(is_24bit(Format::Rgb888));
        assert!(is_24bit(Format::Bgr888));
        assert!(!is_24bit(Format::Xrgb8888));
        assert_eq!(bytes_per_pixel(Format::Bgr888), Some(3));
    }

    #[test]
    fn expansion_preserves_channel_order() {
        assert_eq!(expanded_format(Format::Rgb888), Format::Xrgb8888);
        assert_eq!(expanded_format(Format::Bgr888), Format::Xbgr8888);
        assert_eq!(expanded_format(Format::Argb8888), Format::Argb8888);
    }

    #[test]
    fn unknown_formats_are_rejected() {
        assert_eq!(bytes_per_pixel(Format::Rgb565), None);
        assert_eq!(bytes_per_pixel(Format::Yuyv), None);
    }

    #[test]
    fn swap_rb_matches_memory_order() {
        assert!(swap_rb(Format::Argb8888));
        assert!(swap_rb(Format::Xrgb8888));
        assert!(!swap_rb(Format::Abgr8888));
        assert!(!swap_rb(Format::Xbgr8888));
    }
}
