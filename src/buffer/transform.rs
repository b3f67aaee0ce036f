//! Output transform compensation.
//!
//! wlr-screencopy hands back the framebuffer as scanned out, so a capture of
//! a rotated output arrives rotated. Applying the inverse of the output's
//! transform recovers the upright image.

use wayland_client::protocol::wl_output::Transform;

use super::{BufferError, ShmBuffer};

/// The transform that undoes `transform`.
///
/// 90 and 270 are each other's inverse; every other transform, including all
/// flipped variants, is an involution.
pub fn inverse_transform(transform: Transform) -> Transform {
    match transform {
        Transform::_90 => Transform::_270,
        Transform::_270 => Transform::_90,
        other => other,
    }
}

/// Applies `transform` to the buffer, producing a correctly dimensioned
/// result. The identity transform returns the input unchanged, same handle.
pub fn apply_transform(buf: ShmBuffer, transform: Transform) -> Result<ShmBuffer, BufferError> {
    if matches!(transform, Transform::Normal) {
        return Ok(buf);
    }

    let (sw, sh) = (buf.width(), buf.height());
    let (dw, dh) = match transform {
        Transform::_90 | Transform::_270 | Transform::Flipped90 | Transform::Flipped270 => (sh, sw),
        _ => (sw, sh),
    };

    let mut dst = ShmBuffer::create(dw, dh, dw * 4, buf.format())?;

    let src_stride = buf.stride() as usize;
    let dst_stride = dst.stride() as usize;
    let src_data = buf.data();
    let dst_data = dst.data_mut();

    for dy in 0..dh {
        for dx in 0..dw {
            // Source pixel feeding destination (dx, dy).
            let (sx, sy) = match transform {
                Transform::_90 => (dy, sh - 1 - dx),
                Transform::_180 => (sw - 1 - dx, sh - 1 - dy),
                Transform::_270 => (sw - 1 - dy, dx),
                Transform::Flipped => (sw - 1 - dx, dy),
                Transform::Flipped90 => (sw - 1 - dy, sh - 1 - dx),
                Transform::Flipped180 => (dx, sh - 1 - dy),
                Transform::Flipped270 => (dy, dx),
                _ => unreachable!("identity handled above"),
            };

            let si = sy as usize * src_stride + sx as usize * 4;
            let di = dy as usize * dst_stride + dx as usize * 4;
            dst_data[di..di + 4].copy_from_slice(&src_data[si..si + 4]);
        }
    }

    Ok(dst)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use wayland_client::protocol::wl_shm;

    use super::*;

    const ALL_TRANSFORMS: [Transform; 8] = [
        Transform::Normal,
        Transform::_90,
        Transform::_180,
        Transform::_270,
        Transform::Flipped,
        Transform::Flipped90,
        Transform::Flipped180,
        Transform::Flipped270,
    ];

    fn gradient(width: i32, height: i32) -> ShmBuffer {
        let mut buf =
            ShmBuffer::create(width, height, width * 4, wl_shm::Format::Argb8888).unwrap();
        let data = buf.data_mut();
        for y in 0..height {
            for x in 0..width {
                let i = (y * width + x) as usize * 4;
                data[i] = x as u8;
                data[i + 1] = y as u8;
                data[i + 2] = 0x33;
                data[i + 3] = 0xFF;
            }
        }
        buf
    }

    fn pixel(buf: &ShmBuffer, x: i32, y: i32) -> [u8; 4] {
        let i = y as usize * buf.stride() as usize + x as usize * 4;
        buf.data()[i..i + 4].try_into().unwrap()
    }

    #[test]
    fn identity_returns_same_handle() {
        let buf = gradient(6, 4);
        let fd = buf.fd().as_raw_fd();
        let out = apply_transform(buf, Transform::Normal).unwrap();
        assert_eq!(out.fd().as_raw_fd(), fd);
    }

    #[test]
    fn rotate_90_moves_corners() {
        let buf = gradient(4, 2);
        let out = apply_transform(buf, Transform::_90).unwrap();
        assert_eq!((out.width(), out.height()), (2, 4));
        // Source (0, 0) lands on the top-right corner under a clockwise turn.
        assert_eq!(pixel(&out, 1, 0), [0, 0, 0x33, 0xFF]);
        // Source (3, 0) lands on the bottom-right corner.
        assert_eq!(pixel(&out, 1, 3), [3, 0, 0x33, 0xFF]);
    }

    #[test]
    fn flipped_mirrors_horizontally() {
        let buf = gradient(4, 2);
        let out = apply_transform(buf, Transform::Flipped).unwrap();
        assert_eq!(pixel(&out, 0, 0), [3, 0, 0x33, 0xFF]);
        assert_eq!(pixel(&out, 3, 1), [0, 1, 0x33, 0xFF]);
    }

    #[test]
    fn inverse_table() {
        assert_eq!(inverse_transform(Transform::_90), Transform::_270);
        assert_eq!(inverse_transform(Transform::_270), Transform::_90);
        for t in [
            Transform::Normal,
            Transform::_180,
            Transform::Flipped,
            Transform::Flipped90,
            Transform::Flipped180,
            Transform::Flipped270,
        ] {
            assert_eq!(inverse_transform(t), t);
        }
    }

    #[test]
    fn round_trip_restores_pixels() {
        for t in ALL_TRANSFORMS {
            let buf = gradient(7, 5);
            let reference = buf.data().to_vec();
            let transformed = apply_transform(buf, t).unwrap();
            let back = apply_transform(transformed, inverse_transform(t)).unwrap();
            assert_eq!((back.width(), back.height()), (7, 5), "transform {t:?}");
            assert_eq!(back.data(), &reference[..], "transform {t:?}");
        }
    }

    #[test]
    fn rotations_swap_dimensions() {
        for t in [
            Transform::_90,
            Transform::_270,
            Transform::Flipped90,
            Transform::Flipped270,
        ] {
            let out = apply_transform(gradient(6, 3), t).unwrap();
            assert_eq!((out.width(), out.height()), (3, 6), "transform {t:?}");
        }
    }
}
