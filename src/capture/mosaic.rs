//! The all-screens mosaic composite.

use wayland_client::protocol::wl_shm;

use super::{CaptureError, CaptureResult};
use crate::buffer::ShmBuffer;
use crate::region::Region;

/// A per-output capture with its physical placement in the mosaic.
pub struct PlacedCapture {
    pub result: CaptureResult,
    pub phys_x: i32,
    pub phys_y: i32,
}

/// Blits every capture into one buffer covering the union bounding box.
pub fn composite(captures: Vec<PlacedCapture>) -> Result<CaptureResult, CaptureError> {
    let mut captures = captures;
    match captures.len() {
        0 => return Err(CaptureError::CaptureFailed),
        1 => return Ok(captures.remove(0).result),
        _ => (),
    }

    let mut min_x = i32::MAX;
    let mut min_y = i32::MAX;
    let mut max_x = i32::MIN;
    let mut max_y = i32::MIN;
    for c in &captures {
        min_x = min_x.min(c.phys_x);
        min_y = min_y.min(c.phys_y);
        max_x = max_x.max(c.phys_x + c.result.buffer.width());
        max_y = max_y.max(c.phys_y + c.result.buffer.height());
    }

    let total_w = max_x - min_x;
    let total_h = max_y - min_y;

    let format = captures
        .iter()
        .map(|c| c.result.format)
        .next()
        .unwrap_or(wl_shm::Format::Xrgb8888);

    let mut buffer = ShmBuffer::create(total_w, total_h, total_w * 4, format)?;
    buffer.clear();

    for c in &captures {
        buffer.blit(
            &c.result.buffer,
            c.phys_x - min_x,
            c.phys_y - min_y,
            c.result.y_inverted,
        );
    }

    Ok(CaptureResult {
        buffer,
        region: Region::new(min_x, min_y, total_w, total_h),
        y_inverted: false,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: i32, height: i32, value: u8) -> CaptureResult {
        let mut buffer =
            ShmBuffer::create(width, height, width * 4, wl_shm::Format::Xrgb8888).unwrap();
        buffer.data_mut().fill(value);
        CaptureResult {
            buffer,
            region: Region::new(0, 0, width, height),
            y_inverted: false,
            format: wl_shm::Format::Xrgb8888,
        }
    }

    #[test]
    fn bounding_box_spans_all_outputs() {
        // 1920x1080 @ scale 1 at (0, 0) and 2560x1440 @ scale 2 at
        // (1920, 0): physical placement puts the second at x = 3840 with a
        // 5120x2880 buffer.
        let captures = vec![
            PlacedCapture {
                result: solid(1920, 1080, 0x11),
                phys_x: 0,
                phys_y: 0,
            },
            PlacedCapture {
                result: solid(5120, 2880, 0x22),
                phys_x: 1920,
                phys_y: 0,
            },
        ];

        let out = composite(captures).unwrap();
        assert_eq!(out.buffer.width(), 1920 + 5120);
        assert_eq!(out.buffer.height(), 2880);
        assert_eq!(out.region, Region::new(0, 0, 7040, 2880));

        // First output's pixels at its origin.
        assert_eq!(out.buffer.data()[0], 0x11);
        // Second output's pixels past the seam.
        let seam = 1920usize * 4;
        assert_eq!(out.buffer.data()[seam], 0x22);
        // Below the first output's extent, left column is cleared.
        let below = 1200usize * out.buffer.stride() as usize;
        assert_eq!(out.buffer.data()[below], 0);
    }

    #[test]
    fn negative_origins_are_normalized() {
        let captures = vec![
            PlacedCapture {
                result: solid(10, 10, 0xAA),
                phys_x: -10,
                phys_y: -10,
            },
            PlacedCapture {
                result: solid(10, 10, 0xBB),
                phys_x: 0,
                phys_y: 0,
            },
        ];

        let out = composite(captures).unwrap();
        assert_eq!((out.buffer.width(), out.buffer.height()), (20, 20));
        assert_eq!(out.region, Region::new(-10, -10, 20, 20));
        assert_eq!(out.buffer.data()[0], 0xAA);
    }

    #[test]
    fn single_capture_passes_through() {
        let captures = vec![PlacedCapture {
            result: solid(4, 4, 0x7F),
            phys_x: 100,
            phys_y: 100,
        }];
        let out = composite(captures).unwrap();
        assert_eq!(out.buffer.width(), 4);
    }
}
