//! Pixel painting for the selector overlay and its cursor.
//!
//! All drawing happens CPU-side into the render slot about to be committed.
//! Byte order does not matter here: dimming scales the three color bytes
//! and leaves byte 3 (alpha or padding) alone, and the chrome is white.

use crate::buffer::ShmBuffer;

/// Numerator of the dim factor applied outside the selection, over 256.
const DIM_FACTOR: u32 = 140;

/// Darkens everything outside `selection` (buffer coordinates) and draws a
/// 1-px border around it. With no selection the whole buffer is dimmed.
pub fn draw_overlay(buf: &mut ShmBuffer, selection: Option<(i32, i32, i32, i32)>) {
    let width = buf.width();
    let height = buf.height();
    let stride = buf.stride() as usize;
    let data = buf.data_mut();

    let (sx, sy, sw, sh) = match selection {
        Some(rect) => rect,
        None => (0, 0, 0, 0),
    };
    let sel_right = sx + sw;
    let sel_bottom = sy + sh;

    for y in 0..height {
        let row = &mut data[y as usize * stride..][..width as usize * 4];
        let inside_rows = y >= sy && y < sel_bottom;
        for x in 0..width {
            if inside_rows && x >= sx && x < sel_right {
                continue;
            }
            let px = &mut row[x as usize * 4..][..4];
            px[0] = ((px[0] as u32 * DIM_FACTOR) >> 8) as u8;
            px[1] = ((px[1] as u32 * DIM_FACTOR) >> 8) as u8;
            px[2] = ((px[2] as u32 * DIM_FACTOR) >> 8) as u8;
        }
    }

    if selection.is_some() && sw > 0 && sh > 0 {
        draw_rect_outline(buf, sx - 1, sy - 1, sw + 2, sh + 2);
    }
}

/// Full-span crosshair through `(x, y)` in buffer coordinates.
pub fn draw_crosshair(buf: &mut ShmBuffer, x: i32, y: i32) {
    let width = buf.width();
    let height = buf.height();
    let stride = buf.stride() as usize;
    let data = buf.data_mut();

    if y >= 0 && y < height {
        let row = &mut data[y as usize * stride..][..width as usize * 4];
        row.fill(0xFF);
    }
    if x >= 0 && x < width {
        for row_y in 0..height as usize {
            let px = &mut data[row_y * stride + x as usize * 4..][..4];
            px.fill(0xFF);
        }
    }
}

fn draw_rect_outline(buf: &mut ShmBuffer, x: i32, y: i32, w: i32, h: i32) {
    let width = buf.width();
    let height = buf.height();
    let stride = buf.stride() as usize;
    let data = buf.data_mut();

    let mut set = |px: i32, py: i32| {
        if px >= 0 && px < width && py >= 0 && py < height {
            data[py as usize * stride + px as usize * 4..][..4].fill(0xFF);
        }
    };

    for px in x..x + w {
        set(px, y);
        set(px, y + h - 1);
    }
    for py in y..y + h {
        set(x, py);
        set(x + w - 1, py);
    }
}

/// Size of the pointer cursor bitmap in pixels.
pub const CURSOR_SIZE: i32 = 24;
/// Cursor hotspot, the crosshair center.
pub const CURSOR_HOTSPOT: i32 = CURSOR_SIZE / 2;

/// Paints the 24x24 ARGB crosshair cursor.
pub fn draw_cursor_bitmap(buf: &mut ShmBuffer) {
    let size = CURSOR_SIZE;
    let hotspot = CURSOR_HOTSPOT;
    let data = buf.data_mut();

    for y in 0..size {
        for x in 0..size {
            let off = ((y * size + x) * 4) as usize;
            let on_vertical = x >= hotspot - 1 && x <= hotspot && y >= 2 && y < size - 2;
            let on_horizontal = y >= hotspot - 1 && y <= hotspot && x >= 2 && x < size - 2;
            let value = if on_vertical || on_horizontal { 0xFF } else { 0 };
            data[off..off + 4].fill(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use wayland_client::protocol::wl_shm;

    use super::*;

    fn white(width: i32, height: i32) -> ShmBuffer {
        let mut buf =
            ShmBuffer::create(width, height, width * 4, wl_shm::Format::Argb8888).unwrap();
        buf.data_mut().fill(0xFF);
        buf
    }

    fn pixel(buf: &ShmBuffer, x: i32, y: i32) -> [u8; 4] {
        let i = y as usize * buf.stride() as usize + x as usize * 4;
        buf.data()[i..i + 4].try_into().unwrap()
    }

    #[test]
    fn dims_outside_and_preserves_inside() {
        let mut buf = white(16, 16);
        draw_overlay(&mut buf, Some((4, 4, 8, 8)));

        let dimmed = ((0xFFu32 * DIM_FACTOR) >> 8) as u8;
        assert_eq!(pixel(&buf, 0, 0)[0], dimmed);
        // Alpha byte untouched by dimming.
        assert_eq!(pixel(&buf, 0, 0)[3], 0xFF);
        // Interior kept at full brightness.
        assert_eq!(pixel(&buf, 8, 8), [0xFF; 4]);
        // Border pixel just outside the rect is painted white.
        assert_eq!(pixel(&buf, 3, 3), [0xFF; 4]);
    }

    #[test]
    fn no_selection_dims_everything() {
        let mut buf = white(8, 8);
        draw_overlay(&mut buf, None);
        let dimmed = ((0xFFu32 * DIM_FACTOR) >> 8) as u8;
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(pixel(&buf, x, y)[0], dimmed);
            }
        }
    }

    #[test]
    fn crosshair_spans_the_buffer() {
        let mut buf = ShmBuffer::create(8, 8, 32, wl_shm::Format::Argb8888).unwrap();
        draw_crosshair(&mut buf, 3, 5);
        assert_eq!(pixel(&buf, 0, 5), [0xFF; 4]);
        assert_eq!(pixel(&buf, 7, 5), [0xFF; 4]);
        assert_eq!(pixel(&buf, 3, 0), [0xFF; 4]);
        assert_eq!(pixel(&buf, 0, 0), [0; 4]);
    }

    #[test]
    fn cursor_bitmap_has_centered_cross() {
        let mut buf = ShmBuffer::create(
            CURSOR_SIZE,
            CURSOR_SIZE,
            CURSOR_SIZE * 4,
            wl_shm::Format::Argb8888,
        )
        .unwrap();
        draw_cursor_bitmap(&mut buf);
        assert_eq!(pixel(&buf, CURSOR_HOTSPOT, 5), [0xFF; 4]);
        assert_eq!(pixel(&buf, 5, CURSOR_HOTSPOT), [0xFF; 4]);
        assert_eq!(pixel(&buf, 0, 0), [0; 4]);
        // Line ends stop short of the edges.
        assert_eq!(pixel(&buf, CURSOR_HOTSPOT, 0), [0; 4]);
    }
}
