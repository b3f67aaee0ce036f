//! POSIX shared-memory pixel buffers.
//!
//! Every capture and every overlay frame lives in one of these: an anonymous
//! memfd sized to `stride * height`, mapped read-write for the lifetime of
//! the handle. The fd is shared with the compositor through `wl_shm`; the
//! mapping and the fd are released when the buffer is dropped.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};

use memmap2::MmapMut;
use rustix::fs::{MemfdFlags, SealFlags};
use wayland_client::protocol::wl_shm;

pub mod format;
pub mod transform;

pub use format::{bytes_per_pixel, expanded_format, is_24bit, swap_rb};
pub use transform::{apply_transform, inverse_transform};

/// Errors produced by buffer allocation and pixel operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(#[source] std::io::Error),
    #[error("invalid stride {stride} for width {width} ({format:?})")]
    InvalidStride {
        stride: i32,
        width: i32,
        format: wl_shm::Format,
    },
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(wl_shm::Format),
}

/// A CPU-mapped pixel buffer backed by a sealed memfd.
#[derive(Debug)]
pub struct ShmBuffer {
    file: File,
    map: MmapMut,
    width: i32,
    height: i32,
    stride: i32,
    format: wl_shm::Format,
}

impl ShmBuffer {
    /// Allocates a zeroed buffer of `stride * height` bytes.
    ///
    /// The backing memfd is sealed against growing so the compositor cannot
    /// extend the mapping behind our back.
    pub fn create(
        width: i32,
        height: i32,
        stride: i32,
        format: wl_shm::Format,
    ) -> Result<Self, BufferError> {
        let bpp = bytes_per_pixel(format).ok_or(BufferError::UnsupportedFormat(format))?;
        if width <= 0 || height <= 0 || (stride as i64) < width as i64 * bpp as i64 {
            return Err(BufferError::InvalidStride {
                stride,
                width,
                format,
            });
        }

        let size = stride as u64 * height as u64;

        let fd = rustix::fs::memfd_create(
            "dusk-shm-buffer",
            MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING,
        )
        .map_err(|err| BufferError::AllocationFailed(err.into()))?;
        rustix::fs::ftruncate(&fd, size)
            .map_err(|err| BufferError::AllocationFailed(err.into()))?;
        rustix::fs::fcntl_add_seals(&fd, SealFlags::GROW | SealFlags::SEAL)
            .map_err(|err| BufferError::AllocationFailed(err.into()))?;

        let file = File::from(fd);
        // Safety: the memfd is owned by us and sealed against growing; the
        // compositor only ever maps it for reading or writing pixel data.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(BufferError::AllocationFailed)?;

        Ok(Self {
            file,
            map,
            width,
            height,
            stride,
            format,
        })
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn stride(&self) -> i32 {
        self.stride
    }

    pub fn format(&self) -> wl_shm::Format {
        self.format
    }

    pub fn set_format(&mut self, format: wl_shm::Format) {
        self.format = format;
    }

    /// Total size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// The fd to hand to `wl_shm.create_pool`.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Fills the buffer with transparent black.
    pub fn clear(&mut self) {
        self.map.fill(0);
    }

    /// Copies the pixel contents of `src` into `self`.
    ///
    /// Both buffers must have identical dimensions and stride.
    pub fn copy_from(&mut self, src: &ShmBuffer) {
        debug_assert_eq!(self.size(), src.size());
        let len = self.map.len().min(src.map.len());
        self.map[..len].copy_from_slice(&src.map[..len]);
    }

    /// Expands a packed 24-bit buffer to the matching 32-bit format with
    /// alpha forced to opaque. A buffer that is already 32-bit is returned
    /// unchanged, same handle.
    pub fn convert_to_32bit(self) -> Result<ShmBuffer, BufferError> {
        if !is_24bit(self.format) {
            return Ok(self);
        }

        let dst_format = expanded_format(self.format);
        let mut dst = ShmBuffer::create(self.width, self.height, self.width * 4, dst_format)?;

        let w = self.width as usize;
        for y in 0..self.height as usize {
            let src_row = &self.map[y * self.stride as usize..];
            let dst_row = &mut dst.map[y * dst.stride as usize..];
            for x in 0..w {
                let si = x * 3;
                let di = x * 4;
                dst_row[di] = src_row[si];
                dst_row[di + 1] = src_row[si + 1];
                dst_row[di + 2] = src_row[si + 2];
                dst_row[di + 3] = 0xFF;
            }
        }

        Ok(dst)
    }

    /// Swaps rows in place, turning a y-inverted capture upright.
    pub fn flip_vertical(&mut self) {
        let stride = self.stride as usize;
        let height = self.height as usize;
        let mut scratch = vec![0u8; stride];

        for y in 0..height / 2 {
            let (top, rest) = self.map.split_at_mut((height - 1 - y) * stride);
            let top_row = &mut top[y * stride..y * stride + stride];
            let bottom_row = &mut rest[..stride];
            scratch.copy_from_slice(top_row);
            top_row.copy_from_slice(bottom_row);
            bottom_row.copy_from_slice(&scratch);
        }
    }

    /// Copies a rectangle out of this buffer into a freshly allocated one.
    ///
    /// The rectangle is clamped to the source bounds. Returns `None` when
    /// nothing of it remains visible.
    pub fn crop(&self, x: i32, y: i32, width: i32, height: i32) -> Option<ShmBuffer> {
        let mut x = x;
        let mut y = y;
        let mut w = width;
        let mut h = height;

        if x < 0 {
            w += x;
            x = 0;
        }
        if y < 0 {
            h += y;
            y = 0;
        }
        if x + w > self.width {
            w = self.width - x;
        }
        if y + h > self.height {
            h = self.height - y;
        }
        if w <= 0 || h <= 0 {
            return None;
        }

        let mut dst = ShmBuffer::create(w, h, w * 4, self.format).ok()?;
        let row_bytes = w as usize * 4;
        for dy in 0..h as usize {
            let src_off = (y as usize + dy) * self.stride as usize + x as usize * 4;
            let dst_off = dy * dst.stride as usize;
            dst.map[dst_off..dst_off + row_bytes]
                .copy_from_slice(&self.map[src_off..src_off + row_bytes]);
        }

        Some(dst)
    }

    /// Clipped pixel copy of `src` into `self` at `(dst_x, dst_y)`.
    ///
    /// Honors the source's own y-inversion. Does not convert formats; the
    /// caller must align them first.
    pub fn blit(&mut self, src: &ShmBuffer, dst_x: i32, dst_y: i32, y_inverted: bool) {
        for src_y in 0..src.height {
            let actual_src_y = if y_inverted {
                src.height - 1 - src_y
            } else {
                src_y
            };

            let dy = dst_y + src_y;
            if dy < 0 || dy >= self.height {
                continue;
            }

            let src_row_off = actual_src_y as usize * src.stride as usize;
            let dst_row_off = dy as usize * self.stride as usize;

            // Horizontal clip, then one memcpy per row.
            let mut src_x = 0i32;
            let mut dx = dst_x;
            let mut w = src.width;
            if dx < 0 {
                src_x -= dx;
                w += dx;
                dx = 0;
            }
            if dx + w > self.width {
                w = self.width - dx;
            }
            if w <= 0 {
                continue;
            }

            let bytes = w as usize * 4;
            let si = src_row_off + src_x as usize * 4;
            let di = dst_row_off + dx as usize * 4;
            if si + bytes > src.map.len() || di + bytes > self.map.len() {
                continue;
            }
            self.map[di..di + bytes].copy_from_slice(&src.map[si..si + bytes]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn filled(width: i32, height: i32, format: wl_shm::Format) -> ShmBuffer {
        let bpp = bytes_per_pixel(format).unwrap() as i32;
        let mut buf = ShmBuffer::create(width, height, width * bpp, format).unwrap();
        for (i, b) in buf.data_mut().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        buf
    }

    #[test]
    fn create_rejects_undersized_stride() {
        let err = ShmBuffer::create(100, 10, 100, wl_shm::Format::Xrgb8888).unwrap_err();
        assert!(matches!(err, BufferError::InvalidStride { .. }));
    }

    #[test]
    fn create_zeroes_contents() {
        let buf = ShmBuffer::create(4, 4, 16, wl_shm::Format::Argb8888).unwrap();
        assert_eq!(buf.size(), 64);
        assert!(buf.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn convert_is_identity_for_32bit() {
        let buf = filled(8, 8, wl_shm::Format::Xrgb8888);
        let fd = buf.fd().as_raw_fd();
        let out = buf.convert_to_32bit().unwrap();
        assert_eq!(out.fd().as_raw_fd(), fd, "same handle must be returned");
        assert_eq!(out.format(), wl_shm::Format::Xrgb8888);
    }

    #[test]
    fn convert_expands_24bit_with_opaque_alpha() {
        let mut buf = ShmBuffer::create(2, 1, 6, wl_shm::Format::Bgr888).unwrap();
        buf.data_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        let out = buf.convert_to_32bit().unwrap();
        assert_eq!(out.format(), wl_shm::Format::Xbgr8888);
        assert_eq!(out.data(), &[1, 2, 3, 0xFF, 4, 5, 6, 0xFF]);
    }

    #[test]
    fn flip_vertical_reverses_rows() {
        let mut buf = ShmBuffer::create(1, 3, 4, wl_shm::Format::Argb8888).unwrap();
        buf.data_mut().copy_from_slice(&[
            1, 1, 1, 1, //
            2, 2, 2, 2, //
            3, 3, 3, 3,
        ]);
        buf.flip_vertical();
        assert_eq!(
            buf.data(),
            &[
                3, 3, 3, 3, //
                2, 2, 2, 2, //
                1, 1, 1, 1,
            ]
        );
    }

    #[test]
    fn flip_vertical_twice_is_identity() {
        let mut buf = filled(5, 4, wl_shm::Format::Argb8888);
        let before = buf.data().to_vec();
        buf.flip_vertical();
        buf.flip_vertical();
        assert_eq!(buf.data(), &before[..]);
    }

    #[test]
    fn crop_clamps_to_bounds() {
        let buf = filled(4, 4, wl_shm::Format::Argb8888);
        let cropped = buf.crop(2, 2, 10, 10).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (2, 2));
        assert!(buf.crop(4, 4, 2, 2).is_none());
        assert!(buf.crop(0, 0, 0, 5).is_none());
    }

    #[test]
    fn blit_copies_into_place() {
        let mut dst = ShmBuffer::create(4, 4, 16, wl_shm::Format::Argb8888).unwrap();
        let mut src = ShmBuffer::create(2, 2, 8, wl_shm::Format::Argb8888).unwrap();
        src.data_mut().fill(0xAA);

        dst.blit(&src, 1, 1, false);

        let data = dst.data();
        assert_eq!(data[0], 0); // (0, 0) untouched
        let px = 1 * 16 + 1 * 4;
        assert_eq!(&data[px..px + 4], &[0xAA; 4]);
    }

    #[test]
    fn blit_clips_negative_offsets() {
        let mut dst = ShmBuffer::create(2, 2, 8, wl_shm::Format::Argb8888).unwrap();
        let mut src = ShmBuffer::create(2, 2, 8, wl_shm::Format::Argb8888).unwrap();
        src.data_mut().fill(0x55);

        dst.blit(&src, -1, -1, false);

        // Only src (1, 1) lands on dst (0, 0).
        assert_eq!(&dst.data()[..4], &[0x55; 4]);
        assert_eq!(&dst.data()[4..8], &[0; 4]);
    }

    #[test]
    fn blit_honors_y_inversion() {
        let mut dst = ShmBuffer::create(1, 2, 4, wl_shm::Format::Argb8888).unwrap();
        let mut src = ShmBuffer::create(1, 2, 4, wl_shm::Format::Argb8888).unwrap();
        src.data_mut()[..4].copy_from_slice(&[1, 1, 1, 1]);
        src.data_mut()[4..].copy_from_slice(&[2, 2, 2, 2]);

        dst.blit(&src, 0, 0, true);

        assert_eq!(&dst.data()[..4], &[2, 2, 2, 2]);
        assert_eq!(&dst.data()[4..], &[1, 1, 1, 1]);
    }
}
