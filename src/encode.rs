//! Image encoders for capture results.
//!
//! Captures are 32-bit with either memory order; `swap_rb` (derived from
//! the wl_shm format) tells the encoders whether red and blue must trade
//! places on the way to RGB(A) output.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context as _;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::buffer::{swap_rb, ShmBuffer};
use crate::utils::screenshots_dir;

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Ppm,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Ppm => "ppm",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Ppm => "image/x-portable-pixmap",
        }
    }
}

/// Strips the stride and normalizes channel order to RGBA.
fn to_rgba(buffer: &ShmBuffer) -> Vec<u8> {
    let width = buffer.width() as usize;
    let height = buffer.height() as usize;
    let stride = buffer.stride() as usize;
    let swap = swap_rb(buffer.format());
    let data = buffer.data();

    let mut rgba = Vec::with_capacity(width * height * 4);
    for y in 0..height {
        let row = &data[y * stride..][..width * 4];
        for px in row.chunks_exact(4) {
            if swap {
                rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
            } else {
                rgba.extend_from_slice(&[px[0], px[1], px[2], px[3]]);
            }
        }
    }
    rgba
}

fn to_rgb(buffer: &ShmBuffer) -> Vec<u8> {
    to_rgba(buffer)
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect()
}

/// Encodes the buffer into `writer`.
pub fn encode<W: Write>(
    buffer: &ShmBuffer,
    format: ImageFormat,
    quality: u8,
    mut writer: W,
) -> anyhow::Result<()> {
    let width = buffer.width() as u32;
    let height = buffer.height() as u32;

    match format {
        ImageFormat::Png => {
            let rgba = to_rgba(buffer);
            PngEncoder::new(writer)
                .write_image(&rgba, width, height, ExtendedColorType::Rgba8)
                .context("error encoding PNG")?;
        }
        ImageFormat::Jpeg => {
            let rgb = to_rgb(buffer);
            JpegEncoder::new_with_quality(writer, quality)
                .write_image(&rgb, width, height, ExtendedColorType::Rgb8)
                .context("error encoding JPEG")?;
        }
        ImageFormat::Ppm => {
            let rgb = to_rgb(buffer);
            write!(writer, "P6\n{width} {height}\n255\n")?;
            writer.write_all(&rgb)?;
        }
    }
    Ok(())
}

/// `screenshot-%Y%m%d-%H%M%S.<ext>`
pub fn generate_filename(format: ImageFormat) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    format!("screenshot-{stamp}.{}", format.extension())
}

pub fn default_output_dir() -> PathBuf {
    screenshots_dir()
}

/// Hands the encoded image to the Wayland clipboard via wl-copy.
pub fn copy_to_clipboard(data: &[u8], mime_type: &str) -> anyhow::Result<()> {
    let mut child = Command::new("wl-copy")
        .args(["--type", mime_type])
        .stdin(Stdio::piped())
        .spawn()
        .context("error running wl-copy (is wl-clipboard installed?)")?;

    child
        .stdin
        .take()
        .context("no stdin pipe for wl-copy")?
        .write_all(data)
        .context("error writing to wl-copy")?;

    let status = child.wait().context("error waiting for wl-copy")?;
    anyhow::ensure!(status.success(), "wl-copy exited with {status}");
    Ok(())
}

/// Desktop notification for a finished screenshot.
pub fn show_screenshot_notification(image_path: Option<&Path>) -> anyhow::Result<()> {
    use std::collections::HashMap;
    use zbus::zvariant::Value;

    let conn = zbus::blocking::Connection::session()
        .context("error connecting to the session bus")?;

    let body = image_path
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Copied to clipboard".to_owned());
    let mut hints: HashMap<&str, Value<'_>> = HashMap::new();
    if let Some(path) = image_path {
        hints.insert("image-path", Value::from(path.to_string_lossy().into_owned()));
    }

    conn.call_method(
        Some("org.freedesktop.Notifications"),
        "/org/freedesktop/Notifications",
        Some("org.freedesktop.Notifications"),
        "Notify",
        &(
            "dusk",
            0u32,
            "camera-photo",
            "Screenshot captured",
            body.as_str(),
            Vec::<&str>::new(),
            hints,
            5000i32,
        ),
    )
    .context("failed to send notification")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use wayland_client::protocol::wl_shm;

    use super::*;

    fn two_pixel_buffer(format: wl_shm::Format) -> ShmBuffer {
        let mut buf = ShmBuffer::create(2, 1, 8, format).unwrap();
        // Pixel 0: bytes 10, 20, 30; pixel 1: 40, 50, 60; alpha 0xFF.
        buf.data_mut()
            .copy_from_slice(&[10, 20, 30, 0xFF, 40, 50, 60, 0xFF]);
        buf
    }

    #[test]
    fn rgba_swaps_for_bgr_memory_order() {
        // Xrgb8888 stores B, G, R, X in memory.
        let buf = two_pixel_buffer(wl_shm::Format::Xrgb8888);
        assert_eq!(
            to_rgba(&buf),
            vec![30, 20, 10, 0xFF, 60, 50, 40, 0xFF]
        );

        // Xbgr8888 stores R, G, B, X and needs no swap.
        let buf = two_pixel_buffer(wl_shm::Format::Xbgr8888);
        assert_eq!(
            to_rgba(&buf),
            vec![10, 20, 30, 0xFF, 40, 50, 60, 0xFF]
        );
    }

    #[test]
    fn rgba_strips_stride_padding() {
        let mut buf = ShmBuffer::create(1, 2, 8, wl_shm::Format::Xbgr8888).unwrap();
        buf.data_mut().copy_from_slice(&[
            1, 2, 3, 4, 0xEE, 0xEE, 0xEE, 0xEE, //
            5, 6, 7, 8, 0xEE, 0xEE, 0xEE, 0xEE,
        ]);
        assert_eq!(to_rgba(&buf), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn ppm_has_correct_header_and_payload() {
        let buf = two_pixel_buffer(wl_shm::Format::Xbgr8888);
        let mut out = Vec::new();
        encode(&buf, ImageFormat::Ppm, 90, &mut out).unwrap();
        assert!(out.starts_with(b"P6\n2 1\n255\n"));
        assert_eq!(&out[out.len() - 6..], &[10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn png_round_trips_through_the_decoder() {
        let buf = two_pixel_buffer(wl_shm::Format::Xrgb8888);
        let mut out = Vec::new();
        encode(&buf, ImageFormat::Png, 90, &mut out).unwrap();

        let decoded = image::load_from_memory(&out).unwrap().into_rgba8();
        assert_eq!(decoded.dimensions(), (2, 1));
        assert_eq!(decoded.get_pixel(0, 0).0, [30, 20, 10, 0xFF]);
    }

    #[test]
    fn filenames_carry_the_extension() {
        assert!(generate_filename(ImageFormat::Png).ends_with(".png"));
        assert!(generate_filename(ImageFormat::Jpeg).ends_with(".jpg"));
        assert!(generate_filename(ImageFormat::Ppm).ends_with(".ppm"));
    }
}
