use anyhow::{anyhow, Context, Result};
use image::RgbImage;

/// Capture formats a camera device may deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Mjpeg,
    Rgb24,
    /// Packed 4:2:2, `Y0 U Y1 V` per pixel pair.
    Yuyv,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"YUYV" => Some(PixelFormat::Yuyv),
            _ => None,
        }
    }
}

/// Convert one captured buffer into RGB pixels.
pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage> {
    match format {
        PixelFormat::Mjpeg => Ok(image::load_from_memory(pixels)
            .context("decode camera jpeg")?
            .into_rgb8()),
        PixelFormat::Rgb24 => {
            let expected = plane_len(width, height, 3)?;
            // Drivers may pad the buffer past the image.
            let data = pixels
                .get(..expected)
                .ok_or_else(|| length_mismatch("RGB", expected, pixels.len()))?;
            RgbImage::from_raw(width, height, data.to_vec())
                .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))
        }
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height),
    }
}

fn plane_len(width: u32, height: u32, bytes_per_pixel: u32) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(bytes_per_pixel))
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn length_mismatch(kind: &str, expected: usize, actual: usize) -> anyhow::Error {
    anyhow!(
        "{} frame length mismatch: expected at least {}, got {}",
        kind,
        expected,
        actual
    )
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    if width % 2 != 0 {
        return Err(anyhow!("YUYV frame width must be even, got {}", width));
    }
    let expected = plane_len(width, height, 2)?;
    let packed = pixels
        .get(..expected)
        .ok_or_else(|| length_mismatch("YUYV", expected, pixels.len()))?;

    let mut rgb = Vec::with_capacity(plane_len(width, height, 3)?);
    for chunk in packed.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_to_u8(y + 1.402 * v));
            rgb.push(clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_to_u8(y + 1.772 * u));
        }
    }
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow!("YUYV buffer does not fit {}x{}", width, height))
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_yuyv_is_gray() -> Result<()> {
        let yuyv = vec![128u8; 2 * 2 * 2];
        let rgb = normalize_to_rgb(&yuyv, 2, 2, PixelFormat::Yuyv)?;
        assert_eq!(rgb.as_raw(), &vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn rgb_accepts_padded_buffers_and_rejects_short_ones() -> Result<()> {
        let mut pixels = vec![1u8; 9];
        pixels.extend_from_slice(&[0, 0, 0]);
        let rgb = normalize_to_rgb(&pixels, 1, 3, PixelFormat::Rgb24)?;
        assert_eq!(rgb.as_raw(), &vec![1u8; 9]);
        assert!(normalize_to_rgb(&[1u8; 5], 1, 3, PixelFormat::Rgb24).is_err());
        Ok(())
    }

    #[test]
    fn fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(b"NV12"), None);
    }
}
