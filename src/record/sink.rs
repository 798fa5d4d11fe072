use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::StreamError;
use crate::frame::Frame;

/// JPEG quality for frames that have no source bytes to reuse.
pub const JPEG_QUALITY: u8 = 90;

/// An open video file.
pub trait VideoSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. Further writes fail.
    fn close(&mut self) -> Result<()>;
}

/// Opens sinks for new recording segments.
pub trait SinkFactory: Send {
    fn open(&mut self, path: &Path, fourcc: &str, fps: u32, size: (u32, u32)) -> Result<Box<dyn VideoSink>>;
}

/// Encode pixels as a baseline JPEG.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(buf)
}

/// The frame as JPEG bytes, reusing what the camera sent when the pixels are untouched.
pub fn frame_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    match frame.jpeg() {
        Some(raw) => Ok(raw.to_vec()),
        None => encode_jpeg(frame.image()),
    }
}

/// Writes Motion-JPEG streams: JPEG images back to back in one file.
#[derive(Clone, Copy, Debug, Default)]
pub struct MjpegSinkFactory;

impl SinkFactory for MjpegSinkFactory {
    fn open(&mut self, path: &Path, fourcc: &str, fps: u32, size: (u32, u32)) -> Result<Box<dyn VideoSink>> {
        if !fourcc.eq_ignore_ascii_case("MJPG") {
            return Err(StreamError::recording(format!(
                "fourcc '{}' is not supported; only MJPG can be written",
                fourcc
            ))
            .into());
        }
        let sink = MjpegFileSink::create(path, size)?;
        log::debug!(
            "MjpegSinkFactory: opened {} ({}x{} @ {} fps)",
            path.display(),
            size.0,
            size.1,
            fps
        );
        Ok(Box::new(sink))
    }
}

pub struct MjpegFileSink {
    path: PathBuf,
    size: (u32, u32),
    writer: Option<BufWriter<File>>,
    frames: u64,
}

impl MjpegFileSink {
    pub fn create(path: &Path, size: (u32, u32)) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| StreamError::recording(format!("create {}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            size,
            writer: Some(BufWriter::new(file)),
            frames: 0,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl VideoSink for MjpegFileSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("sink {} already closed", self.path.display()))?;
        if frame.dimensions() != self.size {
            return Err(StreamError::recording(format!(
                "frame is {:?}, segment {} was opened at {:?}",
                frame.dimensions(),
                self.path.display(),
                self.size
            ))
            .into());
        }
        let jpeg = frame_jpeg(frame)?;
        writer
            .write_all(&jpeg)
            .map_err(|e| StreamError::recording(format!("write {}: {}", self.path.display(), e)))?;
        self.frames += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer
            .flush()
            .map_err(|e| StreamError::recording(format!("flush {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

impl Drop for MjpegFileSink {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("MjpegFileSink: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use image::Rgb;

    fn frame(w: u32, h: u32) -> Frame {
        Frame::new(RgbImage::from_pixel(w, h, Rgb([40, 80, 120])), Local::now())
    }

    #[test]
    fn writes_concatenated_jpegs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mjpeg");
        let mut sink = MjpegSinkFactory.open(&path, "MJPG", 5, (16, 8)).unwrap();
        sink.write(&frame(16, 8)).unwrap();
        sink.write(&frame(16, 8).with_jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9])).unwrap();
        sink.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 4..], &[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(sink.write(&frame(16, 8)).is_err());
    }

    #[test]
    fn rejects_other_fourccs() {
        let dir = tempfile::tempdir().unwrap();
        let err = MjpegSinkFactory
            .open(&dir.path().join("clip.avi"), "XVID", 5, (16, 8))
            .err()
            .unwrap();
        assert!(matches!(StreamError::classify(&err), Some(StreamError::Recording(_))));
    }

    #[test]
    fn rejects_resolution_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = MjpegFileSink::create(&dir.path().join("clip.mjpeg"), (16, 8)).unwrap();
        assert!(sink.write(&frame(8, 8)).is_err());
        assert_eq!(sink.frames(), 0);
    }

    #[test]
    fn missing_directory_is_recording_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MjpegFileSink::create(&dir.path().join("nope/clip.mjpeg"), (16, 8))
            .err()
            .unwrap();
        assert!(matches!(StreamError::classify(&err), Some(StreamError::Recording(_))));
    }
}
