//! V4L2 camera device source.
//!
//! Accepts a device path (`/dev/video0`) or a bare camera index (`0`). The source
//! asks for MJPG first, since USB webcams deliver full resolution that way, and
//! falls back to whatever the driver negotiates when it is YUYV or RGB3.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{decode_next, FrameSource, SourceConfig, SourceInfo, SourceStats};
use crate::error::StreamError;
use crate::frame::Frame;

/// Map a camera index to its device node; paths pass through.
pub fn device_path(url: &str) -> String {
    match url.trim().parse::<u32>() {
        Ok(index) => format!("/dev/video{}", index),
        Err(_) => url.trim().to_string(),
    }
}

pub struct V4l2Source {
    config: SourceConfig,
    device: String,
    state: Option<DeviceState>,
    format: PixelFormat,
    info: SourceInfo,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let device = device_path(&config.url);
        if device.is_empty() {
            return Err(anyhow!("empty camera device"));
        }
        Ok(Self {
            config,
            device,
            state: None,
            format: PixelFormat::Mjpeg,
            info: SourceInfo::default(),
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        })
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.info.fps == 0 {
            2_000
        } else {
            (1000 / self.info.fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    /// Dequeue one buffer. A failed dequeue means the device is gone.
    fn capture(&mut self) -> Result<Vec<u8>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let captured = state.with_mut(|fields| {
            fields
                .stream
                .next()
                .map(|(buf, meta)| buf[..(meta.bytesused as usize).min(buf.len())].to_vec())
        });
        captured.map_err(|err| {
            self.last_error = Some(err.to_string());
            anyhow::Error::new(StreamError::SourceExhausted)
                .context(format!("capture v4l2 frame from {}: {}", self.device, err))
        })
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.device)
            .with_context(|| format!("open v4l2 device {}", self.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.fourcc = v4l::FourCC::new(b"MJPG");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Source: failed to request MJPG on {}: {}", self.device, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} delivers unsupported format {}",
                self.device,
                format.fourcc
            )
        })?;

        let mut fps = self.config.fps;
        match device.params() {
            Ok(params) if params.interval.numerator > 0 => {
                fps = params.interval.denominator / params.interval.numerator;
            }
            Ok(_) => {}
            Err(err) => log::warn!("V4l2Source: cannot read frame rate of {}: {}", self.device, err),
        }

        self.info = SourceInfo {
            width: format.width,
            height: format.height,
            fps,
        };
        self.last_error = None;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?} @ {} fps)",
            self.device,
            self.info.width,
            self.info.height,
            self.format,
            self.info.fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let (width, height, format) = (self.info.width, self.info.height, self.format);
        let (buffer, image) = decode_next(
            "V4l2Source",
            || self.capture(),
            |buffer: &Vec<u8>| normalize_to_rgb(buffer, width, height, format),
        )?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        let frame = Frame::new(image, Local::now());
        Ok(if format == PixelFormat::Mjpeg {
            frame.with_jpeg(buffer)
        } else {
            frame
        })
    }

    fn info(&self) -> SourceInfo {
        self.info
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.device.clone(),
        }
    }
}
