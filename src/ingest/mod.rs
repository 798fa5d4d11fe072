//! Frame ingestion sources.
//!
//! This module provides the sources a pipeline can read from:
//! - MJPEG over HTTP (`http://` URLs, multipart/x-mixed-replace)
//! - USB/V4L2 camera devices (feature: ingest-v4l2)
//! - Synthetic scenes (`stub://` URLs, testing and demos)
//!
//! Every source produces `Frame` instances in arrival order. A source reports
//! `StreamError::SourceExhausted` when the stream ends, `StreamError::Timeout` when
//! no data arrives in time and `StreamError::Protocol` for malformed transports.

pub mod mjpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use crate::error::StreamError;
use crate::frame::Frame;

pub use mjpeg::{MjpegClient, MjpegSource};
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Default socket timeout for network sources.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive undecodable payloads tolerated before a stream is considered broken.
pub const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 30;

/// Pull payloads until one decodes.
///
/// Errors from `next_payload` are returned unchanged. Decode failures are logged and
/// the payload is skipped; after `MAX_CONSECUTIVE_DECODE_FAILURES` in a row the stream
/// is reported as a `StreamError::Protocol`.
pub(crate) fn decode_next<P, T>(
    source: &str,
    mut next_payload: impl FnMut() -> Result<P>,
    mut decode: impl FnMut(&P) -> Result<T>,
) -> Result<(P, T)> {
    let mut failures = 0u32;
    loop {
        let payload = next_payload()?;
        match decode(&payload) {
            Ok(decoded) => return Ok((payload, decoded)),
            Err(err) => {
                failures += 1;
                log::warn!("{}: skipping undecodable frame: {:#}", source, err);
                if failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                    return Err(StreamError::protocol(format!(
                        "{} consecutive undecodable frames",
                        failures
                    ))
                    .into());
                }
            }
        }
    }
}

/// Resolved stream geometry, known after `connect`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Statistics for a source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// A sequential producer of frames.
pub trait FrameSource {
    /// Open the underlying stream. Must be called before `next_frame`.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame arrives.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Geometry and frame rate; zeroed until connected.
    fn info(&self) -> SourceInfo;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Configuration for a stream source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `http://` MJPEG URL, `stub://` synthetic scene, device path or camera index.
    pub url: String,
    /// Frame rate to report for sources that cannot measure it (MJPEG, synthetic).
    pub fps: u32,
    /// Socket read timeout.
    pub timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/?action=stream".to_string(),
            fps: 5,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Source chosen from the URL.
pub struct StreamSource {
    backend: SourceBackend,
}

enum SourceBackend {
    Mjpeg(MjpegSource),
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-v4l2")]
    Device(V4l2Source),
}

impl StreamSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let backend = if config.url.starts_with("stub://") {
            SourceBackend::Synthetic(SyntheticSource::new(&config)?)
        } else if config.url.contains("://") {
            let url = Url::parse(&config.url).context("parse stream url")?;
            match url.scheme() {
                "http" => SourceBackend::Mjpeg(MjpegSource::new(config)),
                other => {
                    return Err(anyhow!(
                        "unsupported stream scheme '{}'; expected http, stub or a camera device",
                        other
                    ))
                }
            }
        } else {
            Self::device_backend(config)?
        };
        Ok(Self { backend })
    }

    #[cfg(feature = "ingest-v4l2")]
    fn device_backend(config: SourceConfig) -> Result<SourceBackend> {
        Ok(SourceBackend::Device(V4l2Source::new(config)?))
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    fn device_backend(config: SourceConfig) -> Result<SourceBackend> {
        Err(anyhow!(
            "camera device '{}' requires the ingest-v4l2 feature",
            config.url
        ))
    }
}

impl FrameSource for StreamSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            SourceBackend::Mjpeg(source) => source.connect(),
            SourceBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Device(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            SourceBackend::Mjpeg(source) => source.next_frame(),
            SourceBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Device(source) => source.next_frame(),
        }
    }

    fn info(&self) -> SourceInfo {
        match &self.backend {
            SourceBackend::Mjpeg(source) => source.info(),
            SourceBackend::Synthetic(source) => source.info(),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Device(source) => source.info(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            SourceBackend::Mjpeg(source) => source.is_healthy(),
            SourceBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Device(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            SourceBackend::Mjpeg(source) => source.stats(),
            SourceBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-v4l2")]
            SourceBackend::Device(source) => source.stats(),
        }
    }
}
