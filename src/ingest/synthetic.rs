//! Synthetic scene source for `stub://` URLs.
//!
//! Renders a flat gray background with optional sensor noise and, in periodic
//! bursts, a bright square sliding across the scene. Geometry and timing come
//! from the URL query:
//!
//! `stub://porch?width=320&height=240&frames=200&period=50&burst=10&noise=2&seed=7`
//!
//! - `frames`: frames before the source reports exhaustion (0 = endless)
//! - `period`/`burst`: the square is visible for the last `burst` frames of every
//!   `period` frames (`period=0` disables motion)

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use url::Url;

use super::{FrameSource, SourceConfig, SourceInfo, SourceStats};
use crate::error::StreamError;
use crate::frame::Frame;

const BACKGROUND: u8 = 64;
const FOREGROUND: u8 = 230;

#[derive(Clone, Debug, PartialEq)]
struct SceneParams {
    width: u32,
    height: u32,
    frames: u64,
    period: u64,
    burst: u64,
    noise: u8,
    seed: u64,
    /// Real-time pacing between frames; zero for as-fast-as-possible.
    pace: Duration,
}

impl Default for SceneParams {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            frames: 0,
            period: 50,
            burst: 10,
            noise: 0,
            seed: 0,
            pace: Duration::ZERO,
        }
    }
}

impl SceneParams {
    fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("parse synthetic url {}", raw))?;
        let mut params = SceneParams::default();
        for (key, value) in url.query_pairs() {
            let number = || -> Result<u64> {
                value
                    .parse::<u64>()
                    .map_err(|_| anyhow!("synthetic url: {}='{}' is not a number", key, value))
            };
            match key.as_ref() {
                "width" => params.width = number()? as u32,
                "height" => params.height = number()? as u32,
                "frames" => params.frames = number()?,
                "period" => params.period = number()?,
                "burst" => params.burst = number()?,
                "noise" => params.noise = number()?.min(u8::MAX as u64) as u8,
                "seed" => params.seed = number()?,
                "pace_ms" => params.pace = Duration::from_millis(number()?),
                other => log::warn!("SyntheticSource: ignoring unknown parameter '{}'", other),
            }
        }
        if params.width < 8 || params.height < 8 {
            return Err(anyhow!(
                "synthetic scene must be at least 8x8, got {}x{}",
                params.width,
                params.height
            ));
        }
        if params.burst > params.period {
            params.burst = params.period;
        }
        Ok(params)
    }
}

/// Deterministic synthetic camera.
pub struct SyntheticSource {
    url: String,
    fps: u32,
    params: SceneParams,
    rng: StdRng,
    connected: bool,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let params = SceneParams::from_url(&config.url)?;
        Ok(Self {
            url: config.url.clone(),
            fps: config.fps,
            rng: StdRng::seed_from_u64(params.seed),
            params,
            connected: false,
            frame_count: 0,
        })
    }

    /// Whether frame `index` (0-based) shows the moving square.
    pub fn motion_at(&self, index: u64) -> bool {
        let SceneParams { period, burst, .. } = self.params;
        period > 0 && burst > 0 && index % period >= period - burst
    }

    fn render(&mut self, index: u64) -> RgbImage {
        let (width, height) = (self.params.width, self.params.height);
        let mut image = RgbImage::from_pixel(width, height, Rgb([BACKGROUND; 3]));

        if self.params.noise > 0 {
            let noise = self.params.noise as i16;
            for pixel in image.pixels_mut() {
                let delta = self.rng.gen_range(-noise..=noise);
                let value = (BACKGROUND as i16 + delta).clamp(0, 255) as u8;
                *pixel = Rgb([value; 3]);
            }
        }

        if self.motion_at(index) {
            let side = (width.min(height) / 4).max(2);
            let step = index % self.params.period.max(1);
            let travel = (width - side) as u64;
            let x = ((step * 7) % travel.max(1)) as u32;
            let y = (height - side) / 2;
            for py in y..y + side {
                for px in x..x + side {
                    image.put_pixel(px, py, Rgb([FOREGROUND; 3]));
                }
            }
        }
        image
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "SyntheticSource: connected to {} ({}x{})",
            self.url,
            self.params.width,
            self.params.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        if self.params.frames > 0 && self.frame_count >= self.params.frames {
            return Err(StreamError::SourceExhausted.into());
        }
        if !self.params.pace.is_zero() {
            std::thread::sleep(self.params.pace);
        }
        let image = self.render(self.frame_count);
        self.frame_count += 1;
        Ok(Frame::new(image, Local::now()))
    }

    fn info(&self) -> SourceInfo {
        if !self.connected {
            return SourceInfo::default();
        }
        SourceInfo {
            width: self.params.width,
            height: self.params.height,
            fps: self.fps,
        }
    }

    fn is_healthy(&self) -> bool {
        self.connected && (self.params.frames == 0 || self.frame_count < self.params.frames)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str) -> SyntheticSource {
        let config = SourceConfig {
            url: url.to_string(),
            ..SourceConfig::default()
        };
        let mut source = SyntheticSource::new(&config).unwrap();
        source.connect().unwrap();
        source
    }

    #[test]
    fn parses_query_parameters() {
        let params =
            SceneParams::from_url("stub://cam?width=64&height=48&frames=3&period=10&burst=20")
                .unwrap();
        assert_eq!((params.width, params.height, params.frames), (64, 48, 3));
        assert_eq!(params.burst, 10, "burst is capped at period");
        assert!(SceneParams::from_url("stub://cam?width=abc").is_err());
        assert!(SceneParams::from_url("stub://cam?width=4").is_err());
    }

    #[test]
    fn exhausts_after_frame_limit() {
        let mut source = source("stub://cam?width=32&height=32&frames=2");
        source.next_frame().unwrap();
        source.next_frame().unwrap();
        let err = source.next_frame().unwrap_err();
        assert_eq!(StreamError::classify(&err), Some(&StreamError::SourceExhausted));
        assert!(!source.is_healthy());
    }

    #[test]
    fn square_appears_only_during_bursts() {
        let mut source = source("stub://cam?width=64&height=64&period=4&burst=2");
        let frames: Vec<_> = (0..4).map(|_| source.next_frame().unwrap()).collect();
        let has_square = |frame: &Frame| frame.image().pixels().any(|p| p[0] == FOREGROUND);
        assert!(!has_square(&frames[0]));
        assert!(!has_square(&frames[1]));
        assert!(has_square(&frames[2]));
        assert!(has_square(&frames[3]));
    }

    #[test]
    fn same_seed_renders_same_noise() {
        let url = "stub://cam?width=16&height=16&noise=5&seed=3&period=0";
        let a = source(url).next_frame().unwrap();
        let b = source(url).next_frame().unwrap();
        assert_eq!(a.image().as_raw(), b.image().as_raw());
    }

    #[test]
    fn next_frame_requires_connect() {
        let config = SourceConfig {
            url: "stub://cam".to_string(),
            ..SourceConfig::default()
        };
        let mut source = SyntheticSource::new(&config).unwrap();
        assert!(source.next_frame().is_err());
        assert_eq!(source.info(), SourceInfo::default());
    }
}
