//! The capture/analyse/record loop.
//!
//! One `Pipeline` drives one camera on the calling thread. Per frame it:
//! 1. reads the next frame and pushes it into the one-second pre-roll buffer
//! 2. on sampled frames, shrinks the frame, measures motion, starts a segment,
//!    runs the secondary detector over the motion regions and marks hits
//! 3. while recording, writes the oldest buffered frame and stops once motion
//!    has settled
//!
//! End of stream, timeouts and protocol errors end the loop in an orderly way; an
//! active segment is always finalised before `run` returns.

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::detect::{Rect, SecondaryDetector};
use crate::error::StreamError;
use crate::frame::{Frame, FrameRingBuffer};
use crate::ingest::FrameSource;
use crate::motion::MotionDetector;
use crate::record::{encode_jpeg, Recorder, SinkFactory};

const MOTION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const DETECTION_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const MARK_THICKNESS: u32 = 2;

// ----------------------------------------------------------------------------
// Sampling
// ----------------------------------------------------------------------------

/// Decides which frames are analysed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SamplingGate {
    frame_to_check: u32,
    skip_count: u32,
    throttle_frames: u32,
}

impl SamplingGate {
    /// Analyse one frame in every `fps / divisor + 1`; a quotient below one samples
    /// every frame.
    pub fn new(fps: u32, divisor: u32, throttle_frames: u32) -> Self {
        let frame_to_check = if divisor == 0 { 0 } else { fps / divisor };
        Self {
            frame_to_check,
            skip_count: 0,
            throttle_frames,
        }
    }

    pub fn frame_to_check(&self) -> u32 {
        self.frame_to_check
    }

    pub fn should_sample(&mut self) -> bool {
        if self.skip_count == 0 {
            self.skip_count = self.frame_to_check;
            true
        } else {
            self.skip_count -= 1;
            false
        }
    }

    /// Back off after a frame that changed too much to trust.
    pub fn throttle(&mut self) {
        self.skip_count = self.throttle_frames;
    }
}

// ----------------------------------------------------------------------------
// Resize geometry
// ----------------------------------------------------------------------------

/// Detection resolution for a frame and the factors mapping back to full size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizeGeometry {
    pub divisor: u32,
    pub width: u32,
    pub height: u32,
    pub mul_w: u32,
    pub mul_h: u32,
}

impl ResizeGeometry {
    pub fn new(frame_w: u32, frame_h: u32, resize_width_div: u32) -> Self {
        let divisor = (frame_w / resize_width_div.max(1)).max(1);
        let width = (frame_w / divisor).max(1);
        let height = (frame_h / divisor).max(1);
        Self {
            divisor,
            width,
            height,
            mul_w: (frame_w / width).max(1),
            mul_h: (frame_h / height).max(1),
        }
    }

    pub fn resize(&self, image: &RgbImage) -> RgbImage {
        if self.divisor == 1 {
            image.clone()
        } else {
            image::imageops::resize(image, self.width, self.height, FilterType::Nearest)
        }
    }

    pub fn to_frame(&self, rect: &Rect) -> Rect {
        rect.scale(self.mul_w, self.mul_h)
    }
}

/// Draw `rects` (already in frame coordinates) as hollow boxes.
pub fn mark_rects(image: &mut RgbImage, rects: &[Rect], color: Rgb<u8>) {
    for rect in rects {
        for inset in 0..MARK_THICKNESS {
            let (w, h) = (rect.w.saturating_sub(2 * inset), rect.h.saturating_sub(2 * inset));
            if w == 0 || h == 0 {
                break;
            }
            let outline = imageproc::rect::Rect::at((rect.x + inset) as i32, (rect.y + inset) as i32)
                .of_size(w, h);
            draw_hollow_rect_mut(image, outline, color);
        }
    }
}

// ----------------------------------------------------------------------------
// FPS logging
// ----------------------------------------------------------------------------

struct FpsMeter {
    interval: Duration,
    window_start: Instant,
    window_frames: u64,
}

impl FpsMeter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            window_frames: 0,
        }
    }

    /// Count a frame; returns the window's FPS when the interval has elapsed.
    fn tick(&mut self) -> Option<f64> {
        self.window_frames += 1;
        let elapsed = self.window_start.elapsed();
        if self.interval.is_zero() || elapsed < self.interval {
            return None;
        }
        let fps = self.window_frames as f64 / elapsed.as_secs_f64();
        self.window_start = Instant::now();
        self.window_frames = 0;
        Some(fps)
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineStats {
    pub frames: u64,
    pub sampled: u64,
    /// Finished recording segments.
    pub segments: u64,
    /// Secondary detector hits.
    pub detections: u64,
    /// Largest pre-roll buffer footprint seen, in bytes.
    pub peak_preroll_bytes: usize,
    pub elapsed: Duration,
}

impl PipelineStats {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

pub struct Pipeline {
    settings: Settings,
    source: Box<dyn FrameSource>,
    motion: MotionDetector,
    detector: Option<Box<dyn SecondaryDetector>>,
    sink_factory: Option<Box<dyn SinkFactory>>,
}

impl Pipeline {
    pub fn new(
        settings: &Settings,
        source: Box<dyn FrameSource>,
        detector: Option<Box<dyn SecondaryDetector>>,
        sink_factory: Box<dyn SinkFactory>,
    ) -> Result<Self> {
        let motion = MotionDetector::new(settings.motion.detector.clone()).context("motion settings")?;
        Ok(Self {
            settings: settings.clone(),
            source,
            motion,
            detector,
            sink_factory: Some(sink_factory),
        })
    }

    /// Connect the source and process frames until the stream ends or `shutdown` is set.
    ///
    /// A pipeline runs once; its sink factory moves into the recorder.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<PipelineStats> {
        let factory = self
            .sink_factory
            .take()
            .ok_or_else(|| anyhow!("pipeline has already run"))?;
        self.source.connect().context("connect to camera")?;
        if !self.source.is_healthy() {
            return Err(anyhow!(
                "camera {} is not healthy after connect",
                self.source.stats().source
            ));
        }

        let info = self.source.info();
        let fps = if info.fps > 0 { info.fps } else { self.settings.camera.fps };
        if info.width == 0 || info.height == 0 {
            return Err(anyhow!("camera {} reported no resolution", self.settings.camera.url));
        }
        let geometry = ResizeGeometry::new(info.width, info.height, self.settings.camera.resize_width_div);
        log::info!("URL: {}, fps: {}", self.settings.camera.url, fps);
        log::info!(
            "Resolution: {}x{}, detecting at {}x{}",
            info.width,
            info.height,
            geometry.width,
            geometry.height
        );

        let mut recorder = Recorder::new(self.settings.recorder_config(fps), factory);
        let mut buffer = FrameRingBuffer::new(fps as usize);
        let mut gate = SamplingGate::new(
            fps,
            self.settings.camera.sampling_divisor,
            self.settings.motion.skip_frames,
        );
        let mut fps_meter = FpsMeter::new(self.settings.camera.fps_interval);
        let mut stats = PipelineStats::default();
        let mut last_motion = 0.0f32;
        let started = Instant::now();

        let outcome = loop {
            if shutdown.load(Ordering::SeqCst) {
                log::info!("shutdown requested");
                break Ok(());
            }
            let frame = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(err) => match StreamError::classify(&err) {
                    Some(kind) if kind.ends_stream() => {
                        log::info!("stream ended: {:#}", err);
                        break Ok(());
                    }
                    _ => break Err(err),
                },
            };
            stats.frames += 1;
            buffer.push(frame);
            stats.peak_preroll_bytes = stats.peak_preroll_bytes.max(buffer.memory_bytes());
            if let Some(fps) = fps_meter.tick() {
                log::debug!(
                    "{:.1} FPS, pre-roll {} frames ({} bytes)",
                    fps,
                    buffer.len(),
                    buffer.memory_bytes()
                );
            }

            if gate.should_sample() {
                stats.sampled += 1;
                if let Some(frame) = buffer.latest_mut() {
                    last_motion =
                        self.analyse(frame, stats.frames, &mut recorder, &mut gate, &mut stats);
                }
            }

            if recorder.is_recording() {
                if let Some(oldest) = buffer.oldest() {
                    if let Err(err) = recorder.write(oldest) {
                        log::error!("segment aborted: {:#}", err);
                    }
                }
                if recorder.is_recording() && recorder.should_stop(last_motion) {
                    finish_segment(&mut recorder);
                }
            }
        };

        finish_segment(&mut recorder);
        stats.segments = recorder.segments();
        stats.elapsed = started.elapsed();
        log::info!(
            "Calculated {:.1} FPS, elapsed time: {:.2} seconds",
            stats.fps(),
            stats.elapsed.as_secs_f64()
        );
        outcome.map(|_| stats)
    }

    /// Analyse one sampled frame in place. Returns its motion percentage.
    fn analyse(
        &mut self,
        frame: &mut Frame,
        frame_number: u64,
        recorder: &mut Recorder,
        gate: &mut SamplingGate,
        stats: &mut PipelineStats,
    ) -> f32 {
        let (width, height) = frame.dimensions();
        let geometry = ResizeGeometry::new(width, height, self.settings.camera.resize_width_div);
        let small = geometry.resize(frame.image());
        let report = self.motion.detect(&small);
        let motion = report.motion_percent;

        if motion >= self.motion.config().max_change {
            gate.throttle();
            log::debug!("Maximum motion change: {:.2}", motion);
        }
        if !recorder.should_start(motion) {
            return motion;
        }
        if !recorder.is_recording() {
            match recorder.start(frame.captured_at(), (width, height)) {
                Ok(path) => log::info!("Start recording ({:.2}) {}", motion, path.display()),
                Err(err) => log::error!("cannot start recording: {:#}", err),
            }
        }

        // Snapshot bytes are taken before marking so camera JPEGs are stored untouched.
        let raw_jpeg = if self.settings.camera.save_frames {
            frame.jpeg().map(<[u8]>::to_vec)
        } else {
            None
        };

        if self.settings.camera.mark && !report.regions.is_empty() {
            let boxes: Vec<Rect> = report.regions.iter().map(|r| geometry.to_frame(r)).collect();
            mark_rects(frame.image_mut(), &boxes, MOTION_COLOR);
        }

        let Some(detector) = self.detector.as_mut() else {
            return motion;
        };
        let hits = detector.detect(&report.regions, &small);
        if hits.is_empty() {
            return motion;
        }
        let kind = detector.kind();
        stats.detections += hits.len() as u64;
        recorder.flag(kind);
        log::debug!(
            "{} detected locations: {:?}",
            kind.tag(),
            hits.iter().map(|hit| hit.region).collect::<Vec<_>>()
        );

        if self.settings.camera.mark {
            let boxes: Vec<Rect> = hits
                .iter()
                .map(|hit| hit.frame_region(geometry.mul_w, geometry.mul_h))
                .collect();
            mark_rects(frame.image_mut(), &boxes, DETECTION_COLOR);
        }

        if self.settings.camera.save_frames && recorder.is_recording() {
            let jpeg = match raw_jpeg {
                Some(jpeg) => Ok(jpeg),
                None => encode_jpeg(frame.image()),
            };
            match jpeg.and_then(|jpeg| recorder.save_snapshot(kind, frame_number, &jpeg)) {
                Ok(path) => log::debug!("saved {}", path.display()),
                Err(err) => log::warn!("cannot save detection frame: {:#}", err),
            }
        }
        motion
    }
}

fn finish_segment(recorder: &mut Recorder) {
    match recorder.stop() {
        Ok(Some(path)) => log::info!("Stop recording {}", path.display()),
        Ok(None) => {}
        Err(err) => log::error!("cannot finalise recording: {:#}", err),
    }
}
