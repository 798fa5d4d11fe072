//! Moving-average motion detector.
//!
//! Each sampled frame is blurred, folded into an exponentially weighted background
//! model, and differenced against it. The thresholded difference gives the motion
//! percentage; its dilated/eroded contours give candidate regions for the secondary
//! detectors.

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::find_contours;
use imageproc::distance_transform::Norm;
use imageproc::filter::box_filter;
use imageproc::morphology::{dilate, erode};

use crate::detect::{MotionReport, Rect};

/// Motion detector tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionConfig {
    /// Box blur kernel (width, height).
    pub blur_kernel: (u32, u32),
    /// Background accumulation weight, 0 < alpha < 1.
    pub alpha: f32,
    /// Gray level a difference pixel must exceed to count as motion.
    pub black_threshold: u8,
    /// Motion percentage treated as a lighting change (background reset). Regions
    /// covering at least this percentage of the frame are dropped as well.
    pub max_change: f32,
    pub dilate_iterations: u8,
    pub erode_iterations: u8,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            blur_kernel: (8, 8),
            alpha: 0.03,
            black_threshold: 25,
            max_change: 50.0,
            dilate_iterations: 14,
            erode_iterations: 2,
        }
    }
}

impl MotionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.blur_kernel.0 == 0 || self.blur_kernel.1 == 0 {
            return Err(anyhow!(
                "motion blur kernel must be positive, got {:?}",
                self.blur_kernel
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(anyhow!("motion alpha must be in (0, 1), got {}", self.alpha));
        }
        if !(self.max_change > 0.0 && self.max_change <= 100.0) {
            return Err(anyhow!(
                "motion max_change must be in (0, 100], got {}",
                self.max_change
            ));
        }
        Ok(())
    }
}

/// Floating point running average, three channels.
struct BackgroundModel {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl BackgroundModel {
    fn from_image(image: &RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            data: image.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    fn matches(&self, image: &RgbImage) -> bool {
        self.width == image.width() && self.height == image.height()
    }

    fn accumulate(&mut self, image: &RgbImage, alpha: f32) {
        for (acc, &v) in self.data.iter_mut().zip(image.as_raw()) {
            *acc = (1.0 - alpha) * *acc + alpha * v as f32;
        }
    }

    /// Absolute difference against the model, rounded and saturated to 8 bits.
    fn abs_diff(&self, image: &RgbImage) -> RgbImage {
        let raw = image
            .as_raw()
            .iter()
            .zip(&self.data)
            .map(|(&v, &acc)| v.abs_diff(acc.round().clamp(0.0, 255.0) as u8))
            .collect();
        // Same dimensions as `image`, so the buffer length always matches.
        RgbImage::from_raw(self.width, self.height, raw).unwrap_or_default()
    }
}

/// Motion detector with its own background model.
pub struct MotionDetector {
    config: MotionConfig,
    background: Option<BackgroundModel>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            background: None,
        })
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Forget the background model; the next frame re-initialises it.
    pub fn reset(&mut self) {
        self.background = None;
    }

    /// Evaluate one (already resized) frame.
    pub fn detect(&mut self, image: &RgbImage) -> MotionReport {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return MotionReport {
                mask: GrayImage::new(width, height),
                motion_percent: 0.0,
                regions: Vec::new(),
                background_reset: false,
            };
        }

        let work = box_blur(image, self.config.blur_kernel);
        if !self
            .background
            .as_ref()
            .is_some_and(|model| model.matches(&work))
        {
            self.background = Some(BackgroundModel::from_image(&work));
        }
        let background = self
            .background
            .get_or_insert_with(|| BackgroundModel::from_image(&work));
        background.accumulate(&work, self.config.alpha);
        let diff = background.abs_diff(&work);

        let gray = image::imageops::grayscale(&diff);
        let threshold = self.config.black_threshold;
        let mut changed: u64 = 0;
        let mask = GrayImage::from_fn(width, height, |x, y| {
            if gray.get_pixel(x, y)[0] > threshold {
                changed += 1;
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let total = width as u64 * height as u64;
        let motion_percent = (100.0 * changed as f64 / total as f64) as f32;

        let background_reset = motion_percent > self.config.max_change;
        if background_reset {
            self.background = Some(BackgroundModel::from_image(&work));
        }

        let mask = close_gaps(
            &mask,
            self.config.dilate_iterations,
            self.config.erode_iterations,
        );
        let candidates = contour_rects(&mask);
        let regions = filter_regions(&candidates, width, height, self.config.max_change);

        MotionReport {
            mask,
            motion_percent,
            regions,
            background_reset,
        }
    }
}

/// Per-channel box blur. Even kernel sizes grow to the next odd size (8 becomes 9).
fn box_blur(image: &RgbImage, kernel: (u32, u32)) -> RgbImage {
    let (width, height) = image.dimensions();
    let (rx, ry) = (kernel.0 / 2, kernel.1 / 2);
    let mut out = RgbImage::new(width, height);
    for channel in 0..3 {
        let plane = GrayImage::from_fn(width, height, |x, y| Luma([image.get_pixel(x, y)[channel]]));
        let blurred = box_filter(&plane, rx, ry);
        for (x, y, pixel) in blurred.enumerate_pixels() {
            out.get_pixel_mut(x, y)[channel] = pixel[0];
        }
    }
    out
}

/// Dilate then erode; merges nearby blobs and removes speckle.
fn close_gaps(mask: &GrayImage, dilate_iterations: u8, erode_iterations: u8) -> GrayImage {
    let mut out = mask.clone();
    if dilate_iterations > 0 {
        out = dilate(&out, Norm::LInf, dilate_iterations);
    }
    if erode_iterations > 0 {
        out = erode(&out, Norm::LInf, erode_iterations);
    }
    out
}

/// Bounding rectangles of every contour, outer and hole borders alike.
fn contour_rects(mask: &GrayImage) -> Vec<Rect> {
    find_contours::<u32>(mask)
        .iter()
        .filter_map(|contour| {
            let first = contour.points.first()?;
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
            for p in &contour.points {
                min_x = min_x.min(p.x);
                min_y = min_y.min(p.y);
                max_x = max_x.max(p.x);
                max_y = max_y.max(p.y);
            }
            Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
        })
        .collect()
}

/// Drop rectangles strictly inside another candidate, and rectangles covering at
/// least `max_change` percent of the frame.
///
/// Containment is checked pairwise against the raw candidate list only.
pub fn filter_regions(candidates: &[Rect], width: u32, height: u32, max_change: f32) -> Vec<Rect> {
    let total = width as f64 * height as f64;
    candidates
        .iter()
        .enumerate()
        .filter(|&(i, r)| {
            !candidates
                .iter()
                .enumerate()
                .any(|(j, q)| i != j && r.inside(q))
        })
        .map(|(_, r)| *r)
        .filter(|r| total > 0.0 && (r.area() as f64 / total * 100.0) < max_change as f64)
        .collect()
}
