use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::GrayImage;
use imageproc::hog::{hog, HogOptions};
use serde::Deserialize;

use crate::detect::backend::{Hit, RegionClassifier};
use crate::detect::grouping::suppress_overlaps;
use crate::detect::result::Rect;

/// Smallest region (exclusive) the pedestrian window can be evaluated on.
pub const PEDESTRIAN_MIN_SIZE: (u32, u32) = (63, 127);

const MAX_PYRAMID_LEVELS: usize = 64;
const OVERLAP_IOU: f32 = 0.5;

/// Linear SVM over HOG descriptors, loaded from JSON.
///
/// ```json
/// { "window": [64, 128], "orientations": 9, "cell_side": 8,
///   "block_side": 2, "block_stride": 1, "weights": [...], "bias": -0.1 }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct HogModel {
    #[serde(default = "default_window")]
    pub window: [u32; 2],
    #[serde(default = "default_orientations")]
    pub orientations: usize,
    #[serde(default = "default_cell_side")]
    pub cell_side: usize,
    #[serde(default = "default_block_side")]
    pub block_side: usize,
    #[serde(default = "default_block_stride")]
    pub block_stride: usize,
    pub weights: Vec<f32>,
    pub bias: f32,
}

fn default_window() -> [u32; 2] {
    [64, 128]
}

fn default_orientations() -> usize {
    9
}

fn default_cell_side() -> usize {
    8
}

fn default_block_side() -> usize {
    2
}

fn default_block_stride() -> usize {
    1
}

impl HogModel {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read hog model {}", path.display()))?;
        serde_json::from_str(&raw).map_err(|e| anyhow!("invalid hog model {}: {}", path.display(), e))
    }

    fn options(&self) -> HogOptions {
        HogOptions::new(
            self.orientations,
            false,
            self.cell_side,
            self.block_side,
            self.block_stride,
        )
    }

    /// Length of the descriptor this model's window produces.
    pub fn descriptor_len(&self) -> Result<usize> {
        let blank = GrayImage::new(self.window[0], self.window[1]);
        hog(&blank, self.options())
            .map(|descriptor| descriptor.len())
            .map_err(|e| anyhow!("hog window {:?} unusable: {}", self.window, e))
    }
}

/// Pedestrian search parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct HogSearchConfig {
    /// SVM score a window must exceed.
    pub hit_threshold: f32,
    pub win_stride: (u32, u32),
    pub padding: (u32, u32),
    /// Pyramid step, > 1.
    pub scale: f32,
}

impl Default for HogSearchConfig {
    fn default() -> Self {
        Self {
            hit_threshold: 0.0,
            win_stride: (8, 8),
            padding: (16, 16),
            scale: 1.05,
        }
    }
}

/// Sliding-window HOG + linear SVM people detector.
pub struct HogPeopleDetector {
    model: HogModel,
    options: HogOptions,
    search: HogSearchConfig,
}

impl HogPeopleDetector {
    pub fn new(model: HogModel, search: HogSearchConfig) -> Result<Self> {
        let expected = model.descriptor_len()?;
        if model.weights.len() != expected {
            return Err(anyhow!(
                "hog model has {} weights, window {:?} needs {}",
                model.weights.len(),
                model.window,
                expected
            ));
        }
        if search.win_stride.0 == 0 || search.win_stride.1 == 0 {
            return Err(anyhow!("pedestrian win_stride must be positive"));
        }
        if search.scale <= 1.0 {
            return Err(anyhow!("pedestrian scale must be > 1, got {}", search.scale));
        }
        let options = model.options();
        Ok(Self {
            model,
            options,
            search,
        })
    }

    pub fn from_file(path: &Path, search: HogSearchConfig) -> Result<Self> {
        Self::new(HogModel::from_file(path)?, search)
    }

    fn score(&self, window: &GrayImage) -> Option<f32> {
        let descriptor = hog(window, self.options.clone()).ok()?;
        let dot: f32 = descriptor
            .iter()
            .zip(&self.model.weights)
            .map(|(d, w)| d * w)
            .sum();
        Some(dot + self.model.bias)
    }

    /// Scan an image pyramid and return non-overlapping hits with their SVM scores.
    pub fn detect_multi_scale(&self, image: &GrayImage) -> Vec<Hit> {
        let [win_w, win_h] = self.model.window;
        let (pad_x, pad_y) = self.search.padding;
        let mut padded = GrayImage::new(image.width() + 2 * pad_x, image.height() + 2 * pad_y);
        image::imageops::replace(&mut padded, image, pad_x as i64, pad_y as i64);

        let mut hits = Vec::new();
        let mut scale = 1.0f32;
        for _ in 0..MAX_PYRAMID_LEVELS {
            let w = (padded.width() as f32 / scale).round() as u32;
            let h = (padded.height() as f32 / scale).round() as u32;
            if w < win_w || h < win_h {
                break;
            }
            let level = if w == padded.width() {
                padded.clone()
            } else {
                image::imageops::resize(&padded, w, h, FilterType::Triangle)
            };

            let mut y = 0;
            while y + win_h <= h {
                let mut x = 0;
                while x + win_w <= w {
                    let window = image::imageops::crop_imm(&level, x, y, win_w, win_h).to_image();
                    if let Some(score) = self.score(&window) {
                        if score > self.search.hit_threshold {
                            if let Some(rect) = self.unpad(x, y, scale, image) {
                                hits.push(Hit {
                                    rect,
                                    weight: Some(score),
                                });
                            }
                        }
                    }
                    x += self.search.win_stride.0;
                }
                y += self.search.win_stride.1;
            }
            scale *= self.search.scale;
        }
        suppress_overlaps(hits, OVERLAP_IOU)
    }

    /// Map a window at pyramid coordinates back into the unpadded input.
    fn unpad(&self, x: u32, y: u32, scale: f32, image: &GrayImage) -> Option<Rect> {
        let [win_w, win_h] = self.model.window;
        let left = x as f32 * scale - self.search.padding.0 as f32;
        let top = y as f32 * scale - self.search.padding.1 as f32;
        let right = left + win_w as f32 * scale;
        let bottom = top + win_h as f32 * scale;
        let left = left.max(0.0) as u32;
        let top = top.max(0.0) as u32;
        let right = (right.max(0.0) as u32).min(image.width());
        let bottom = (bottom.max(0.0) as u32).min(image.height());
        Rect::new(left, top, right.checked_sub(left)?, bottom.checked_sub(top)?)
    }
}

impl RegionClassifier for HogPeopleDetector {
    fn name(&self) -> &'static str {
        "hog-people"
    }

    fn classify(&mut self, roi: &GrayImage) -> Vec<Hit> {
        self.detect_multi_scale(roi)
    }
}
