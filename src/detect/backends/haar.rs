use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image};
use serde::Deserialize;

use crate::detect::backend::{Hit, RegionClassifier};
use crate::detect::grouping::group_rectangles;
use crate::detect::result::Rect;

/// Boosted Haar-feature cascade, loaded from JSON.
///
/// Every weak classifier is a decision stump over one Haar feature (a weighted sum
/// of rectangle sums inside the training window). A window passes a stage when the
/// stump votes sum to at least the stage threshold; it is a hit when it passes every
/// stage. Stump thresholds are relative to the window's variance normaliser
/// `sqrt(area * sum_sq - sum^2)`.
///
/// ```json
/// { "window": [24, 24],
///   "stages": [ { "threshold": 0.5,
///                 "stumps": [ { "threshold": 0.1, "left": -1.0, "right": 1.0,
///                               "rects": [ { "x": 0, "y": 0, "w": 12, "h": 24, "weight": 1.0 } ] } ] } ] }
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct CascadeModel {
    pub window: [u32; 2],
    pub stages: Vec<Stage>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub stumps: Vec<Stump>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Stump {
    pub rects: Vec<WeightedRect>,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub weight: f32,
}

impl CascadeModel {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read cascade {}", path.display()))?;
        let model: CascadeModel = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid cascade {}: {}", path.display(), e))?;
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        let [ww, wh] = self.window;
        if ww == 0 || wh == 0 {
            return Err(anyhow!("cascade window must be positive, got {:?}", self.window));
        }
        if self.stages.is_empty() {
            return Err(anyhow!("cascade has no stages"));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            for stump in &stage.stumps {
                for r in &stump.rects {
                    if r.w == 0 || r.h == 0 || r.x + r.w > ww || r.y + r.h > wh {
                        return Err(anyhow!(
                            "cascade stage {} has feature rect {:?} outside window {:?}",
                            i,
                            r,
                            self.window
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Multi-scale search parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeSearchConfig {
    /// Window growth per scale step, > 1.
    pub scale_factor: f32,
    /// Raw hits a grouped detection needs beyond itself; 0 disables grouping.
    pub min_neighbors: u32,
}

impl Default for CascadeSearchConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 3,
        }
    }
}

type IntegralImage = ImageBuffer<Luma<u64>, Vec<u64>>;

/// Summed-area tables of one image. Both are one pixel larger than the source.
struct Integrals {
    sum: IntegralImage,
    squared: IntegralImage,
}

impl Integrals {
    fn new(image: &GrayImage) -> Self {
        Self {
            sum: integral_image::<_, u64>(image),
            squared: integral_squared_image::<_, u64>(image),
        }
    }

    fn area_sum(table: &IntegralImage, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let at = |px: u32, py: u32| table.get_pixel(px, py)[0];
        (at(x + w, y + h) + at(x, y)) - (at(x + w, y) + at(x, y + h))
    }

    fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        Self::area_sum(&self.sum, x, y, w, h) as f64
    }

    fn rect_sum_squared(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        Self::area_sum(&self.squared, x, y, w, h) as f64
    }
}

/// Viola-Jones style cascade classifier.
pub struct HaarCascade {
    model: CascadeModel,
    search: CascadeSearchConfig,
}

impl HaarCascade {
    pub fn new(model: CascadeModel, search: CascadeSearchConfig) -> Result<Self> {
        model.validate()?;
        if search.scale_factor <= 1.0 {
            return Err(anyhow!(
                "cascade scale_factor must be > 1, got {}",
                search.scale_factor
            ));
        }
        Ok(Self { model, search })
    }

    pub fn from_file(path: &Path, search: CascadeSearchConfig) -> Result<Self> {
        Self::new(CascadeModel::from_file(path)?, search)
    }

    /// Find objects at every scale and group the raw hits.
    pub fn detect_multi_scale(&self, image: &GrayImage) -> Vec<Rect> {
        let [win_w, win_h] = self.model.window;
        let (width, height) = image.dimensions();
        if width < win_w || height < win_h {
            return Vec::new();
        }
        let integrals = Integrals::new(image);

        let mut raw = Vec::new();
        let mut scale = 1.0f32;
        loop {
            let w = (win_w as f32 * scale).round() as u32;
            let h = (win_h as f32 * scale).round() as u32;
            if w > width || h > height {
                break;
            }
            let step = (scale.round() as u32).max(1);
            let mut y = 0;
            while y + h <= height {
                let mut x = 0;
                while x + w <= width {
                    if self.passes(&integrals, x, y, w, h, scale) {
                        if let Some(rect) = Rect::new(x, y, w, h) {
                            raw.push(rect);
                        }
                    }
                    x += step;
                }
                y += step;
            }
            scale *= self.search.scale_factor;
        }
        group_rectangles(&raw, self.search.min_neighbors)
    }

    fn passes(&self, integrals: &Integrals, x: u32, y: u32, w: u32, h: u32, scale: f32) -> bool {
        let area = (w as f64) * (h as f64);
        let sum = integrals.rect_sum(x, y, w, h);
        let sum_sq = integrals.rect_sum_squared(x, y, w, h);
        let variance = area * sum_sq - sum * sum;
        let norm = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        self.model.stages.iter().all(|stage| {
            let votes: f32 = stage
                .stumps
                .iter()
                .map(|stump| {
                    let value: f64 = stump
                        .rects
                        .iter()
                        .map(|r| {
                            let (rx, ry, rw, rh) = scale_rect(r, scale, w, h);
                            r.weight as f64 * integrals.rect_sum(x + rx, y + ry, rw, rh)
                        })
                        .sum();
                    if value < stump.threshold as f64 * norm {
                        stump.left
                    } else {
                        stump.right
                    }
                })
                .sum();
            votes >= stage.threshold
        })
    }
}

/// Scale a feature rectangle, keeping it inside the scaled window.
fn scale_rect(r: &WeightedRect, scale: f32, win_w: u32, win_h: u32) -> (u32, u32, u32, u32) {
    let rx = ((r.x as f32 * scale).round() as u32).min(win_w - 1);
    let ry = ((r.y as f32 * scale).round() as u32).min(win_h - 1);
    let rw = ((r.w as f32 * scale).round() as u32).clamp(1, win_w - rx);
    let rh = ((r.h as f32 * scale).round() as u32).clamp(1, win_h - ry);
    (rx, ry, rw, rh)
}

impl RegionClassifier for HaarCascade {
    fn name(&self) -> &'static str {
        "haar-cascade"
    }

    fn classify(&mut self, roi: &GrayImage) -> Vec<Hit> {
        self.detect_multi_scale(roi)
            .into_iter()
            .map(|rect| Hit { rect, weight: None })
            .collect()
    }
}
