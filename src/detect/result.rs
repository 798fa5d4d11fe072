/// Axis-aligned rectangle in pixel coordinates of whichever image it was computed
/// against (resized detection image or full frame). Width and height are never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    /// Returns `None` for empty rectangles.
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Option<Self> {
        (w > 0 && h > 0).then_some(Self { x, y, w, h })
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    /// Strict containment: every edge of `self` lies strictly inside `other`.
    /// Not reflexive, so a rectangle is never inside itself.
    pub fn inside(&self, other: &Rect) -> bool {
        self.x > other.x
            && self.y > other.y
            && self.right() < other.right()
            && self.bottom() < other.bottom()
    }

    pub fn offset(&self, dx: u32, dy: u32) -> Rect {
        Rect {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    /// Scale from a resized image back to full-frame coordinates.
    pub fn scale(&self, mul_w: u32, mul_h: u32) -> Rect {
        Rect {
            x: self.x * mul_w,
            y: self.y * mul_h,
            w: self.w * mul_w,
            h: self.h * mul_h,
        }
    }

    /// Intersect with an image of the given size.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.w.min(width - self.x);
        let h = self.h.min(height - self.y);
        Rect::new(self.x, self.y, w, h)
    }

    /// Intersection over union.
    pub fn iou(&self, other: &Rect) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0.0;
        }
        let inter = (right - left) as u64 * (bottom - top) as u64;
        let union = self.area() + other.area() - inter;
        inter as f32 / union as f32
    }
}

/// What produced a detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DetectionKind {
    Motion,
    Pedestrian,
    Cascade,
    Face,
}

impl DetectionKind {
    /// Tag used in file and directory names.
    pub fn tag(&self) -> &'static str {
        match self {
            DetectionKind::Motion => "motion",
            DetectionKind::Pedestrian => "pedestrian",
            DetectionKind::Cascade => "cascade",
            DetectionKind::Face => "face",
        }
    }
}

/// One hit from a secondary detector.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionResult {
    /// Hit rectangle, local to `roi`.
    pub region: Rect,
    /// Candidate motion region the hit was found in (detection image coordinates).
    pub roi: Rect,
    pub kind: DetectionKind,
    /// Classifier score, when the classifier provides one.
    pub weight: Option<f32>,
}

impl DetectionResult {
    /// Hit rectangle in full-frame coordinates.
    pub fn frame_region(&self, mul_w: u32, mul_h: u32) -> Rect {
        self.region.offset(self.roi.x, self.roi.y).scale(mul_w, mul_h)
    }
}

/// Output of one motion detector pass.
#[derive(Clone, Debug)]
pub struct MotionReport {
    /// Binary mask after dilate/erode.
    pub mask: image::GrayImage,
    /// Percentage of changed pixels, always within `[0, 100]`.
    pub motion_percent: f32,
    /// Filtered candidate regions (detection image coordinates).
    pub regions: Vec<Rect>,
    /// The background model was reset because the change exceeded the maximum.
    pub background_reset: bool,
}
