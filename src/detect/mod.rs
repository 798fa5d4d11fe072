mod backend;
pub mod backends;
mod factory;
mod grouping;
mod result;

pub use backend::{Hit, RegionClassifier, RoiDetector, SecondaryDetector};
pub use factory::{build_secondary, CascadeSettings, DetectType, DetectorSettings, PedestrianSettings};
pub use grouping::{group_rectangles, suppress_overlaps};
pub use result::{DetectionKind, DetectionResult, MotionReport, Rect};
