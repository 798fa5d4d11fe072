pub mod haar;
pub mod hog;

pub use haar::{CascadeModel, CascadeSearchConfig, HaarCascade};
pub use hog::{HogModel, HogPeopleDetector, HogSearchConfig, PEDESTRIAN_MIN_SIZE};
