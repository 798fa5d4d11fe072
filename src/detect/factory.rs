use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::detect::backend::{RoiDetector, SecondaryDetector};
use crate::detect::backends::{
    CascadeSearchConfig, HaarCascade, HogPeopleDetector, HogSearchConfig, PEDESTRIAN_MIN_SIZE,
};
use crate::detect::result::DetectionKind;

/// Which secondary detector runs on motion regions. Chosen once at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum DetectType {
    /// Motion only.
    #[default]
    Motion,
    Pedestrian,
    Cascade,
    Face,
}

impl FromStr for DetectType {
    type Err = anyhow::Error;

    /// Accepts full names and the single-letter codes `m`, `p`, `h`, `f`.
    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "motion" | "m" | "none" => Ok(DetectType::Motion),
            "pedestrian" | "p" => Ok(DetectType::Pedestrian),
            "cascade" | "h" => Ok(DetectType::Cascade),
            "face" | "f" => Ok(DetectType::Face),
            other => Err(anyhow!(
                "unknown detect type '{}'; expected motion, pedestrian, cascade or face",
                other
            )),
        }
    }
}

impl TryFrom<String> for DetectType {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Pedestrian (HOG + linear SVM) settings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PedestrianSettings {
    pub model_path: Option<PathBuf>,
    pub search: HogSearchConfig,
}

/// Haar cascade settings, shared by the cascade and face detectors.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeSettings {
    pub cascade_file: Option<PathBuf>,
    pub search: CascadeSearchConfig,
    pub min_width: u32,
    pub min_height: u32,
}

impl CascadeSettings {
    pub fn cascade_defaults() -> Self {
        Self {
            cascade_file: None,
            search: CascadeSearchConfig {
                scale_factor: 1.3,
                min_neighbors: 0,
            },
            min_width: 20,
            min_height: 20,
        }
    }

    pub fn face_defaults() -> Self {
        Self {
            cascade_file: None,
            search: CascadeSearchConfig {
                scale_factor: 1.3,
                min_neighbors: 5,
            },
            min_width: 16,
            min_height: 16,
        }
    }
}

/// Everything needed to construct the secondary detector.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
    pub detect_type: DetectType,
    pub pedestrian: PedestrianSettings,
    pub cascade: CascadeSettings,
    pub face: CascadeSettings,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            detect_type: DetectType::Motion,
            pedestrian: PedestrianSettings::default(),
            cascade: CascadeSettings::cascade_defaults(),
            face: CascadeSettings::face_defaults(),
        }
    }
}

/// Build the configured secondary detector, or `None` for motion-only operation.
///
/// Model files are loaded here, so a missing or malformed model fails at startup.
pub fn build_secondary(settings: &DetectorSettings) -> Result<Option<Box<dyn SecondaryDetector>>> {
    let detector: Box<dyn SecondaryDetector> = match settings.detect_type {
        DetectType::Motion => return Ok(None),
        DetectType::Pedestrian => {
            let path = settings
                .pedestrian
                .model_path
                .as_deref()
                .ok_or_else(|| anyhow!("pedestrian detection requires pedestrian.model_path"))?;
            let classifier = HogPeopleDetector::from_file(path, settings.pedestrian.search.clone())
                .with_context(|| format!("load pedestrian model {}", path.display()))?;
            Box::new(RoiDetector::new(
                DetectionKind::Pedestrian,
                PEDESTRIAN_MIN_SIZE,
                classifier,
            ))
        }
        DetectType::Cascade => Box::new(cascade_detector(DetectionKind::Cascade, &settings.cascade)?),
        DetectType::Face => Box::new(cascade_detector(DetectionKind::Face, &settings.face)?),
    };
    log::info!(
        "secondary detector: {:?}, min region {:?}",
        detector.kind(),
        detector.min_size()
    );
    Ok(Some(detector))
}

fn cascade_detector(kind: DetectionKind, settings: &CascadeSettings) -> Result<RoiDetector<HaarCascade>> {
    let path = settings
        .cascade_file
        .as_deref()
        .ok_or_else(|| anyhow!("{} detection requires a cascade_file", kind.tag()))?;
    let classifier = HaarCascade::from_file(path, settings.search.clone())
        .with_context(|| format!("load {} cascade {}", kind.tag(), path.display()))?;
    Ok(RoiDetector::new(
        kind,
        (settings.min_width, settings.min_height),
        classifier,
    ))
}
