use image::{GrayImage, RgbImage};

use crate::detect::result::{DetectionKind, DetectionResult, Rect};

/// A classifier hit inside a region of interest, in ROI-local coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hit {
    pub rect: Rect,
    pub weight: Option<f32>,
}

/// Object classifier run on cropped grayscale regions.
///
/// Classifiers never fail on image data: anything they cannot evaluate (a crop
/// smaller than their window, for example) simply yields no hits.
pub trait RegionClassifier: Send {
    /// Classifier identifier for logs.
    fn name(&self) -> &'static str;

    fn classify(&mut self, roi: &GrayImage) -> Vec<Hit>;
}

/// Confirms or refines motion regions.
pub trait SecondaryDetector: Send {
    fn kind(&self) -> DetectionKind;

    /// Regions must be strictly wider and taller than this to be classified.
    fn min_size(&self) -> (u32, u32);

    /// Classify each sufficiently large candidate region of `image`.
    fn detect(&mut self, regions: &[Rect], image: &RgbImage) -> Vec<DetectionResult>;
}

/// Secondary detector that crops each candidate region and hands it to a classifier.
pub struct RoiDetector<C> {
    kind: DetectionKind,
    min_width: u32,
    min_height: u32,
    classifier: C,
}

impl<C: RegionClassifier> RoiDetector<C> {
    pub fn new(kind: DetectionKind, min_size: (u32, u32), classifier: C) -> Self {
        Self {
            kind,
            min_width: min_size.0,
            min_height: min_size.1,
            classifier,
        }
    }

    /// Cheap rejection before the classifier runs.
    pub fn accepts(&self, region: &Rect) -> bool {
        region.w > self.min_width && region.h > self.min_height
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }
}

impl<C: RegionClassifier> SecondaryDetector for RoiDetector<C> {
    fn kind(&self) -> DetectionKind {
        self.kind
    }

    fn min_size(&self) -> (u32, u32) {
        (self.min_width, self.min_height)
    }

    fn detect(&mut self, regions: &[Rect], image: &RgbImage) -> Vec<DetectionResult> {
        let candidates: Vec<Rect> = regions
            .iter()
            .filter(|region| self.accepts(region))
            .filter_map(|region| region.clamp_to(image.width(), image.height()))
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let gray = image::imageops::grayscale(image);
        let mut results = Vec::new();
        for roi in candidates {
            let crop = image::imageops::crop_imm(&gray, roi.x, roi.y, roi.w, roi.h).to_image();
            let hits = self.classifier.classify(&crop);
            if !hits.is_empty() {
                log::debug!(
                    "{} found {} hit(s) in region {:?}",
                    self.classifier.name(),
                    hits.len(),
                    roi
                );
            }
            results.extend(hits.into_iter().map(|hit| DetectionResult {
                region: hit.rect,
                roi,
                kind: self.kind,
                weight: hit.weight,
            }));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every crop size it sees and reports one hit per crop.
    struct RecordingClassifier {
        seen: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl RegionClassifier for RecordingClassifier {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn classify(&mut self, roi: &GrayImage) -> Vec<Hit> {
            self.seen.lock().unwrap().push(roi.dimensions());
            vec![Hit {
                rect: Rect::new(1, 2, 3, 4).unwrap(),
                weight: Some(0.5),
            }]
        }
    }

    fn pedestrian_detector() -> (RoiDetector<RecordingClassifier>, Arc<Mutex<Vec<(u32, u32)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let detector = RoiDetector::new(
            DetectionKind::Pedestrian,
            (63, 127),
            RecordingClassifier { seen: seen.clone() },
        );
        (detector, seen)
    }

    #[test]
    fn small_regions_never_reach_classifier() {
        let (mut detector, seen) = pedestrian_detector();
        let image = RgbImage::new(320, 240);
        let results = detector.detect(&[Rect::new(0, 0, 30, 30).unwrap()], &image);
        assert!(results.is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn large_regions_reach_classifier() {
        let (mut detector, seen) = pedestrian_detector();
        let image = RgbImage::new(320, 240);
        let roi = Rect::new(0, 0, 70, 140).unwrap();
        let results = detector.detect(&[roi], &image);
        assert_eq!(*seen.lock().unwrap(), vec![(70, 140)]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].roi, roi);
        assert_eq!(results[0].kind, DetectionKind::Pedestrian);
        assert_eq!(results[0].weight, Some(0.5));
        assert_eq!(results[0].region, Rect::new(1, 2, 3, 4).unwrap());
    }

    #[test]
    fn gate_is_strict() {
        let (detector, _) = pedestrian_detector();
        assert!(!detector.accepts(&Rect::new(0, 0, 63, 200).unwrap()));
        assert!(!detector.accepts(&Rect::new(0, 0, 100, 127).unwrap()));
        assert!(detector.accepts(&Rect::new(0, 0, 64, 128).unwrap()));
    }

    #[test]
    fn regions_are_clamped_to_image() {
        let (mut detector, seen) = pedestrian_detector();
        let image = RgbImage::new(100, 150);
        detector.detect(&[Rect::new(20, 20, 90, 140).unwrap()], &image);
        assert_eq!(*seen.lock().unwrap(), vec![(80, 130)]);
    }
}
