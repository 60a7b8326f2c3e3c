use super::FaceLocator;
use crate::config::DetectorConfig;
use crate::shapes::rect::Rect;
use anyhow::{Context, Result};
use image::GrayImage;
use rustface::{Detector, ImageData};
use std::path::Path;
use tracing::{Level, span, trace, warn};

/// SeetaFace funnel-structured cascade, run on the grayscale frame.
///
/// The underlying detector shares state through `Rc`, so it has to stay on
/// the thread that built it.
pub struct CascadeDetector {
    detector: Box<dyn Detector>,
}

impl CascadeDetector {
    pub fn new(model_path: &Path, config: &DetectorConfig) -> Result<CascadeDetector> {
        let path = model_path
            .to_str()
            .context("Cascade model path is not valid UTF-8")?;
        let mut detector = rustface::create_detector(path)
            .with_context(|| format!("Could not load face cascade {}", model_path.display()))?;

        detector.set_min_face_size(config.min_face_size);
        detector.set_score_thresh(config.score_thresh);
        detector.set_pyramid_scale_factor(config.pyramid_scale_factor);
        detector.set_slide_window_step(config.slide_window_step, config.slide_window_step);

        Ok(CascadeDetector { detector })
    }
}

impl FaceLocator for CascadeDetector {
    fn locate(&mut self, gray: &GrayImage) -> Vec<Rect> {
        let span = span!(Level::DEBUG, "face_detector");
        let _guard = span.enter();

        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let mut image = ImageData::new(gray.as_raw(), width, height);
        let faces = self.detector.detect(&mut image);

        let mut results = Vec::with_capacity(faces.len());
        for face in faces {
            let bbox = face.bbox();
            match Rect::clamped(bbox.x(), bbox.y(), bbox.width(), bbox.height(), width, height) {
                Some(bounds) => {
                    trace!("Face at {bounds:?} (score {:.2})", face.score());
                    results.push(bounds);
                }
                None => warn!(
                    "Empty face region at ({}, {}, {}, {}), skipping",
                    bbox.x(),
                    bbox.y(),
                    bbox.width(),
                    bbox.height()
                ),
            }
        }

        trace!("Detected {} faces", results.len());
        results
    }
}
