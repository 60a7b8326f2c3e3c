use anyhow::Result;
use image::{GrayImage, RgbImage};
use serde::Serialize;
use tracing::{Level, error, span, trace};

use crate::config::AppConfig;
use crate::shapes::rect::Rect;
pub use classifier::OnnxClassifier;
pub use detection::CascadeDetector;
pub use emotion::Emotion;

pub mod classifier;
mod detection;
mod emotion;
mod model;

/// Finds face boxes on a grayscale frame.
pub trait FaceLocator {
    fn locate(&mut self, gray: &GrayImage) -> Vec<Rect>;
}

/// Classifies a cropped colour face.
pub trait EmotionModel {
    fn classify(&mut self, face: &RgbImage) -> Result<Emotion>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub bounds: Rect,
    pub emotion: Emotion,
}

pub struct Pipeline {
    face_locator: Box<dyn FaceLocator>,
    classifier: Box<dyn EmotionModel>,
}

impl Pipeline {
    pub fn new(face_locator: Box<dyn FaceLocator>, classifier: Box<dyn EmotionModel>) -> Pipeline {
        Pipeline {
            face_locator,
            classifier,
        }
    }

    /// Loads the cascade and classifier named in `config`.
    pub fn from_config(config: &AppConfig) -> Result<Pipeline> {
        let face_locator = CascadeDetector::new(&config.models.cascade, &config.detector)?;
        let classifier = OnnxClassifier::new(&config.models)?;

        Ok(Pipeline::new(Box::new(face_locator), Box::new(classifier)))
    }

    /// Detects faces and labels each one. A face whose classification fails
    /// is kept with `Emotion::Error`.
    pub fn run(&mut self, frame: &RgbImage) -> Vec<Detection> {
        let span = span!(Level::DEBUG, "pipeline");
        let _guard = span.enter();

        if frame.width() == 0 || frame.height() == 0 {
            return Vec::new();
        }

        let gray = image::imageops::grayscale(frame);
        let mut detections = Vec::new();
        for bounds in self.face_locator.locate(&gray) {
            if bounds.is_empty() {
                continue;
            }
            let face =
                image::imageops::crop_imm(frame, bounds.x, bounds.y, bounds.w, bounds.h).to_image();
            if face.width() == 0 || face.height() == 0 {
                continue;
            }

            let emotion = match self.classifier.classify(&face) {
                Ok(emotion) => emotion,
                Err(e) => {
                    error!("Error during prediction for face {bounds:?}: {e:?}");
                    Emotion::Error
                }
            };
            trace!("{bounds:?} -> {emotion}");

            detections.push(Detection { bounds, emotion });
        }

        detections
    }
}
