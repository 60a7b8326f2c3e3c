use super::EmotionModel;
use super::emotion::Emotion;
use super::model::{Session, initialize_model};
use crate::config::ModelsConfig;
use anyhow::{Error, Result};
use image::{RgbImage, imageops::FilterType};
use ndarray::{Array, Array4};
use ort::value::Tensor;
use tracing::{Level, debug, span};

/// Keras emotion CNN exported to ONNX.
///
/// Model input: one `size` x `size` RGB face scaled to [0, 1], NHWC unless
/// `channels_last` is off. Model output: 7 class scores.
pub struct OnnxClassifier {
    model: Session,
    input_name: String,
    output_name: String,
    size: u32,
    channels_last: bool,
}

impl OnnxClassifier {
    pub fn new(config: &ModelsConfig) -> Result<OnnxClassifier> {
        let model = initialize_model(&config.classifier, config.thread_count())?;

        let input_name = model
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| Error::msg("Classifier has no inputs"))?;
        let output_name = model
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| Error::msg("Classifier has no outputs"))?;
        debug!("Classifier input {input_name:?}, output {output_name:?}");

        Ok(OnnxClassifier {
            model,
            input_name,
            output_name,
            size: config.input_size,
            channels_last: config.channels_last,
        })
    }

    pub fn scores(&mut self, face: &RgbImage) -> Result<Vec<f32>> {
        let span = span!(Level::DEBUG, "emotion_classifier");
        let _guard = span.enter();

        let input = Tensor::from_array(face_tensor(face, self.size, self.channels_last))?;
        let outputs = self
            .model
            .run(ort::inputs![self.input_name.as_str() => input]?)?;
        let scores = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;

        Ok(scores.iter().copied().collect())
    }
}

impl EmotionModel for OnnxClassifier {
    fn classify(&mut self, face: &RgbImage) -> Result<Emotion> {
        let scores = self.scores(face)?;
        let idx = argmax(&scores).ok_or_else(|| Error::msg("Classifier returned no scores"))?;

        Emotion::from_index(idx)
            .ok_or_else(|| Error::msg(format!("Class index {idx} is outside the emotion labels")))
    }
}

/// Resizes `face` to `size` x `size` and lays it out as a batch of one,
/// scaled from [0, 255] to [0, 1].
pub fn face_tensor(face: &RgbImage, size: u32, channels_last: bool) -> Array4<f32> {
    let resized = image::imageops::resize(face, size, size, FilterType::Triangle);
    let s = size as usize;

    if channels_last {
        Array::from_shape_fn((1, s, s, 3), |(_, y, x, c)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.
        })
    } else {
        Array::from_shape_fn((1, 3, s, s), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.
        })
    }
}

/// Index of the largest score. NaN scores never win.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if b >= score => {}
            _ => best = Some((idx, score)),
        }
    }

    best.map(|(idx, _)| idx)
}
