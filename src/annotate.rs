use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use std::path::Path;
use tracing::{debug, warn};

use crate::config::AnnotationConfig;
use crate::pipeline::Detection;

mod font;

// Gap between the top of a box and the baseline of its label.
const LABEL_OFFSET: i32 = 10;

enum LabelFont {
    TrueType { font: FontVec, scale: PxScale },
    Bitmap { scale: u32 },
}

impl LabelFont {
    fn load(config: &AnnotationConfig) -> LabelFont {
        let bitmap = LabelFont::Bitmap {
            scale: (config.font_size / 10.).round().max(1.) as u32,
        };

        let Some(path) = &config.font else {
            return bitmap;
        };

        match load_font(path) {
            Ok(font) => {
                debug!("Using label font {}", path.display());
                LabelFont::TrueType {
                    font,
                    scale: PxScale::from(config.font_size),
                }
            }
            Err(e) => {
                warn!("{e:?}, falling back to the built-in font");
                bitmap
            }
        }
    }

    fn size(&self, text: &str) -> (u32, u32) {
        match self {
            LabelFont::TrueType { font, scale } => text_size(*scale, font, text),
            LabelFont::Bitmap { scale } => font::text_size(text, *scale),
        }
    }

    fn draw(&self, img: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, text: &str) {
        match self {
            LabelFont::TrueType { font, scale } => {
                draw_text_mut(img, color, x, y, *scale, font, text)
            }
            LabelFont::Bitmap { scale } => font::draw_text_mut(img, color, x, y, *scale, text),
        }
    }
}

fn load_font(path: &Path) -> Result<FontVec> {
    let data = std::fs::read(path)
        .with_context(|| format!("Could not read font {}", path.display()))?;
    FontVec::try_from_vec(data).with_context(|| format!("Invalid font {}", path.display()))
}

/// Draws face boxes and their emotion labels onto frames.
pub struct Annotator {
    font: LabelFont,
    color: Rgb<u8>,
    thickness: u32,
}

impl Annotator {
    pub fn new(config: &AnnotationConfig) -> Annotator {
        Annotator {
            font: LabelFont::load(config),
            color: Rgb(config.color),
            thickness: config.thickness.max(1),
        }
    }

    pub fn annotate(&self, img: &mut RgbImage, detections: &[Detection]) {
        for detection in detections {
            let bounds = detection.bounds;
            for step in 0..self.thickness {
                match bounds.inset(step) {
                    Some(r) => draw_hollow_rect_mut(img, r.into(), self.color),
                    None => break,
                }
            }

            let label = detection.emotion.label();
            let (_, text_h) = self.font.size(label);
            let mut y = bounds.top() as i32 - LABEL_OFFSET - text_h as i32;
            if y < 0 {
                y = (bounds.top() + self.thickness) as i32;
            }

            self.font.draw(img, self.color, bounds.left() as i32, y, label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Emotion;
    use crate::shapes::rect::Rect;

    fn annotator(thickness: u32) -> Annotator {
        Annotator::new(&AnnotationConfig {
            thickness,
            ..AnnotationConfig::default()
        })
    }

    #[test]
    fn test_box_outline_has_thickness() {
        let mut img = RgbImage::new(100, 100);
        let detections = [Detection {
            bounds: Rect::new(20, 40, 40, 40),
            emotion: Emotion::Happy,
        }];

        annotator(2).annotate(&mut img, &detections);

        let green = Rgb([0, 255, 0]);
        assert_eq!(*img.get_pixel(20, 60), green);
        assert_eq!(*img.get_pixel(21, 60), green);
        assert_eq!(*img.get_pixel(22, 60), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(59, 60), green);
        assert_eq!(*img.get_pixel(40, 79), green);
    }

    #[test]
    fn test_label_sits_above_box() {
        let mut img = RgbImage::new(100, 100);
        let detections = [Detection {
            bounds: Rect::new(20, 60, 30, 30),
            emotion: Emotion::Neutral,
        }];

        annotator(1).annotate(&mut img, &detections);

        let labelled = (20..60)
            .flat_map(|x| (0..50).map(move |y| (x, y)))
            .any(|(x, y)| *img.get_pixel(x, y) != Rgb([0, 0, 0]));
        assert!(labelled);
    }

    #[test]
    fn test_label_moves_inside_box_at_top_edge() {
        let mut img = RgbImage::new(100, 100);
        let detections = [Detection {
            bounds: Rect::new(10, 0, 60, 60),
            emotion: Emotion::Sad,
        }];

        annotator(1).annotate(&mut img, &detections);

        let inside = (12..60)
            .flat_map(|x| (2..30).map(move |y| (x, y)))
            .any(|(x, y)| *img.get_pixel(x, y) != Rgb([0, 0, 0]));
        assert!(inside);
    }

    #[test]
    fn test_missing_font_falls_back_to_bitmap() {
        let annotator = Annotator::new(&AnnotationConfig {
            font: Some("does/not/exist.ttf".into()),
            ..AnnotationConfig::default()
        });

        assert!(matches!(annotator.font, LabelFont::Bitmap { scale: 2 }));
    }
}
