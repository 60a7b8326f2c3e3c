use anyhow::{Context, Error, Result};
use image::RgbImage;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Counts of (actual, predicted) class pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    classes: Vec<String>,
    counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(classes: Vec<String>) -> Self {
        let n = classes.len();
        Self {
            classes,
            counts: vec![vec![0; n]; n],
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn record(&mut self, actual: usize, predicted: usize) {
        self.counts[actual][predicted] += 1;
    }

    pub fn count(&self, actual: usize, predicted: usize) -> u64 {
        self.counts[actual][predicted]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> u64 {
        (0..self.classes.len()).map(|i| self.counts[i][i]).sum()
    }

    /// Fraction of all samples predicted correctly. `None` when empty.
    pub fn accuracy(&self) -> Option<f64> {
        let total = self.total();
        (total > 0).then(|| self.correct() as f64 / total as f64)
    }

    /// Recall of one class. `None` when the class has no samples.
    pub fn class_accuracy(&self, class: usize) -> Option<f64> {
        let row = self.counts.get(class)?;
        let total: u64 = row.iter().sum();
        (total > 0).then(|| row[class] as f64 / total as f64)
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|c| c.len())
            .max()
            .unwrap_or(0)
            .max(6);

        write!(f, "{:width$}", "")?;
        for class in &self.classes {
            write!(f, " {class:>width$}")?;
        }
        writeln!(f)?;

        for (class, row) in self.classes.iter().zip(&self.counts) {
            write!(f, "{class:width$}")?;
            for count in row {
                write!(f, " {count:>width$}")?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct Evaluation {
    pub matrix: ConfusionMatrix,
    /// Images that could not be decoded or classified.
    pub skipped: usize,
}

/// Class directories under `root`, sorted by name. A class's index is its
/// position in this list.
pub fn dataset_classes(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("Could not read dataset {}", root.display()))?;

    let mut classes = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            classes.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    classes.sort_by(|a, b| a.0.cmp(&b.0));

    if classes.is_empty() {
        return Err(Error::msg(format!(
            "{} has no class directories",
            root.display()
        )));
    }

    Ok(classes)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Runs `predict` on every image in the dataset and tallies the results.
/// `predict` returns a class index.
pub fn evaluate<P>(root: &Path, mut predict: P) -> Result<Evaluation>
where
    P: FnMut(&RgbImage) -> Result<usize>,
{
    let classes = dataset_classes(root)?;
    info!(
        "Evaluating {} classes: {:?}",
        classes.len(),
        classes.iter().map(|c| c.0.as_str()).collect::<Vec<_>>()
    );

    let mut matrix = ConfusionMatrix::new(classes.iter().map(|c| c.0.clone()).collect());
    let mut skipped = 0;

    for (actual, (name, dir)) in classes.iter().enumerate() {
        let images = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_image(e.path()));

        let mut seen = 0;
        for entry in images {
            let img = match image::open(entry.path()) {
                Ok(img) => img.into_rgb8(),
                Err(e) => {
                    warn!("Skipping {}: {e}", entry.path().display());
                    skipped += 1;
                    continue;
                }
            };

            match predict(&img) {
                Ok(predicted) if predicted < matrix.classes().len() => {
                    matrix.record(actual, predicted)
                }
                Ok(predicted) => {
                    warn!(
                        "Skipping {}: predicted class {predicted} is not in the dataset",
                        entry.path().display()
                    );
                    skipped += 1;
                }
                Err(e) => {
                    warn!("Skipping {}: {e:?}", entry.path().display());
                    skipped += 1;
                }
            }
            seen += 1;
        }
        debug!("{name}: {seen} images");
    }

    Ok(Evaluation { matrix, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_accuracy() {
        let mut m = ConfusionMatrix::new(vec!["a".into(), "b".into()]);
        assert_eq!(m.accuracy(), None);

        m.record(0, 0);
        m.record(0, 0);
        m.record(0, 1);
        m.record(1, 1);

        assert_eq!(m.total(), 4);
        assert_eq!(m.correct(), 3);
        assert_eq!(m.accuracy(), Some(0.75));
        assert!((m.class_accuracy(0).unwrap() - 2. / 3.).abs() < 1e-9);
        assert_eq!(m.class_accuracy(1), Some(1.));
        assert_eq!(m.class_accuracy(2), None);
    }

    #[test]
    fn test_display_lists_every_class() {
        let mut m = ConfusionMatrix::new(vec!["happy".into(), "sad".into()]);
        m.record(1, 0);
        let table = m.to_string();

        assert_eq!(table.lines().count(), 3);
        assert!(table.lines().nth(2).unwrap().starts_with("sad"));
    }

    #[test]
    fn test_evaluate_uses_sorted_class_dirs() {
        let dir = tempdir().unwrap();
        // Created out of order on purpose.
        for (class, color) in [("2_red", [255, 0, 0]), ("1_green", [0, 255, 0])] {
            let class_dir = dir.path().join(class).join("nested");
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..3 {
                RgbImage::from_pixel(8, 8, Rgb(color))
                    .save(class_dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }
        fs::write(dir.path().join("2_red/broken.jpg"), b"not an image").unwrap();
        fs::write(dir.path().join("2_red/notes.txt"), b"ignored").unwrap();

        let eval = evaluate(dir.path(), |img| {
            Ok(if img.get_pixel(0, 0)[0] > 0 { 1 } else { 0 })
        })
        .unwrap();

        assert_eq!(eval.matrix.classes(), ["1_green", "2_red"]);
        assert_eq!(eval.matrix.count(0, 0), 3);
        assert_eq!(eval.matrix.count(1, 1), 3);
        assert_eq!(eval.matrix.accuracy(), Some(1.));
        assert_eq!(eval.skipped, 1);
    }

    #[test]
    fn test_empty_dataset_fails() {
        let dir = tempdir().unwrap();
        assert!(evaluate(dir.path(), |_| Ok(0)).is_err());
    }
}
