use anyhow::{Context, Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::pipeline::Detection;

pub const HEADER: [&str; 4] = ["timestamp", "source", "emotion", "video_filename"];
const NO_VIDEO: &str = "N/A";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Source {
    Webcam,
    Video,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Source::Webcam => "webcam",
            Source::Video => "video",
        })
    }
}

/// Append-only CSV of every emotion the service has detected.
///
/// Rows from concurrent requests never interleave: all writers go through
/// one lock per log.
pub struct DetectionLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DetectionLog {
    pub fn open(path: impl AsRef<Path>) -> Result<DetectionLog> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Could not create log directory {}", parent.display()))?;
        }

        let is_empty = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if is_empty {
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record(HEADER)?;
            writer.flush()?;
            debug!("Created detection log {}", path.display());
        } else {
            let mut reader = csv::Reader::from_path(&path)?;
            let headers = reader.headers()?;
            if headers.iter().ne(HEADER) {
                return Err(Error::msg(format!(
                    "{} has an unexpected header: {headers:?}",
                    path.display()
                )));
            }
        }

        Ok(DetectionLog {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one row per detection and returns how many were written.
    pub fn append(
        &self,
        source: Source,
        detections: &[Detection],
        video_filename: Option<&str>,
    ) -> Result<usize> {
        if detections.is_empty() {
            return Ok(0);
        }

        let timestamp = chrono::Local::now()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string();
        let source = source.to_string();
        let video_filename = video_filename.unwrap_or(NO_VIDEO);

        let _guard = self.lock.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Could not open {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        for detection in detections {
            writer.write_record([
                timestamp.as_str(),
                source.as_str(),
                detection.emotion.label(),
                video_filename,
            ])?;
        }
        writer.flush()?;

        trace!("Logged {} detections from {source}", detections.len());
        Ok(detections.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Emotion;
    use crate::shapes::rect::Rect;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn detection(emotion: Emotion) -> Detection {
        Detection {
            bounds: Rect::new(0, 0, 10, 10),
            emotion,
        }
    }

    fn rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn test_open_creates_header_and_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/nested/emotion_log.csv");

        DetectionLog::open(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "timestamp,source,emotion,video_filename\n");
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("emotion_log.csv");

        let log = DetectionLog::open(&path).unwrap();
        log.append(Source::Webcam, &[detection(Emotion::Happy)], None)
            .unwrap();
        drop(log);

        DetectionLog::open(&path).unwrap();
        assert_eq!(rows(&path).len(), 1);
    }

    #[test]
    fn test_open_rejects_foreign_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.csv");
        fs::write(&path, "a,b,c\n1,2,3\n").unwrap();

        assert!(DetectionLog::open(&path).is_err());
    }

    #[test]
    fn test_append_writes_one_row_per_detection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("emotion_log.csv");
        let log = DetectionLog::open(&path).unwrap();

        let written = log
            .append(
                Source::Video,
                &[detection(Emotion::Sad), detection(Emotion::Error)],
                Some("clip.mp4"),
            )
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(log.append(Source::Webcam, &[], None).unwrap(), 0);
        log.append(Source::Webcam, &[detection(Emotion::Neutral)], None)
            .unwrap();

        let rows = rows(&path);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][1..], ["video", "SAD", "clip.mp4"]);
        assert_eq!(rows[1][1..], ["video", "Error", "clip.mp4"]);
        assert_eq!(rows[2][1..], ["webcam", "NEUTRAL", "N/A"]);
        assert!(chrono::NaiveDateTime::parse_from_str(&rows[0][0], "%Y-%m-%dT%H:%M:%S%.f").is_ok());
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("emotion_log.csv");
        let log = Arc::new(DetectionLog::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for _ in 0..20 {
                        log.append(
                            Source::Webcam,
                            &[detection(Emotion::Angry), detection(Emotion::Fearful)],
                            None,
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let rows = rows(&path);
        assert_eq!(rows.len(), 8 * 20 * 2);
        assert!(rows.iter().all(|r| r.len() == 4));
    }
}
