//! TOML configuration.
//!
//! Missing keys take built-in defaults. The file is the explicit `--config`
//! path, or `./emolens.toml` when none is given. CLI flags are applied on top
//! by the binary.

use anyhow::{Context, Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCAL_CONFIG: &str = "emolens.toml";

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub detector: DetectorConfig,
    pub video: VideoConfig,
    pub annotation: AnnotationConfig,
    pub datalog: DatalogConfig,
    pub logging: LoggingConfig,
    pub live: LiveConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body, in MiB.
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_upload_mb: 512,
        }
    }
}

impl ServerConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// ONNX export of the emotion CNN.
    pub classifier: PathBuf,
    /// SeetaFace frontal face cascade.
    pub cascade: PathBuf,
    /// Side length of the square classifier input.
    pub input_size: u32,
    /// `true` for NHWC input (Keras export), `false` for NCHW.
    pub channels_last: bool,
    /// Intra-op threads for the classifier, 0 picks half the cores.
    pub threads: usize,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            classifier: PathBuf::from("models/emotion_cnn.onnx"),
            cascade: PathBuf::from("models/seeta_fd_frontal_v1.0.bin"),
            input_size: 100,
            channels_last: true,
            threads: 0,
        }
    }
}

impl ModelsConfig {
    pub fn thread_count(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }

        (num_cpus::get() / 2).max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub min_face_size: u32,
    pub score_thresh: f64,
    pub pyramid_scale_factor: f32,
    pub slide_window_step: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_face_size: 30,
            score_thresh: 2.0,
            pyramid_scale_factor: 0.8,
            slide_window_step: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub upload_dir: PathBuf,
    pub processed_dir: PathBuf,
    /// Run detection on every Nth frame, reusing the last result in between.
    pub sample_every: u64,
    /// Used when the container does not report a usable frame rate.
    pub default_fps: f64,
    pub codec: String,
    pub allowed_extensions: Vec<String>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("temp_videos_api"),
            processed_dir: PathBuf::from("processed_videos_api"),
            sample_every: 5,
            default_fps: 25.,
            codec: "libx264".to_string(),
            allowed_extensions: ["mp4", "avi", "mov", "webm"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

impl VideoConfig {
    pub fn is_allowed(&self, filename: &str) -> bool {
        let ext = match Path::new(filename).extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.to_ascii_lowercase(),
            None => return false,
        };

        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// TrueType font for labels. The built-in bitmap font is used if unset.
    pub font: Option<PathBuf>,
    pub font_size: f32,
    pub color: [u8; 3],
    pub thickness: u32,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            font: None,
            font_size: 20.,
            color: [0, 255, 0],
            thickness: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatalogConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for DatalogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("logs/emotion_log.csv"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Camera index as the platform backend numbers them.
    pub camera: u32,
    pub fps: u32,
    /// Detection runs on every Nth camera frame.
    pub sample_every: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            camera: 0,
            fps: 30,
            sample_every: 1,
        }
    }
}

impl AppConfig {
    /// Reads `path` if given, otherwise `./emolens.toml` if it exists,
    /// otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let local = Path::new(LOCAL_CONFIG);
                if local.exists() {
                    Self::from_file(local)?
                } else {
                    AppConfig::default()
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());

        Ok(config)
    }

    /// Rejects values the face detector would panic on or the frame loop
    /// cannot use.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if d.min_face_size < 20 {
            return Err(Error::msg(format!(
                "detector.min_face_size must be at least 20, got {}",
                d.min_face_size
            )));
        }
        if !(0.01..=0.99).contains(&d.pyramid_scale_factor) {
            return Err(Error::msg(format!(
                "detector.pyramid_scale_factor must be 0.01-0.99, got {}",
                d.pyramid_scale_factor
            )));
        }
        if d.score_thresh <= 0. {
            return Err(Error::msg(format!(
                "detector.score_thresh must be positive, got {}",
                d.score_thresh
            )));
        }
        if d.slide_window_step == 0 {
            return Err(Error::msg("detector.slide_window_step must be positive"));
        }
        if self.video.sample_every == 0 {
            return Err(Error::msg("video.sample_every must be positive"));
        }
        if self.video.default_fps <= 0. {
            return Err(Error::msg("video.default_fps must be positive"));
        }
        if self.video.allowed_extensions.is_empty() {
            return Err(Error::msg("video.allowed_extensions must not be empty"));
        }
        if self.live.fps == 0 {
            return Err(Error::msg("live.fps must be positive"));
        }
        if self.live.sample_every == 0 {
            return Err(Error::msg("live.sample_every must be positive"));
        }
        if self.models.input_size == 0 {
            return Err(Error::msg("models.input_size must be positive"));
        }
        if self.annotation.thickness == 0 {
            return Err(Error::msg("annotation.thickness must be positive"));
        }
        if self.annotation.font_size <= 0. {
            return Err(Error::msg("annotation.font_size must be positive"));
        }

        Ok(())
    }
}
