use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::{ImageFormat, RgbImage};
use serde_json::{Value, json};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::annotate::Annotator;
use crate::config::{AppConfig, VideoConfig};
use crate::datalog::{DetectionLog, Source};
use crate::error::{AppError, AppResult};
use crate::pipeline::{Detection, Pipeline};
use crate::video;
use crate::worker::InferenceWorker;

const INVALID_VIDEO_TYPE: &str = "Invalid video file type. Please upload MP4, AVI, MOV, or WebM.";
const VIDEO_NOT_FOUND: &str = "Processed video not found.";
const NO_FILE: &str = "No file uploaded.";

#[derive(Clone)]
pub struct AppState {
    /// `None` when the models failed to load. Prediction endpoints answer 503.
    worker: Option<InferenceWorker>,
    annotator: Arc<Annotator>,
    log: Option<Arc<DetectionLog>>,
    video: Arc<VideoConfig>,
    upload_limit: usize,
}

impl AppState {
    /// Creates the upload and output directories and opens the detection log.
    pub fn new(config: &AppConfig, worker: Option<InferenceWorker>) -> anyhow::Result<AppState> {
        for dir in [&config.video.upload_dir, &config.video.processed_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Could not create {}", dir.display()))?;
        }

        let log = if config.datalog.enabled {
            let log = DetectionLog::open(&config.datalog.path)?;
            info!("Logging detections to {}", log.path().display());
            Some(Arc::new(log))
        } else {
            None
        };

        Ok(AppState {
            worker,
            annotator: Arc::new(Annotator::new(&config.annotation)),
            log,
            video: Arc::new(config.video.clone()),
            upload_limit: config.server.max_upload_bytes(),
        })
    }

    fn worker(&self) -> AppResult<InferenceWorker> {
        self.worker
            .clone()
            .filter(InferenceWorker::is_alive)
            .ok_or(AppError::ModelUnavailable)
    }

    fn log_detections(&self, source: Source, detections: &[Detection], video: Option<&str>) {
        if let Some(log) = &self.log {
            if let Err(e) = log.append(source, detections, video) {
                warn!("Could not log detections: {e:?}");
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    let upload_limit = state.upload_limit;

    Router::new()
        .route("/", get(root))
        .route("/predict_webcam", post(predict_webcam))
        .route("/predict_video", post(predict_video))
        .route("/download_video/{video_file_name}", get(download_video))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Loads the models, binds the configured address and serves until Ctrl-C.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let worker = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            InferenceWorker::spawn(move || Pipeline::from_config(&config))
        })
        .await?
    };
    let worker = match worker {
        Ok(worker) => Some(worker),
        Err(e) => {
            error!("Could not load the emotion models, prediction is disabled: {e:?}");
            None
        }
    };

    let app = router(AppState::new(&config, worker)?);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Could not bind {addr}"))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for Ctrl-C: {e}");
        return std::future::pending().await;
    }
    info!("Shutting down");
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": "Emotion Recognition API is running.",
        "model_loaded": state.worker.as_ref().is_some_and(InferenceWorker::is_alive),
    }))
}

async fn predict_webcam(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Response> {
    let data = file_field(&mut multipart).await?;
    let worker = state.worker()?;

    let mut frame = image::load_from_memory(&data)
        .map_err(|e| {
            debug!("Undecodable upload: {e}");
            AppError::BadRequest("Could not decode image from received data.".to_string())
        })?
        .into_rgb8();

    let detections = worker.detect(frame.clone()).await?;
    debug!("Webcam frame: {} faces", detections.len());
    state.log_detections(Source::Webcam, &detections, None);

    state.annotator.annotate(&mut frame, &detections);
    let jpeg = encode_jpeg(&frame)?;

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

async fn predict_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    let id = Uuid::new_v4().to_string();

    let mut upload = None;
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if !state.video.is_allowed(&filename) {
            return Err(AppError::BadRequest(INVALID_VIDEO_TYPE.to_string()));
        }
        let worker = state.worker()?;

        let temp = save_upload(&mut field, &state.video.upload_dir, &id, &filename).await?;
        upload = Some((filename, temp, worker));
        break;
    }
    let Some((filename, temp, worker)) = upload else {
        return Err(AppError::BadRequest(NO_FILE.to_string()));
    };

    let output = state.video.processed_dir.join(format!("{id}.mp4"));
    info!("Processing {filename} into {}", output.display());

    let input = temp.path.clone();
    let job_state = state.clone();
    let job = tokio::task::spawn_blocking(move || -> AppResult<video::VideoSummary> {
        let config = &job_state.video;
        let info = video::probe(&input, config.default_fps).map_err(|e| {
            warn!("Could not probe {filename}: {e:?}");
            AppError::VideoOpen(filename.clone())
        })?;
        info!(
            "{filename}: {}x{} at {:.2} fps ({})",
            info.width, info.height, info.fps, info.codec
        );

        video::process_video(
            &input,
            &info,
            &output,
            config,
            |frame| worker.detect_blocking(frame.clone()),
            &job_state.annotator,
            |_, detections| job_state.log_detections(Source::Video, detections, Some(&filename)),
        )
        .map_err(|e| AppError::Processing(format!("{e:#}")))
    });

    let summary = job.await.map_err(|e| AppError::Internal(e.into()))??;
    drop(temp);
    info!(
        "Finished video {id}: {} frames, {} sampled, {} faces",
        summary.frames, summary.sampled, summary.detections
    );

    Ok(Json(json!({
        "message": "Video processed successfully.",
        "processed_video_id": id,
        "download_url": format!("/download_video/{id}.mp4"),
    })))
}

async fn download_video(
    State(state): State<AppState>,
    Path(video_file_name): Path<String>,
) -> AppResult<Response> {
    if !is_processed_name(&video_file_name) {
        return Err(AppError::NotFound(VIDEO_NOT_FOUND.to_string()));
    }

    let path = state.video.processed_dir.join(&video_file_name);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(VIDEO_NOT_FOUND.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{video_file_name}\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// Only `<uuid>.mp4` names are served, which keeps requests inside the
/// processed directory.
fn is_processed_name(name: &str) -> bool {
    name.strip_suffix(".mp4")
        .and_then(|stem| Uuid::try_parse(stem).ok().map(|id| (stem, id)))
        .is_some_and(|(stem, id)| id.hyphenated().to_string() == stem)
}

async fn file_field(multipart: &mut Multipart) -> AppResult<Bytes> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            return Ok(field.bytes().await?);
        }
    }

    Err(AppError::BadRequest(NO_FILE.to_string()))
}

/// Upload on disk for the duration of a request, removed on drop.
struct TempUpload {
    path: PathBuf,
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {e}", self.path.display()),
        }
    }
}

async fn save_upload(
    field: &mut Field<'_>,
    dir: &std::path::Path,
    id: &str,
    filename: &str,
) -> AppResult<TempUpload> {
    // Drop any directory part the client sent along with the name.
    let name = std::path::Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = TempUpload {
        path: dir.join(format!("{id}_{name}")),
    };

    let mut file = tokio::fs::File::create(&temp.path).await?;
    let mut size = 0;
    while let Some(chunk) = field.chunk().await? {
        size += chunk.len();
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    debug!("Saved {size} bytes to {}", temp.path.display());

    Ok(temp)
}

fn encode_jpeg(frame: &RgbImage) -> AppResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    frame
        .write_to(&mut buf, ImageFormat::Jpeg)
        .context("Failed to encode processed image.")?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processed_names() {
        let id = Uuid::new_v4();
        assert!(is_processed_name(&format!("{id}.mp4")));
        assert!(!is_processed_name(&format!("{id}.avi")));
        assert!(!is_processed_name(&format!("{}.mp4", id.simple())));
        assert!(!is_processed_name("../secret.mp4"));
        assert!(!is_processed_name("..%2F..%2Fetc%2Fpasswd"));
        assert!(!is_processed_name(".mp4"));
    }

    #[test]
    fn test_encode_jpeg() {
        let jpeg = encode_jpeg(&RgbImage::new(16, 16)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
