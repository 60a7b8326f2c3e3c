use anyhow::Result;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::Router;
use image::{GrayImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::io::Cursor;
use std::path::Path;
use tempfile::{TempDir, tempdir};
use tower::ServiceExt;

use emolens::config::AppConfig;
use emolens::pipeline::{Emotion, EmotionModel, FaceLocator, Pipeline};
use emolens::server::{AppState, router};
use emolens::shapes::rect::Rect;
use emolens::worker::InferenceWorker;

const BOUNDARY: &str = "emolens-test-boundary";

/// Reports one face covering the middle of the frame.
struct CenterFace;

impl FaceLocator for CenterFace {
    fn locate(&mut self, gray: &GrayImage) -> Vec<Rect> {
        let (w, h) = gray.dimensions();
        vec![Rect::new(w / 4, h / 4, w / 2, h / 2)]
    }
}

struct AlwaysHappy;

impl EmotionModel for AlwaysHappy {
    fn classify(&mut self, _face: &RgbImage) -> Result<Emotion> {
        Ok(Emotion::Happy)
    }
}

fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.video.upload_dir = dir.join("uploads");
    config.video.processed_dir = dir.join("processed");
    config.datalog.path = dir.join("logs/emotion_log.csv");
    config
}

fn test_app(with_model: bool) -> (Router, TempDir) {
    let dir = tempdir().unwrap();
    let worker = with_model.then(|| {
        InferenceWorker::spawn(|| Ok(Pipeline::new(Box::new(CenterFace), Box::new(AlwaysHappy))))
            .unwrap()
    });
    let state = AppState::new(&test_config(dir.path()), worker).unwrap();

    (router(state), dir)
}

fn multipart(uri: &str, filename: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([120, 80, 60]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn log_rows(dir: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(dir.join("logs/emotion_log.csv")).unwrap();
    reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect()
}

#[tokio::test]
async fn test_health_reports_model_state() {
    let (app, _dir) = test_app(true);
    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["model_loaded"], true);

    let (app, _dir) = test_app(false);
    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(json_body(response).await["model_loaded"], false);
}

#[tokio::test]
async fn test_predict_webcam_returns_annotated_jpeg() {
    let (app, dir) = test_app(true);

    let response = app
        .oneshot(multipart("/predict_webcam", "frame.png", &png(80, 60)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let img = image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg).unwrap();
    assert_eq!((img.width(), img.height()), (80, 60));

    let rows = log_rows(dir.path());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][1..], ["webcam", "HAPPY", "N/A"]);
}

#[tokio::test]
async fn test_predict_webcam_rejects_undecodable_image() {
    let (app, dir) = test_app(true);

    let response = app
        .oneshot(multipart("/predict_webcam", "frame.jpg", b"definitely not a jpeg"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await["detail"],
        "Could not decode image from received data."
    );
    assert!(log_rows(dir.path()).is_empty());
}

#[tokio::test]
async fn test_predict_webcam_without_model() {
    let (app, _dir) = test_app(false);

    let response = app
        .oneshot(multipart("/predict_webcam", "frame.png", &png(10, 10)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_predict_video_rejects_extension() {
    let (app, dir) = test_app(true);

    let response = app
        .oneshot(multipart("/predict_video", "clip.gif", b"GIF89a"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await["detail"],
        "Invalid video file type. Please upload MP4, AVI, MOV, or WebM."
    );
    assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_predict_video_unreadable_upload_is_cleaned_up() {
    let (app, dir) = test_app(true);

    let response = app
        .oneshot(multipart("/predict_video", "clip.MP4", b"not really a video"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json_body(response).await["detail"],
        "Could not open video file: clip.MP4"
    );
    assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
    assert_eq!(std::fs::read_dir(dir.path().join("processed")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_download_video() {
    let (app, dir) = test_app(true);
    let id = uuid::Uuid::new_v4();
    std::fs::write(dir.path().join(format!("processed/{id}.mp4")), b"mp4 bytes").unwrap();

    let response = app
        .clone()
        .oneshot(get(&format!("/download_video/{id}.mp4")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"mp4 bytes");

    let missing = uuid::Uuid::new_v4();
    let response = app
        .clone()
        .oneshot(get(&format!("/download_video/{missing}.mp4")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["detail"], "Processed video not found.");

    let response = app
        .oneshot(get("/download_video/..%2Flogs%2Femotion_log.csv"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cors_allows_any_origin() {
    let (app, _dir) = test_app(true);

    let request = Request::builder()
        .uri("/")
        .header(header::ORIGIN, "http://example.com")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}
