//! Live camera mode: frames from a local camera are annotated and shown in
//! an `ffplay` window until the window or the camera goes away.

use anyhow::{Context, Error, Result};
use image::{EncodableLayout, RgbImage};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::{Camera, nokhwa_initialize, query};
use std::io::{ErrorKind, Write};
use std::process::{Child, Command, Stdio};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::annotate::Annotator;
use crate::config::AppConfig;
use crate::pipeline::{Detection, Pipeline};
use crate::video::{self, FrameSampler, FrameSink, FrameSource};
use crate::worker::InferenceWorker;

/// The viewer was closed. Ends live mode without an error.
#[derive(Debug, thiserror::Error)]
#[error("Display window was closed")]
pub struct DisplayClosed;

pub struct CameraSource {
    camera: Camera,
}

impl CameraSource {
    pub fn open(index: u32, fps: u32) -> Result<Self> {
        nokhwa_initialize(|granted| {
            debug!("Camera access granted: {granted}");
        });

        match query(ApiBackend::Auto) {
            Ok(cameras) => cameras
                .iter()
                .for_each(|cam| debug!("Found camera: {:?}", cam)),
            Err(e) => warn!("Could not list cameras: {e}"),
        }

        let mut camera = Camera::new(
            CameraIndex::Index(index),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        )
        .with_context(|| format!("Could not open camera {index}"))?;

        if let Err(e) = camera.set_frame_rate(fps) {
            warn!("Camera refused {fps} fps: {e}");
        }
        camera
            .open_stream()
            .context("Could not start the camera stream")?;

        let resolution = camera.resolution();
        info!(
            "Camera {index} ({}): {}x{} at {} fps",
            camera.info().human_name(),
            resolution.width(),
            resolution.height(),
            camera.frame_rate()
        );

        Ok(Self { camera })
    }
}

impl FrameSource for CameraSource {
    /// A failed capture ends the stream. Undecodable frames are errors.
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let buffer = match self.camera.frame() {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Could not capture frame: {e}");
                return Ok(None);
            }
        };

        let frame = buffer
            .decode_image::<RgbFormat>()
            .context("Could not decode camera frame")?;
        Ok(Some(frame))
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            warn!("Could not stop camera stream: {e}");
        }
    }
}

fn ffplay_args(width: u32, height: u32, fps: u32) -> Vec<String> {
    let size = format!("{width}x{height}");
    let fps = fps.to_string();
    [
        "-f",
        "rawvideo",
        "-pixel_format",
        "rgb24",
        "-video_size",
        size.as_str(),
        "-framerate",
        fps.as_str(),
        "-fflags",
        "nobuffer",
        "-flags",
        "low_delay",
        "-autoexit",
        "-window_title",
        "emolens",
        "-",
    ]
    .iter()
    .map(|a| a.to_string())
    .collect()
}

/// `ffplay` window fed raw RGB frames. The window opens on the first frame
/// and takes its size.
pub struct FfplayWindow {
    fps: u32,
    ffplay: Option<(Child, u32, u32)>,
}

impl FfplayWindow {
    pub fn new(fps: u32) -> Self {
        Self { fps, ffplay: None }
    }

    fn spawn(&self, width: u32, height: u32) -> Result<Child> {
        debug!("Opening {width}x{height} display");
        Command::new("ffplay")
            .args(ffplay_args(width, height, self.fps))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Could not start ffplay")
    }

    pub fn close(mut self) -> Result<()> {
        if let Some((mut ffplay, _, _)) = self.ffplay.take() {
            drop(ffplay.stdin.take());
            ffplay.wait()?;
        }
        Ok(())
    }
}

impl FrameSink for FfplayWindow {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let (width, height) = frame.dimensions();
        if self.ffplay.is_none() {
            self.ffplay = Some((self.spawn(width, height)?, width, height));
        }
        let Some((ffplay, w, h)) = self.ffplay.as_mut() else {
            return Err(Error::msg("Display is not open"));
        };

        if (width, height) != (*w, *h) {
            return Err(Error::msg(format!(
                "Frame is {width}x{height}, display expects {w}x{h}"
            )));
        }
        if let Ok(Some(status)) = ffplay.try_wait() {
            debug!("ffplay exited ({status})");
            return Err(DisplayClosed.into());
        }

        let stdin = ffplay.stdin.as_mut().ok_or(DisplayClosed)?;
        match stdin.write_all(frame.as_bytes()).and_then(|_| stdin.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(DisplayClosed.into()),
            Err(e) => Err(Error::new(e).context("Could not write frame to ffplay")),
        }
    }
}

impl Drop for FfplayWindow {
    fn drop(&mut self) {
        if let Some((ffplay, _, _)) = self.ffplay.as_mut() {
            if let Ok(None) = ffplay.try_wait() {
                let _ = ffplay.kill();
                let _ = ffplay.wait();
            }
        }
    }
}

/// Annotates `source` into `sink` until either runs out. Returns the number
/// of frames read. A closed display is a normal exit.
pub fn play<S, K, D>(
    source: &mut S,
    sink: &mut K,
    sampler: &mut FrameSampler,
    detect: D,
    annotator: &Annotator,
) -> Result<u64>
where
    S: FrameSource + ?Sized,
    K: FrameSink + ?Sized,
    D: FnMut(&RgbImage) -> Result<Vec<Detection>>,
{
    let result = video::annotate_video(
        source,
        sink,
        sampler,
        detect,
        annotator,
        |n, detections| trace!("Frame {n}: {detections:?}"),
    );

    match result {
        Ok(summary) => {
            info!("Camera stream ended");
            debug!("{summary:?}");
        }
        Err(e) if e.is::<DisplayClosed>() => info!("Display closed"),
        Err(e) => return Err(e),
    }

    Ok(sampler.count())
}

/// Runs live mode with the camera and rates from `config.live`.
pub fn run(config: &AppConfig) -> Result<()> {
    let worker = {
        let config = config.clone();
        InferenceWorker::spawn(move || Pipeline::from_config(&config))?
    };
    let annotator = Annotator::new(&config.annotation);

    let mut camera = CameraSource::open(config.live.camera, config.live.fps)?;
    let mut window = FfplayWindow::new(config.live.fps);
    let mut sampler = FrameSampler::new(config.live.sample_every);

    let start = Instant::now();
    let frames = play(
        &mut camera,
        &mut window,
        &mut sampler,
        |frame| worker.detect_blocking(frame.clone()),
        &annotator,
    )?;
    window.close()?;

    let elapsed = start.elapsed().as_secs_f64();
    if elapsed > 0. {
        info!(
            "{frames} frames in {elapsed:.1}s ({:.1} fps)",
            frames as f64 / elapsed
        );
    }

    Ok(())
}
