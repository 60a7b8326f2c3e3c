use anyhow::{Context, Error, Result};
use image::{EncodableLayout, RgbImage};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{Level, debug, info, span, warn};

use crate::annotate::Annotator;
use crate::config::VideoConfig;
use crate::pipeline::Detection;

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
}

/// Reads the first video stream's geometry and frame rate with `ffprobe`.
/// A missing or zero frame rate is replaced by `default_fps`.
pub fn probe(path: &Path, default_fps: f64) -> Result<VideoInfo> {
    let output = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .context("Could not run ffprobe")?;

    if !output.status.success() {
        return Err(Error::msg(format!(
            "ffprobe failed on {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).context("Could not parse ffprobe output")?;
    parse_probe(&json, default_fps)
}

fn parse_probe(json: &serde_json::Value, default_fps: f64) -> Result<VideoInfo> {
    let streams = json["streams"]
        .as_array()
        .ok_or_else(|| Error::msg("ffprobe reported no streams"))?;
    let stream = streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("video"))
        .ok_or_else(|| Error::msg("No video stream found"))?;

    let mut width = stream["width"].as_u64().unwrap_or(0) as u32;
    let mut height = stream["height"].as_u64().unwrap_or(0) as u32;
    if width == 0 || height == 0 {
        return Err(Error::msg(format!("Invalid frame size {width}x{height}")));
    }

    // ffmpeg applies the display matrix while decoding, so quarter turns
    // come out with width and height swapped.
    let rotation = stream_rotation(stream);
    if rotation % 180 == 90 {
        debug!("Stream rotated by {rotation} degrees");
        std::mem::swap(&mut width, &mut height);
    }

    let fps = match stream["r_frame_rate"].as_str().and_then(parse_frame_rate) {
        Some(fps) => fps,
        None => {
            warn!("Unknown frame rate, assuming {default_fps}");
            default_fps
        }
    };

    Ok(VideoInfo {
        width,
        height,
        fps,
        codec: stream["codec_name"].as_str().unwrap_or("").to_string(),
    })
}

/// Rotation in degrees, normalized to `0..360`. Newer ffprobe reports it
/// in the display matrix side data, older builds in the `rotate` tag.
fn stream_rotation(stream: &serde_json::Value) -> i64 {
    let side_data = stream["side_data_list"]
        .as_array()
        .into_iter()
        .flatten()
        .find_map(|d| d["rotation"].as_f64());
    let tag = stream["tags"]["rotate"]
        .as_str()
        .and_then(|r| r.trim().parse::<f64>().ok());

    side_data
        .or(tag)
        .map(|r| (r.round() as i64).rem_euclid(360))
        .unwrap_or(0)
}

/// Parses ffprobe rates such as `30000/1001` or `25`. Zero and malformed
/// rates give `None`.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0. {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };

    (fps.is_finite() && fps > 0.).then_some(fps)
}

pub trait FrameSource {
    /// Next decoded frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;
}

/// Decodes a video into RGB frames through an `ffmpeg` child process.
pub struct FfmpegReader {
    ffmpeg: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    frames: u64,
}

impl FfmpegReader {
    pub fn open(path: &Path, info: &VideoInfo) -> Result<Self> {
        let mut ffmpeg = Command::new("ffmpeg")
            .args(["-v", "error", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Could not start ffmpeg decoder")?;

        let stdout = ffmpeg
            .stdout
            .take()
            .ok_or_else(|| Error::msg("ffmpeg decoder has no stdout"))?;

        Ok(Self {
            ffmpeg,
            stdout,
            width: info.width,
            height: info.height,
            frames: 0,
        })
    }
}

impl FrameSource for FfmpegReader {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut buf = vec![0u8; self.width as usize * self.height as usize * 3];
        let mut filled = 0;
        while filled < buf.len() {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if filled < buf.len() {
            if filled > 0 {
                warn!("Dropping truncated frame ({filled} of {} bytes)", buf.len());
            }
            let status = self.ffmpeg.wait()?;
            if !status.success() && self.frames == 0 {
                return Err(Error::msg(format!("ffmpeg could not decode video ({status})")));
            }
            return Ok(None);
        }

        self.frames += 1;
        let frame = RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| Error::msg("Decoded frame has the wrong size"))?;
        Ok(Some(frame))
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        if let Ok(None) = self.ffmpeg.try_wait() {
            let _ = self.ffmpeg.kill();
            let _ = self.ffmpeg.wait();
        }
    }
}

/// Encodes RGB frames to an mp4 through an `ffmpeg` child process.
pub struct FfmpegWriter {
    ffmpeg: Child,
    width: u32,
    height: u32,
}

impl FfmpegWriter {
    pub fn create(path: &Path, width: u32, height: u32, fps: f64, codec: &str) -> Result<Self> {
        let ffmpeg = Command::new("ffmpeg")
            .args(["-v", "error", "-y"])
            .args(["-f", "rawvideo", "-pixel_format", "rgb24"])
            .args(["-video_size", &format!("{width}x{height}")])
            .args(["-framerate", &format!("{fps}")])
            .args(["-i", "-"])
            .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
            .args(["-c:v", codec, "-pix_fmt", "yuv420p", "-movflags", "+faststart"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Could not start ffmpeg encoder")?;

        Ok(Self {
            ffmpeg,
            width,
            height,
        })
    }

    /// Closes the input pipe and waits for the encoder to flush the file.
    pub fn finish(mut self) -> Result<()> {
        drop(self.ffmpeg.stdin.take());
        let status = self.ffmpeg.wait()?;
        if !status.success() {
            return Err(Error::msg(format!("ffmpeg encoder failed ({status})")));
        }

        Ok(())
    }
}

impl FrameSink for FfmpegWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(Error::msg(format!(
                "Frame is {:?}, encoder expects {}x{}",
                frame.dimensions(),
                self.width,
                self.height
            )));
        }

        let stdin = self
            .ffmpeg
            .stdin
            .as_mut()
            .ok_or_else(|| Error::msg("ffmpeg encoder is closed"))?;
        stdin
            .write_all(frame.as_bytes())
            .context("Could not write frame to ffmpeg")?;

        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if let Ok(None) = self.ffmpeg.try_wait() {
            let _ = self.ffmpeg.kill();
            let _ = self.ffmpeg.wait();
        }
    }
}

/// Decides which frames get detection and remembers the last result.
///
/// Frames are counted from 1 and every `every`-th one is sampled. The
/// frames in between reuse the previous sample's detections.
#[derive(Debug)]
pub struct FrameSampler {
    every: u64,
    count: u64,
    last: Vec<Detection>,
}

impl FrameSampler {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            count: 0,
            last: Vec::new(),
        }
    }

    /// Advances to the next frame. Returns its number and whether to sample it.
    pub fn tick(&mut self) -> (u64, bool) {
        self.count += 1;
        (self.count, self.count % self.every == 0)
    }

    pub fn update(&mut self, detections: Vec<Detection>) {
        self.last = detections;
    }

    pub fn current(&self) -> &[Detection] {
        &self.last
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VideoSummary {
    pub frames: u64,
    pub sampled: u64,
    pub detections: u64,
}

/// Copies `source` to `sink`, drawing detections on every frame.
///
/// `detect` runs on sampled frames only. `on_sampled` gets each sampled
/// frame's number and detections.
pub fn annotate_video<S, K, D, F>(
    source: &mut S,
    sink: &mut K,
    sampler: &mut FrameSampler,
    mut detect: D,
    annotator: &Annotator,
    mut on_sampled: F,
) -> Result<VideoSummary>
where
    S: FrameSource + ?Sized,
    K: FrameSink + ?Sized,
    D: FnMut(&RgbImage) -> Result<Vec<Detection>>,
    F: FnMut(u64, &[Detection]),
{
    let span = span!(Level::DEBUG, "annotate_video");
    let _guard = span.enter();

    let progress_every = sampler.every.saturating_mul(10);
    let mut summary = VideoSummary::default();

    while let Some(mut frame) = source.next_frame()? {
        let (count, sampled) = sampler.tick();
        if sampled {
            let detections = detect(&frame)?;
            on_sampled(count, &detections);
            summary.sampled += 1;
            summary.detections += detections.len() as u64;
            sampler.update(detections);
        }

        annotator.annotate(&mut frame, sampler.current());
        sink.write_frame(&frame)?;
        summary.frames = count;

        if count % progress_every == 0 {
            info!("Processed {count} frames");
        }
    }

    debug!("{summary:?}");
    Ok(summary)
}

/// Decodes `input`, annotates it and encodes the result to `output`.
/// A partially written `output` is removed on failure.
pub fn process_video<D, F>(
    input: &Path,
    info: &VideoInfo,
    output: &Path,
    config: &VideoConfig,
    detect: D,
    annotator: &Annotator,
    on_sampled: F,
) -> Result<VideoSummary>
where
    D: FnMut(&RgbImage) -> Result<Vec<Detection>>,
    F: FnMut(u64, &[Detection]),
{
    remove_on_error(output, || {
        render(input, info, output, config, detect, annotator, on_sampled)
    })
}

/// Runs `write` and deletes `output` if it fails.
fn remove_on_error<T>(output: &Path, write: impl FnOnce() -> Result<T>) -> Result<T> {
    let result = write();

    if result.is_err() && output.exists() {
        match std::fs::remove_file(output) {
            Ok(()) => debug!("Removed partial output {}", output.display()),
            Err(e) => warn!("Could not remove partial output {}: {e}", output.display()),
        }
    }

    result
}

fn render<D, F>(
    input: &Path,
    info: &VideoInfo,
    output: &Path,
    config: &VideoConfig,
    detect: D,
    annotator: &Annotator,
    on_sampled: F,
) -> Result<VideoSummary>
where
    D: FnMut(&RgbImage) -> Result<Vec<Detection>>,
    F: FnMut(u64, &[Detection]),
{
    let mut reader = FfmpegReader::open(input, info)?;
    let mut writer = FfmpegWriter::create(output, info.width, info.height, info.fps, &config.codec)?;
    let mut sampler = FrameSampler::new(config.sample_every);

    let summary = annotate_video(
        &mut reader,
        &mut writer,
        &mut sampler,
        detect,
        annotator,
        on_sampled,
    )?;
    writer.finish()?;

    Ok(summary)
}
