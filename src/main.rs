#![warn(unused_extern_crates)]

use anyhow::{Error, Result};
use clap::{Parser, Subcommand};
use image::ImageReader;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use emolens::annotate::Annotator;
use emolens::config::AppConfig;
use emolens::pipeline::classifier::argmax;
use emolens::pipeline::{OnnxClassifier, Pipeline};
use emolens::{evaluate, live, logging, server, video};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML config file. Defaults to ./emolens.toml when present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Inference threads. Defaults to half the logical cores.
    #[arg(short, long, global = true)]
    max_threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Annotate an image or video file
    Annotate {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Annotate a local camera in an ffplay window
    Live {
        /// Camera index. Defaults to live.camera from the config.
        #[arg(long)]
        camera: Option<u32>,

        #[arg(long)]
        fps: Option<u32>,
    },
    /// Measure classifier accuracy on a directory of labelled faces
    Evaluate {
        /// One subdirectory per class, in model output order when sorted.
        #[arg(short, long)]
        dataset: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(threads) = cli.max_threads {
        config.models.threads = threads.min(num_cpus::get());
    }
    logging::init(&config.logging.level);
    debug!("{config:?}");

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::serve(config))
        }
        Command::Annotate { input, output } => {
            let output = output.unwrap_or_else(|| default_output(&input));
            annotate(&config, &input, &output)
        }
        Command::Live { camera, fps } => {
            if let Some(camera) = camera {
                config.live.camera = camera;
            }
            if let Some(fps) = fps {
                config.live.fps = fps.max(1);
            }
            live::run(&config)
        }
        Command::Evaluate { dataset } => run_evaluation(&config, &dataset),
    }
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result".to_string());
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_string());

    input.with_file_name(format!("{stem}_annotated.{ext}"))
}

fn annotate(config: &AppConfig, input: &Path, output: &Path) -> Result<()> {
    let mut pipeline = Pipeline::from_config(config)?;
    let annotator = Annotator::new(&config.annotation);
    let name = input.to_string_lossy();

    if config.video.is_allowed(&name) {
        let info = video::probe(input, config.video.default_fps)?;
        info!(
            "{}x{} at {:.2} fps ({})",
            info.width, info.height, info.fps, info.codec
        );

        let start = Instant::now();
        let summary = video::process_video(
            input,
            &info,
            output,
            &config.video,
            |frame| Ok(pipeline.run(frame)),
            &annotator,
            |n, detections| debug!("Frame {n}: {detections:?}"),
        )?;
        info!(
            "{} frames, {} sampled, {} faces in {:?}",
            summary.frames,
            summary.sampled,
            summary.detections,
            start.elapsed()
        );
    } else {
        let mut img = ImageReader::open(input)?.decode()?.into_rgb8();
        let start = Instant::now();
        let detections = pipeline.run(&img);
        debug!("{detections:?}");
        debug!("Took {:?}", start.elapsed());

        annotator.annotate(&mut img, &detections);
        img.save(output)?;
    }

    info!("Result at {}", output.display());
    Ok(())
}

fn run_evaluation(config: &AppConfig, dataset: &Path) -> Result<()> {
    let mut classifier = OnnxClassifier::new(&config.models)?;

    let result = evaluate::evaluate(dataset, |img| {
        let scores = classifier.scores(img)?;
        argmax(&scores).ok_or_else(|| Error::msg("Classifier returned no scores"))
    })?;
    let matrix = &result.matrix;

    println!("{matrix}");
    for (i, class) in matrix.classes().iter().enumerate() {
        match matrix.class_accuracy(i) {
            Some(acc) => println!("{class}: {:.2}%", acc * 100.),
            None => println!("{class}: no samples"),
        }
    }
    match matrix.accuracy() {
        Some(acc) => println!(
            "Accuracy: {:.2}% ({} of {})",
            acc * 100.,
            matrix.correct(),
            matrix.total()
        ),
        None => println!("No images evaluated"),
    }
    if result.skipped > 0 {
        info!("Skipped {} images", result.skipped);
    }

    Ok(())
}
