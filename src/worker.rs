use anyhow::{Error, Result};
use flume::{Receiver, Sender};
use image::RgbImage;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{debug, error, info};

use crate::pipeline::{Detection, Pipeline};

type Job = (RgbImage, Sender<Result<Vec<Detection>>>);

fn stopped() -> Error {
    Error::msg("Inference worker has stopped")
}

/// Handle to the dedicated inference thread.
///
/// The thread owns the `Pipeline` and serves one frame at a time. Handles
/// are cheap to clone and the thread exits once the last one is dropped.
#[derive(Clone)]
pub struct InferenceWorker {
    jobs: Sender<Job>,
}

impl InferenceWorker {
    /// Starts the thread and builds the pipeline on it with `factory`.
    /// Blocks until the pipeline is ready and returns the factory's error
    /// if it could not be built.
    pub fn spawn<F>(factory: F) -> Result<InferenceWorker>
    where
        F: FnOnce() -> Result<Pipeline> + Send + 'static,
    {
        let (jobs, queue) = flume::unbounded::<Job>();
        let (ready_tx, ready_rx) = flume::bounded::<Result<()>>(1);

        thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || {
                let pipeline = match factory() {
                    Ok(pipeline) => {
                        let _ = ready_tx.send(Ok(()));
                        pipeline
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                serve(pipeline, queue);
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::msg("Inference worker exited during startup"))??;
        info!("Inference worker ready");

        Ok(InferenceWorker { jobs })
    }

    pub async fn detect(&self, frame: RgbImage) -> Result<Vec<Detection>> {
        let (reply, result) = flume::bounded(1);
        self.jobs
            .send_async((frame, reply))
            .await
            .map_err(|_| stopped())?;
        result.recv_async().await.map_err(|_| stopped())?
    }

    pub fn detect_blocking(&self, frame: RgbImage) -> Result<Vec<Detection>> {
        let (reply, result) = flume::bounded(1);
        self.jobs.send((frame, reply)).map_err(|_| stopped())?;
        result.recv().map_err(|_| stopped())?
    }

    /// False once the inference thread has exited.
    pub fn is_alive(&self) -> bool {
        !self.jobs.is_disconnected()
    }
}

fn serve(mut pipeline: Pipeline, queue: Receiver<Job>) {
    for (frame, reply) in queue.iter() {
        // A panicking model fails this frame only.
        let detections = panic::catch_unwind(AssertUnwindSafe(|| pipeline.run(&frame)))
            .map_err(|_| {
                error!("Inference panicked on a {}x{} frame", frame.width(), frame.height());
                Error::msg("Inference failed on this frame")
            });
        // The requester may have gone away, nothing to do then.
        let _ = reply.send(detections);
    }
    debug!("Inference worker stopped");
}
