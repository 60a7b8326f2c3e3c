use anyhow::{Context, Result};
use ort::execution_providers::XNNPACKExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
pub use ort::session::Session;
use std::path::Path;

pub fn initialize_model(model_file_path: &Path, threads: usize) -> Result<Session> {
    let model = Session::builder()?
        .with_execution_providers([XNNPACKExecutionProvider::default().build()])?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads)?
        .commit_from_file(model_file_path)
        .with_context(|| format!("Could not load model {}", model_file_path.display()))?;

    Ok(model)
}
