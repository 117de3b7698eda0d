//! Inference backend selection and `ort::Session` construction.
//!
//! [`build_session`] registers the execution providers for the configured
//! [`InferenceBackend`]. TensorRT always carries CUDA as a fallback, and ORT
//! itself falls back to CPU when CUDA is unavailable.

use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const PROGRESS_TICK: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    #[serde(alias = "trt")]
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: &'a Path,
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config.trt_cache_dir;
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }
            let cache_path = cache_dir.to_string_lossy().to_string();

            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (engine build on first run can take minutes)"
            );

            let heartbeat = LoadHeartbeat::start("tensorrt");
            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()));
            heartbeat.stop();
            result?
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");

            let heartbeat = LoadHeartbeat::start("cuda");
            let result = builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()));
            heartbeat.stop();
            result?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session without execution providers");
            builder
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?
        }
    };

    Ok(session)
}

/// Logs every [`PROGRESS_TICK`] while a session is being committed.
struct LoadHeartbeat {
    stop_tx: std::sync::mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl LoadHeartbeat {
    fn start(backend: &'static str) -> Self {
        let (stop_tx, stop_rx) = channel::<()>();
        let started = Instant::now();
        let thread = thread::spawn(move || loop {
            match stop_rx.recv_timeout(PROGRESS_TICK) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    info!(
                        backend,
                        elapsed_secs = started.elapsed().as_secs(),
                        "Model session initialization still in progress"
                    );
                }
            }
        });
        Self { stop_tx, thread }
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.thread.join();
    }
}
