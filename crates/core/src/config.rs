use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "REELGEN_DATA_DIR";
const ENV_MODEL_PATH: &str = "REELGEN_MODEL_PATH";
const ENV_BACKEND: &str = "REELGEN_BACKEND";

pub const DEFAULT_FPS: u32 = 12;
pub const DEFAULT_DURATION_S: u32 = 8;
/// 9:16 vertical.
pub const DEFAULT_WIDTH: u32 = 576;
pub const DEFAULT_HEIGHT: u32 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub generation: GenerationSettings,
    pub model: ModelSettings,
    pub encoder: EncoderSettings,
    pub workspace: WorkspaceSettings,
    pub server: ServerConfig,
}

/// Raw `[generation]` table. Turned into a [`GenerationConfig`] once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GenerationSettings {
    pub fps: u32,
    pub duration_s: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelSettings {
    pub path: PathBuf,
    pub backend: InferenceBackend,
    pub trt_cache_dir: PathBuf,
    /// Expected lowercase hex digest of the model file. Skipped when absent.
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncoderSettings {
    pub program: String,
    pub codec: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Parent directory for per-request workspaces. System temp dir when unset.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub max_body_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            generation: GenerationSettings::default(),
            model: ModelSettings::default(),
            encoder: EncoderSettings::default(),
            workspace: WorkspaceSettings::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            duration_s: DEFAULT_DURATION_S,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/video_generator.onnx"),
            backend: InferenceBackend::default(),
            trt_cache_dir: PathBuf::from("trt_cache"),
            sha256: None,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            codec: "libx264".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn generation_config(&self) -> Result<GenerationConfig> {
        let g = &self.generation;
        GenerationConfig::new(g.fps, g.duration_s, g.width, g.height)
            .context("invalid [generation] settings")
    }

    /// Apply `REELGEN_MODEL_PATH` and `REELGEN_BACKEND` on top of the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(ENV_MODEL_PATH).filter(|v| !v.trim().is_empty()) {
            self.model.path = PathBuf::from(path);
        }
        if let Some(backend) = lookup(ENV_BACKEND).filter(|v| !v.trim().is_empty()) {
            self.model.backend = InferenceBackend::from_str_lossy(backend.trim());
        }
    }

    /// Rewrite relative model and workspace paths so they hang off `data_dir`.
    pub fn resolve_paths(&mut self, data_dir: &Path) {
        self.model.path = resolve_relative_to(data_dir, &self.model.path);
        self.model.trt_cache_dir = resolve_relative_to(data_dir, &self.model.trt_cache_dir);
        if let Some(root) = self.workspace.root.take() {
            self.workspace.root = Some(resolve_relative_to(data_dir, &root));
        }
    }
}

/// Fixed per-deployment generation parameters.
///
/// Fields are private so `num_frames` can only ever be `fps * duration_s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    fps: u32,
    duration_s: u32,
    num_frames: u32,
    width: u32,
    height: u32,
}

impl GenerationConfig {
    pub fn new(fps: u32, duration_s: u32, width: u32, height: u32) -> Result<Self> {
        if fps == 0 {
            bail!("fps must be greater than zero");
        }
        if duration_s == 0 {
            bail!("duration_s must be greater than zero");
        }
        if width == 0 || height == 0 {
            bail!("resolution must be non-zero, got {width}x{height}");
        }
        // yuv420p subsamples chroma 2x2.
        if width % 2 != 0 || height % 2 != 0 {
            bail!("resolution must have even dimensions for yuv420p, got {width}x{height}");
        }
        let num_frames = fps
            .checked_mul(duration_s)
            .with_context(|| format!("frame count overflows: {fps} fps x {duration_s} s"))?;

        Ok(Self {
            fps,
            duration_s,
            num_frames,
            width,
            height,
        })
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn duration_s(&self) -> u32 {
        self.duration_s
    }

    pub fn num_frames(&self) -> u32 {
        self.num_frames
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `"<width>x<height>"`, as echoed in responses.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            duration_s: DEFAULT_DURATION_S,
            num_frames: DEFAULT_FPS * DEFAULT_DURATION_S,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. REELGEN_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create `data_dir` and write a default config.toml unless one already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
