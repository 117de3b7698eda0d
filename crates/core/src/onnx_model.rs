//! ONNX-backed [`VideoModel`]: an exported end-to-end text/image-to-video graph.
//!
//! Graph I/O contract:
//!
//! | name         | direction | type                      | shape                        |
//! |--------------|-----------|---------------------------|------------------------------|
//! | `num_frames` | input     | int64                     | `[1]`                        |
//! | `prompt`     | input     | string                    | `[1]`                        |
//! | `image`      | input     | float32 or float16, 0..1  | `[1, 3, H, W]`               |
//! | `frames`     | output    | float32 or float16, 0..1  | `[T, 3, H, W]` or `[1, T, 3, H, W]` |
//!
//! At least one of `prompt` / `image` must be present.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, ensure, Context, Result};
use half::f16;
use image::RgbImage;
use ndarray::{Array1, Array4, ArrayD};
use ort::{session::Session, value::Tensor};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::config::ModelSettings;
use crate::model::{FrameRequest, ModelLoader, VideoModel};
use crate::synthesis::Conditioning;

const INPUT_NUM_FRAMES: &str = "num_frames";
const INPUT_PROMPT: &str = "prompt";
const INPUT_IMAGE: &str = "image";
const OUTPUT_FRAMES: &str = "frames";

pub struct OnnxModelLoader {
    model_path: PathBuf,
    backend: InferenceBackend,
    trt_cache_dir: PathBuf,
    sha256: Option<String>,
}

impl OnnxModelLoader {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            model_path: settings.path.clone(),
            backend: settings.backend,
            trt_cache_dir: settings.trt_cache_dir.clone(),
            sha256: settings.sha256.clone(),
        }
    }
}

impl ModelLoader for OnnxModelLoader {
    type Model = OnnxVideoModel;

    fn describe(&self) -> String {
        format!("{} ({})", self.model_path.display(), self.backend)
    }

    fn load(&self) -> Result<OnnxVideoModel> {
        ensure!(
            self.model_path.is_file(),
            "model file not found: {}",
            self.model_path.display()
        );

        if let Some(expected) = &self.sha256 {
            info!(path = %self.model_path.display(), "Verifying model SHA256");
            let actual = sha256_file(&self.model_path)?;
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                bail!(
                    "SHA256 mismatch for {}: expected {expected}, got {actual}",
                    self.model_path.display()
                );
            }
        } else {
            warn!("No model SHA256 configured; skipping verification");
        }

        let session = build_session(&SessionConfig {
            model_path: &self.model_path,
            backend: self.backend,
            trt_cache_dir: &self.trt_cache_dir,
        })?;

        OnnxVideoModel::from_session(session)
    }
}

pub struct OnnxVideoModel {
    session: Mutex<Session>,
    accepts_text: bool,
    accepts_image: bool,
    image_is_fp16: bool,
    output_is_fp16: bool,
}

impl OnnxVideoModel {
    fn from_session(session: Session) -> Result<Self> {
        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect();
        let has_input = |name: &str| input_names.iter().any(|n| n == name);

        ensure!(
            has_input(INPUT_NUM_FRAMES),
            "model has no `{INPUT_NUM_FRAMES}` input (inputs: {input_names:?})"
        );
        let accepts_text = has_input(INPUT_PROMPT);
        let accepts_image = has_input(INPUT_IMAGE);
        ensure!(
            accepts_text || accepts_image,
            "model accepts neither `{INPUT_PROMPT}` nor `{INPUT_IMAGE}` (inputs: {input_names:?})"
        );

        let image_is_fp16 = session
            .inputs()
            .iter()
            .find(|input| input.name() == INPUT_IMAGE)
            .is_some_and(|input| is_fp16_tensor(input.dtype()));

        let output = session
            .outputs()
            .iter()
            .find(|output| output.name() == OUTPUT_FRAMES)
            .ok_or_else(|| anyhow!("model has no `{OUTPUT_FRAMES}` output"))?;
        let output_is_fp16 = is_fp16_tensor(output.dtype());

        debug!(
            accepts_text,
            accepts_image, image_is_fp16, output_is_fp16, "Detected model IO"
        );

        Ok(Self {
            session: Mutex::new(session),
            accepts_text,
            accepts_image,
            image_is_fp16,
            output_is_fp16,
        })
    }
}

impl VideoModel for OnnxVideoModel {
    fn synthesize(
        &self,
        conditioning: &Conditioning,
        request: &FrameRequest,
    ) -> Result<Vec<RgbImage>> {
        let num_frames = Tensor::from_array(Array1::from_vec(vec![i64::from(request.num_frames)]))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("model session lock poisoned by an earlier panic"))?;

        let frames: ArrayD<f32> = match conditioning {
            Conditioning::Text(prompt) => {
                ensure!(self.accepts_text, "model does not accept text conditioning");
                let prompts = Array1::from_vec(vec![prompt.clone()]);
                let prompt_tensor = Tensor::from_string_array(&prompts)?;
                let outputs = session.run(ort::inputs![
                    INPUT_PROMPT => &prompt_tensor,
                    INPUT_NUM_FRAMES => &num_frames
                ])?;
                extract_frames(&outputs[OUTPUT_FRAMES], self.output_is_fp16)?
            }
            Conditioning::Image(image) => {
                ensure!(self.accepts_image, "model does not accept image conditioning");
                let input = rgb_to_nchw(image);
                if self.image_is_fp16 {
                    let image_tensor = Tensor::from_array(input.mapv(f16::from_f32))?;
                    let outputs = session.run(ort::inputs![
                        INPUT_IMAGE => &image_tensor,
                        INPUT_NUM_FRAMES => &num_frames
                    ])?;
                    extract_frames(&outputs[OUTPUT_FRAMES], self.output_is_fp16)?
                } else {
                    let image_tensor = Tensor::from_array(input)?;
                    let outputs = session.run(ort::inputs![
                        INPUT_IMAGE => &image_tensor,
                        INPUT_NUM_FRAMES => &num_frames
                    ])?;
                    extract_frames(&outputs[OUTPUT_FRAMES], self.output_is_fp16)?
                }
            }
        };
        drop(session);

        frames_to_images(frames)
    }
}

fn is_fp16_tensor(dtype: &ort::value::ValueType) -> bool {
    match dtype {
        ort::value::ValueType::Tensor { ty, .. } => *ty == ort::tensor::TensorElementType::Float16,
        _ => false,
    }
}

fn extract_frames(value: &ort::value::DynValue, is_fp16: bool) -> Result<ArrayD<f32>> {
    if is_fp16 {
        let view = value.try_extract_array::<f16>()?;
        Ok(view.mapv(f16::to_f32))
    } else {
        let view = value.try_extract_array::<f32>()?;
        Ok(view.to_owned())
    }
}

/// HWC u8 → `[1, 3, H, W]` f32 in 0..1.
fn rgb_to_nchw(image: &RgbImage) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut out = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            out[[0, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
        }
    }
    out
}

/// `[T, 3, H, W]` or `[1, T, 3, H, W]` in 0..1 → RGB frames.
fn frames_to_images(frames: ArrayD<f32>) -> Result<Vec<RgbImage>> {
    let shape = frames.shape().to_vec();
    let (t, c, h, w) = match shape.as_slice() {
        [t, c, h, w] => (*t, *c, *h, *w),
        [1, t, c, h, w] => (*t, *c, *h, *w),
        other => bail!("unexpected `{OUTPUT_FRAMES}` shape {other:?}"),
    };
    ensure!(c == 3, "expected 3 channels in `{OUTPUT_FRAMES}`, got {c}");

    let data = frames.as_standard_layout();
    let data = data
        .as_slice()
        .context("frame tensor is not contiguous after relayout")?;
    let frame_len = 3 * h * w;

    (0..t)
        .map(|i| {
            let rgb = nchw_f32_to_rgb(&data[i * frame_len..(i + 1) * frame_len], h, w)?;
            RgbImage::from_raw(w as u32, h as u32, rgb)
                .ok_or_else(|| anyhow!("frame {i} buffer does not match {w}x{h}"))
        })
        .collect()
}

fn nchw_f32_to_rgb(data: &[f32], h: usize, w: usize) -> Result<Vec<u8>> {
    let plane = h * w;
    ensure!(
        data.len() == 3 * plane,
        "NCHW length mismatch: expected {}, got {}",
        3 * plane,
        data.len()
    );
    let (r, rest) = data.split_at(plane);
    let (g, b) = rest.split_at(plane);

    let mut rgb = Vec::with_capacity(3 * plane);
    for i in 0..plane {
        rgb.push(unit_to_u8(r[i]));
        rgb.push(unit_to_u8(g[i]));
        rgb.push(unit_to_u8(b[i]));
    }
    Ok(rgb)
}

fn unit_to_u8(v: f32) -> u8 {
    (v * 255.0 + 0.5).clamp(0.0, 255.0) as u8
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
