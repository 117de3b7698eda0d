//! Frame synthesis: conditioning values and the adapter around [`VideoModel`].

use anyhow::{anyhow, Context};
use image::imageops::FilterType;
use image::RgbImage;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::HandlerError;
use crate::model::{FrameRequest, VideoModel};

/// What steers the generated clip.
#[derive(Debug, Clone, PartialEq)]
pub enum Conditioning {
    Text(String),
    /// Already resized to the output resolution.
    Image(RgbImage),
}

impl Conditioning {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
        }
    }
}

/// Ordered frames of one clip. Index order is temporal order.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSequence {
    frames: Vec<RgbImage>,
}

impl FrameSequence {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RgbImage> {
        self.frames.iter()
    }

    pub fn into_inner(self) -> Vec<RgbImage> {
        self.frames
    }
}

impl<'a> IntoIterator for &'a FrameSequence {
    type Item = &'a RgbImage;
    type IntoIter = std::slice::Iter<'a, RgbImage>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

/// Ask `model` for exactly `config.num_frames()` frames at the output resolution.
///
/// A short, long or mis-sized result is a generation failure; frames are never
/// padded, dropped or reordered here.
pub fn generate<M: VideoModel + ?Sized>(
    model: &M,
    conditioning: &Conditioning,
    config: &GenerationConfig,
) -> Result<FrameSequence, HandlerError> {
    let request = FrameRequest {
        num_frames: config.num_frames(),
        width: config.width(),
        height: config.height(),
    };

    debug!(
        conditioning = conditioning.kind(),
        num_frames = request.num_frames,
        width = request.width,
        height = request.height,
        "Requesting frames"
    );

    let frames = model
        .synthesize(conditioning, &request)
        .map_err(HandlerError::Generation)?;

    if frames.len() != request.num_frames as usize {
        return Err(HandlerError::Generation(anyhow!(
            "model returned {} frames, expected {}",
            frames.len(),
            request.num_frames
        )));
    }

    if let Some((index, frame)) = frames
        .iter()
        .enumerate()
        .find(|(_, f)| f.dimensions() != (request.width, request.height))
    {
        return Err(HandlerError::Generation(anyhow!(
            "frame {index} is {}x{}, expected {}x{}",
            frame.width(),
            frame.height(),
            request.width,
            request.height
        )));
    }

    Ok(FrameSequence { frames })
}

/// Decode raw image bytes (any format `image` recognizes) and resize them to
/// the output resolution. Nothing touches the filesystem.
pub fn image_conditioning(bytes: &[u8], config: &GenerationConfig) -> anyhow::Result<Conditioning> {
    let image = image::load_from_memory(bytes).context("image_base64 is not a decodable image")?;

    let (width, height) = (config.width(), config.height());
    let rgb = if image.width() == width && image.height() == height {
        image.to_rgb8()
    } else {
        debug!(
            from = %format!("{}x{}", image.width(), image.height()),
            to = %config.resolution(),
            "Resizing conditioning image"
        );
        image.resize_exact(width, height, FilterType::Lanczos3).to_rgb8()
    };

    Ok(Conditioning::Image(rgb))
}
