//! External encoder invocation: numbered PNG frames in, one MP4 out.
//!
//! The command line is assembled from typed [`EncoderArg`]s in a fixed order:
//!
//! ```text
//! ffmpeg -y -framerate <fps> -i <frames>/%03d.png -c:v <codec> -pix_fmt yuv420p -movflags +faststart <output>
//! ```

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{EncoderSettings, GenerationConfig};
use crate::error::HandlerError;
use crate::workspace::frame_pattern;

pub const PIXEL_FORMAT: &str = "yuv420p";
/// Relocates the moov atom so players can start before the download ends.
pub const MOVFLAGS: &str = "+faststart";
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderArg {
    Overwrite,
    FrameRate(u32),
    Input(PathBuf),
    VideoCodec(String),
    PixelFormat(String),
    MovFlags(String),
    Output(PathBuf),
}

impl EncoderArg {
    fn render(&self) -> Vec<OsString> {
        match self {
            Self::Overwrite => vec!["-y".into()],
            Self::FrameRate(fps) => vec!["-framerate".into(), fps.to_string().into()],
            Self::Input(pattern) => vec!["-i".into(), pattern.into()],
            Self::VideoCodec(codec) => vec!["-c:v".into(), codec.into()],
            Self::PixelFormat(pix_fmt) => vec!["-pix_fmt".into(), pix_fmt.into()],
            Self::MovFlags(flags) => vec!["-movflags".into(), flags.into()],
            Self::Output(path) => vec![path.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    program: String,
    args: Vec<EncoderArg>,
}

impl EncoderCommand {
    pub fn new(
        settings: &EncoderSettings,
        frames_dir: &Path,
        output_path: &Path,
        config: &GenerationConfig,
    ) -> Self {
        Self {
            program: settings.program.clone(),
            args: vec![
                EncoderArg::Overwrite,
                EncoderArg::FrameRate(config.fps()),
                EncoderArg::Input(frame_pattern(frames_dir)),
                EncoderArg::VideoCodec(settings.codec.clone()),
                EncoderArg::PixelFormat(PIXEL_FORMAT.to_string()),
                EncoderArg::MovFlags(MOVFLAGS.to_string()),
                EncoderArg::Output(output_path.to_path_buf()),
            ],
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[EncoderArg] {
        &self.args
    }

    pub fn to_args(&self) -> Vec<OsString> {
        self.args.iter().flat_map(EncoderArg::render).collect()
    }

    /// Run the encoder to completion. A nonzero exit is an error carrying the
    /// tail of stderr; it is not retried.
    pub fn run(&self) -> Result<(), HandlerError> {
        let args = self.to_args();
        debug!(
            cmd = %format!(
                "{} {}",
                self.program,
                args.iter()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
            "Launching encoder"
        );

        let output = crate::runtime::command_for(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| HandlerError::io("launch encoder", &self.program, e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|line| !line.is_empty()) {
            debug!(target: "encoder_stderr", "{}", line);
        }

        if !output.status.success() {
            return Err(HandlerError::Encoding {
                status: output.status.to_string(),
                stderr: stderr_tail(&stderr, STDERR_TAIL_LINES),
            });
        }

        Ok(())
    }
}

/// Encode the frames in `frames_dir` into `output_path` and read the result.
pub fn encode(
    settings: &EncoderSettings,
    frames_dir: &Path,
    output_path: &Path,
    config: &GenerationConfig,
) -> Result<Vec<u8>, HandlerError> {
    let started = Instant::now();
    EncoderCommand::new(settings, frames_dir, output_path, config).run()?;

    let bytes =
        fs::read(output_path).map_err(|e| HandlerError::io("read encoded video", output_path, e))?;

    info!(
        codec = %settings.codec,
        fps = config.fps(),
        bytes = bytes.len(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Encoding finished"
    );
    Ok(bytes)
}

fn stderr_tail(stderr: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
