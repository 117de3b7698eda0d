//! Per-request scratch directory for frames and the encoded clip.
//!
//! Layout:
//!
//! ```text
//! <root>/reelgen-<request id><random>/
//!     frames/000.png, 001.png, ...
//!     video_<request id>.mp4
//! ```
//!
//! The directory is removed by [`Workspace::teardown`] or, failing that, when
//! the guard is dropped, so every exit path out of a request cleans up.

use std::fs;
use std::path::{Path, PathBuf};

use image::{ImageError, ImageFormat};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::HandlerError;
use crate::synthesis::FrameSequence;

pub const FRAMES_DIR_NAME: &str = "frames";
pub const FRAME_EXTENSION: &str = "png";
/// Zero-padding of frame file names. Must agree with [`frame_pattern`].
pub const FRAME_INDEX_WIDTH: usize = 3;
const DIR_PREFIX: &str = "reelgen-";

pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    request_id: Uuid,
}

impl Workspace {
    pub fn create(root: Option<&Path>, request_id: Uuid) -> Result<Self, HandlerError> {
        let prefix = format!("{DIR_PREFIX}{}-", request_id.simple());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);

        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root)
                    .map_err(|e| HandlerError::io("create workspace root", root, e))?;
                builder
                    .tempdir_in(root)
                    .map_err(|e| HandlerError::io("create workspace in", root, e))?
            }
            None => builder
                .tempdir()
                .map_err(|e| HandlerError::io("create workspace in", std::env::temp_dir(), e))?,
        };

        let path = dir.path().to_path_buf();
        let frames_dir = path.join(FRAMES_DIR_NAME);
        let workspace = Self {
            dir: Some(dir),
            path,
            request_id,
        };
        // On failure the guard drops and removes the partial directory.
        fs::create_dir(&frames_dir)
            .map_err(|e| HandlerError::io("create frames directory", &frames_dir, e))?;

        debug!(workspace = %workspace.path.display(), "Workspace created");
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.path.join(FRAMES_DIR_NAME)
    }

    /// Unique per request: the file name embeds the request id.
    pub fn output_path(&self) -> PathBuf {
        self.path
            .join(format!("video_{}.mp4", self.request_id.simple()))
    }

    /// Write `frames` as `frames/000.png`, `frames/001.png`, ... in order.
    pub fn persist(&self, frames: &FrameSequence) -> Result<Vec<PathBuf>, HandlerError> {
        let frames_dir = self.frames_dir();
        let mut written = Vec::with_capacity(frames.len());

        for (index, frame) in frames.iter().enumerate() {
            let path = frames_dir.join(frame_file_name(index));
            frame
                .save_with_format(&path, ImageFormat::Png)
                .map_err(|e| HandlerError::io("write frame", &path, image_error_to_io(e)))?;
            written.push(path);
        }

        debug!(
            frames = written.len(),
            dir = %frames_dir.display(),
            "Frames persisted"
        );
        Ok(written)
    }

    /// Recursively remove the workspace. Safe to call more than once.
    pub fn teardown(&mut self) -> Result<(), HandlerError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        dir.close()
            .map_err(|e| HandlerError::io("remove workspace", &self.path, e))?;
        debug!(workspace = %self.path.display(), "Workspace removed");
        Ok(())
    }

    pub fn is_torn_down(&self) -> bool {
        self.dir.is_none()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(error) = self.teardown() {
            warn!(error = %error, "Workspace cleanup failed");
        }
    }
}

pub fn frame_file_name(index: usize) -> String {
    format!("{index:0width$}.{FRAME_EXTENSION}", width = FRAME_INDEX_WIDTH)
}

/// printf-style input pattern matching [`frame_file_name`], for the encoder.
pub fn frame_pattern(frames_dir: &Path) -> PathBuf {
    frames_dir.join(format!("%0{FRAME_INDEX_WIDTH}d.{FRAME_EXTENSION}"))
}

fn image_error_to_io(error: ImageError) -> std::io::Error {
    match error {
        ImageError::IoError(e) => e,
        other => std::io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::config::GenerationConfig;
    use crate::model::{FrameRequest, VideoModel};
    use crate::synthesis::{generate, Conditioning};

    struct SolidModel;

    impl VideoModel for SolidModel {
        fn synthesize(
            &self,
            _: &Conditioning,
            request: &FrameRequest,
        ) -> anyhow::Result<Vec<RgbImage>> {
            Ok((0..request.num_frames)
                .map(|i| RgbImage::from_pixel(request.width, request.height, Rgb([i as u8, 1, 2])))
                .collect())
        }
    }

    fn frames(fps: u32, duration_s: u32) -> FrameSequence {
        let config = GenerationConfig::new(fps, duration_s, 4, 4).expect("valid config");
        generate(&SolidModel, &Conditioning::Text("t".into()), &config).expect("frames")
    }

    #[test]
    fn frame_names_are_zero_padded() {
        assert_eq!(frame_file_name(0), "000.png");
        assert_eq!(frame_file_name(7), "007.png");
        assert_eq!(frame_file_name(95), "095.png");
        assert_eq!(frame_file_name(123), "123.png");
    }

    #[test]
    fn frame_pattern_matches_naming_convention() {
        let pattern = frame_pattern(Path::new("/ws/frames"));
        assert_eq!(pattern, PathBuf::from("/ws/frames/%03d.png"));
    }

    #[test]
    fn persist_writes_contiguous_frames_in_order() {
        let root = tempfile::tempdir().expect("root");
        let ws = Workspace::create(Some(root.path()), Uuid::new_v4()).expect("workspace");
        let sequence = frames(12, 2);

        let written = ws.persist(&sequence).expect("persist");
        assert_eq!(written.len(), 24);

        let mut names: Vec<String> = fs::read_dir(ws.frames_dir())
            .expect("read frames dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        let expected: Vec<String> = (0..24).map(frame_file_name).collect();
        assert_eq!(names, expected);

        let fifth = image::open(ws.frames_dir().join("005.png"))
            .expect("reopen frame")
            .to_rgb8();
        assert_eq!(fifth.get_pixel(0, 0)[0], 5);
    }

    #[test]
    fn output_path_is_unique_per_request() {
        let root = tempfile::tempdir().expect("root");
        let a = Workspace::create(Some(root.path()), Uuid::new_v4()).expect("a");
        let b = Workspace::create(Some(root.path()), Uuid::new_v4()).expect("b");
        assert_ne!(a.path(), b.path());
        assert_ne!(a.output_path(), b.output_path());
        assert!(a.output_path().starts_with(a.path()));
    }

    #[test]
    fn same_request_id_still_gets_distinct_directories() {
        let root = tempfile::tempdir().expect("root");
        let id = Uuid::new_v4();
        let a = Workspace::create(Some(root.path()), id).expect("a");
        let b = Workspace::create(Some(root.path()), id).expect("b");
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn teardown_removes_tree_and_is_idempotent() {
        let root = tempfile::tempdir().expect("root");
        let mut ws = Workspace::create(Some(root.path()), Uuid::new_v4()).expect("workspace");
        ws.persist(&frames(2, 1)).expect("persist");
        fs::write(ws.output_path(), b"video").expect("write output");
        let path = ws.path().to_path_buf();

        ws.teardown().expect("first teardown");
        assert!(!path.exists());
        assert!(ws.is_torn_down());
        ws.teardown().expect("second teardown is a no-op");
    }

    #[test]
    fn drop_removes_workspace() {
        let root = tempfile::tempdir().expect("root");
        let path = {
            let ws = Workspace::create(Some(root.path()), Uuid::new_v4()).expect("workspace");
            ws.persist(&frames(1, 1)).expect("persist");
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(fs::read_dir(root.path()).expect("read root").count(), 0);
    }

    #[test]
    fn create_makes_missing_root() {
        let root = tempfile::tempdir().expect("root");
        let nested = root.path().join("a").join("b");
        let ws = Workspace::create(Some(&nested), Uuid::new_v4()).expect("workspace");
        assert!(ws.frames_dir().is_dir());
        assert!(ws.path().starts_with(&nested));
    }
}
