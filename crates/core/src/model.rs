//! Lazily acquired, process-wide video model handle.

use std::time::Instant;

use anyhow::Result;
use image::RgbImage;
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::error::HandlerError;
use crate::synthesis::Conditioning;

/// Shape of the clip requested from a [`VideoModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequest {
    pub num_frames: u32,
    pub width: u32,
    pub height: u32,
}

/// A loaded generative capability.
///
/// Implementations return frames in temporal order. Device placement and
/// precision are their own business.
pub trait VideoModel: Send + Sync {
    fn synthesize(&self, conditioning: &Conditioning, request: &FrameRequest)
        -> Result<Vec<RgbImage>>;
}

/// Performs the expensive acquisition of a [`VideoModel`].
pub trait ModelLoader: Send + Sync {
    type Model: VideoModel;

    fn describe(&self) -> String;
    fn load(&self) -> Result<Self::Model>;
}

/// Owns the single model slot of a worker process.
///
/// The slot is filled by the first successful [`get_handle`](Self::get_handle)
/// call. A failed load leaves it empty, so the next request tries again.
pub struct ModelHandleManager<L: ModelLoader> {
    loader: L,
    slot: OnceCell<L::Model>,
}

impl<L: ModelLoader> ModelHandleManager<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            slot: OnceCell::new(),
        }
    }

    pub fn get_handle(&self) -> Result<&L::Model, HandlerError> {
        self.slot.get_or_try_init(|| {
            let source = self.loader.describe();
            info!(model = %source, "Acquiring video model");
            let started = Instant::now();

            match self.loader.load() {
                Ok(model) => {
                    info!(
                        model = %source,
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        "Video model ready"
                    );
                    Ok(model)
                }
                Err(error) => {
                    warn!(
                        model = %source,
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        error = %format!("{error:#}"),
                        "Video model acquisition failed; slot left empty for retry"
                    );
                    Err(HandlerError::Acquisition(error))
                }
            }
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;

    struct BlankModel;

    impl VideoModel for BlankModel {
        fn synthesize(&self, _: &Conditioning, request: &FrameRequest) -> Result<Vec<RgbImage>> {
            Ok((0..request.num_frames)
                .map(|_| RgbImage::new(request.width, request.height))
                .collect())
        }
    }

    /// Fails the first `failures` loads, then succeeds.
    struct FlakyLoader {
        failures: usize,
        attempts: AtomicUsize,
    }

    impl FlakyLoader {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                attempts: AtomicUsize::new(0),
            }
        }
    }

    impl ModelLoader for FlakyLoader {
        type Model = BlankModel;

        fn describe(&self) -> String {
            "flaky".to_string()
        }

        fn load(&self) -> Result<BlankModel> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                bail!("simulated out-of-memory on attempt {attempt}");
            }
            Ok(BlankModel)
        }
    }

    #[test]
    fn acquisition_runs_once_across_many_calls() {
        let manager = ModelHandleManager::new(FlakyLoader::new(0));
        assert!(!manager.is_loaded());

        for _ in 0..5 {
            manager.get_handle().expect("handle available");
        }

        assert!(manager.is_loaded());
        assert_eq!(manager.loader().attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_acquisition_does_not_poison_the_slot() {
        let manager = ModelHandleManager::new(FlakyLoader::new(1));

        let err = manager.get_handle().err().expect("first load fails");
        assert!(matches!(err, HandlerError::Acquisition(_)));
        assert!(err.to_string().contains("simulated out-of-memory"));
        assert!(!manager.is_loaded());

        manager.get_handle().expect("second load succeeds");
        manager.get_handle().expect("cached afterwards");
        assert_eq!(manager.loader().attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_first_callers_share_one_acquisition() {
        let manager = ModelHandleManager::new(FlakyLoader::new(0));
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    manager.get_handle().expect("handle available");
                });
            }
        });
        assert_eq!(manager.loader().attempts.load(Ordering::SeqCst), 1);
    }
}
