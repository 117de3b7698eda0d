use std::path::PathBuf;

/// Request-level failure taxonomy.
///
/// `Validation` is a caller fault and is answered with an `{error}` response.
/// Every other variant is a system fault surfaced to the host.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Validation(String),

    #[error("failed to acquire video model: {0:#}")]
    Acquisition(#[source] anyhow::Error),

    #[error("frame generation failed: {0:#}")]
    Generation(#[source] anyhow::Error),

    #[error("encoder exited with {status}: {stderr}")]
    Encoding { status: String, stderr: String },

    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HandlerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Acquisition(_) => "acquisition",
            Self::Generation(_) => "generation",
            Self::Encoding { .. } => "encoding",
            Self::Io { .. } => "io",
        }
    }

    pub fn is_caller_fault(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_path_and_cause() {
        let err = HandlerError::io(
            "write frame",
            "/tmp/ws/frames/000.png",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let message = err.to_string();
        assert!(message.contains("write frame"));
        assert!(message.contains("/tmp/ws/frames/000.png"));
        assert!(message.contains("denied"));
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn acquisition_error_keeps_context_chain() {
        let cause = anyhow::anyhow!("no such file").context("Failed to load ONNX model");
        let err = HandlerError::Acquisition(cause);
        assert_eq!(
            err.to_string(),
            "failed to acquire video model: Failed to load ONNX model: no such file"
        );
        assert!(!err.is_caller_fault());
    }

    #[test]
    fn validation_is_the_only_caller_fault() {
        assert!(HandlerError::validation("missing prompt").is_caller_fault());
        assert!(!HandlerError::Encoding {
            status: "exit status: 1".into(),
            stderr: String::new(),
        }
        .is_caller_fault());
    }
}
