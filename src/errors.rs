use std::path::PathBuf;
use thiserror::Error;

/// Error type for card segmentation.
///
/// Each variant captures the context of its error domain (filesystem, image
/// processing, model operations) so callers never have to parse error strings.
#[derive(Error, Debug)]
pub enum MicrowinkError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MicrowinkError>;

impl From<anyhow::Error> for MicrowinkError {
    fn from(err: anyhow::Error) -> Self {
        MicrowinkError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Fallback for I/O errors without path/operation context. Code that has the
/// context should construct `MicrowinkError::FileSystem` directly.
impl From<std::io::Error> for MicrowinkError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for MicrowinkError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for MicrowinkError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors occur during tensor work inside inference, so they are
/// categorized as model errors rather than a separate tensor domain.
impl From<ndarray::ShapeError> for MicrowinkError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}
