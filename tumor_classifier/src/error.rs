use std::time::Duration;
use thiserror::Error;
use tonic::Status;

/// Failure to produce a ready session. Cloneable so every caller awaiting
/// the same in-flight load receives the same error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelLoadError {
    #[error("failed to fetch model from {source_locator}: {reason}")]
    Fetch {
        source_locator: String,
        reason: String,
    },
    #[error("model fetch from {source_locator} timed out after {}s", .after.as_secs())]
    Timeout {
        source_locator: String,
        after: Duration,
    },
    #[error("failed to build inference session: {0}")]
    Session(String),
    #[error("model loading worker failed: {0}")]
    Worker(String),
}

impl ModelLoadError {
    pub fn user_message(&self) -> String {
        format!("The AI model could not be loaded ({}). Please retry.", self)
    }
}

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("image payload is empty")]
    Empty,
    #[error("image is too large: {size} bytes, max allowed: {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("preprocessing worker failed: {0}")]
    Worker(String),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference failed: {0}")]
    Run(String),
    #[error("model produced {actual} outputs but {expected} classes are configured")]
    OutputMismatch { expected: usize, actual: usize },
    #[error("model produced a non-finite output at index {0}")]
    NonFinite(usize),
    #[error("inference worker failed: {0}")]
    Worker(String),
}

#[derive(Error, Debug)]
pub enum HistoryPersistError {
    #[error("failed to encode scan for history: {0}")]
    Encode(String),
    #[error("history request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("history request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("history endpoint answered {0}")]
    Rejected(reqwest::StatusCode),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Everything `classify` can report, kept apart so callers can choose
/// between retrying the model load and asking for another image.
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl From<ModelLoadError> for Status {
    fn from(err: ModelLoadError) -> Self {
        Status::unavailable(err.user_message())
    }
}

impl From<ClassifyError> for Status {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::ModelLoad(e) => e.into(),
            ClassifyError::Preprocess(e @ PreprocessError::TooLarge { .. }) => {
                Status::resource_exhausted(e.to_string())
            }
            ClassifyError::Preprocess(e) => {
                Status::invalid_argument(format!("Image transformation error: {}", e))
            }
            ClassifyError::Inference(e) => Status::internal(e.to_string()),
        }
    }
}
