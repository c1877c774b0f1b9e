use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("core error: {0}")]
    Core(#[from] pixe_core::PixeError),
    #[error("index not found for archive {0}")]
    IndexNotFound(String),
    #[error("embedder dimension {got} does not match index dimension {want}")]
    DimensionMismatch { want: usize, got: usize },
    #[error("embedding failed (retryable={retryable}): {message}")]
    Embed { message: String, retryable: bool },
    #[error("no frames could be embedded for archive {0}")]
    EmptyIndex(String),
}

impl SearchError {
    pub fn retryable(&self) -> bool {
        matches!(self, SearchError::Embed { retryable: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
