use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("core error: {0}")]
    Core(#[from] pixe_core::PixeError),
    #[error("no version history for archive {0}")]
    HistoryNotFound(String),
    #[error("version {version} out of range (head is {head})")]
    VersionOutOfRange { version: u64, head: u64 },
    #[error("corrupt version log: {0}")]
    CorruptVersionLog(String),
    #[error("branch {0} already exists")]
    BranchExists(String),
    #[error("frame-level replay requires a video-capable archiver")]
    ReplayNeedsArchiver,
}

pub type Result<T> = std::result::Result<T, DeltaError>;
