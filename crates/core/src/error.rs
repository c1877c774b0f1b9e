use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PixeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("empty input: {0:?}")]
    EmptyInput(PathBuf),
    #[error("invalid path: {0:?}")]
    InvalidPath(PathBuf),
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("cipher init failed: {0}")]
    CipherInit(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("ciphertext too short: {len} bytes")]
    ShortCiphertext { len: usize },
    #[error("authentication failed: wrong password or tampered data")]
    AuthenticationFailed,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("no QR code found in {0:?}")]
    NoQrFound(PathBuf),
    #[error("multiple QR codes in one frame: {0:?}")]
    AmbiguousQr(PathBuf),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("{tool} not found on PATH")]
    ToolMissing { tool: String },
    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: i32,
        stderr: String,
    },
    #[error("frame {0} not found in video")]
    FrameNotFound(usize),
    #[error("frame count probe failed: {0}")]
    ProbeError(String),
    #[error("corrupt archive: frames {missing:?} missing or undecodable")]
    CorruptArchive { missing: Vec<usize> },
    #[error("frame 0 is not a metadata frame")]
    MissingMetadataFrame,
    #[error("unsupported container version: {0}")]
    UnsupportedVersion(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{op} timed out after {seconds}s")]
    Timeout { op: String, seconds: u64 },
}

pub type Result<T> = std::result::Result<T, PixeError>;
