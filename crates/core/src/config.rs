use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PixeError, Result};

/// Bytes reserved inside each QR payload for the record envelope
/// (id, hashes, flags, timestamps).
pub const ENVELOPE_RESERVE: usize = 200;

/// Inputs above this size are processed by the streaming pipeline.
pub const STREAMING_THRESHOLD: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chunk_size: usize,
    pub quality: u8,
    pub frame_rate: f64,
    pub verbose: bool,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub encryption_enabled: bool,
    pub compression_enabled: bool,
    pub pbkdf2_iterations: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 2900,
            quality: 23,
            frame_rate: 2.0,
            verbose: false,
            temp_dir: env::temp_dir().join("pixe"),
            output_dir: PathBuf::from("./output"),
            encryption_enabled: false,
            compression_enabled: false,
            pbkdf2_iterations: 100_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = parse_env("PIXE_CHUNK_SIZE") {
            cfg.chunk_size = v;
        }
        if let Some(v) = parse_env("PIXE_QUALITY") {
            cfg.quality = v;
        }
        if let Some(v) = parse_env("PIXE_FRAME_RATE") {
            cfg.frame_rate = v;
        }
        if let Some(v) = parse_env::<u32>("PIXE_PBKDF2_ITERATIONS") {
            cfg.pbkdf2_iterations = v;
        }
        if let Ok(v) = env::var("PIXE_TEMP_DIR") {
            cfg.temp_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("PIXE_OUTPUT_DIR") {
            cfg.output_dir = PathBuf::from(v);
        }
        cfg.verbose = env_flag("PIXE_VERBOSE");
        cfg.encryption_enabled = env_flag("PIXE_ENCRYPTION_ENABLED");
        cfg.compression_enabled = env_flag("PIXE_COMPRESSION_ENABLED");
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > 4000 {
            return Err(PixeError::InvalidConfig(format!(
                "chunk size must be between 1 and 4000 bytes, got {}",
                self.chunk_size
            )));
        }
        if self.quality > 51 {
            return Err(PixeError::InvalidConfig(format!(
                "quality must be between 0 and 51, got {}",
                self.quality
            )));
        }
        if self.frame_rate <= 0.0 || self.frame_rate > 60.0 {
            return Err(PixeError::InvalidConfig(format!(
                "frame rate must be between 0.1 and 60 fps, got {}",
                self.frame_rate
            )));
        }
        if self.pbkdf2_iterations == 0 {
            return Err(PixeError::InvalidConfig(
                "pbkdf2 iterations must be positive".to_string(),
            ));
        }
        fs::create_dir_all(&self.temp_dir)?;
        fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }

    /// QR payload budget left for chunk data once the envelope is accounted for.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.saturating_sub(ENVELOPE_RESERVE).max(1)
    }

    /// The slice of encoder settings stamped into archive metadata.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            chunk_size: self.chunk_size,
            quality: self.quality,
            frame_rate: self.frame_rate,
            encryption_enabled: self.encryption_enabled,
            compression_enabled: self.compression_enabled,
        }
    }
}

/// Encoder settings recorded per archive for reproducibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub chunk_size: usize,
    pub quality: u8,
    pub frame_rate: f64,
    #[serde(default)]
    pub encryption_enabled: bool,
    #[serde(default)]
    pub compression_enabled: bool,
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
