use std::io::{Read, Write};

use base64::{engine::general_purpose, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{PixeError, Result};

/// Marker prefixing a compressed payload. Anything without it is passed
/// through verbatim by the decoders.
pub const GZIP_MARKER: &str = "GZ:";

/// Gzip `data` and wrap it in the text-safe `GZ:<base64>` envelope.
pub fn compress(data: &[u8]) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| PixeError::Serialization(format!("gzip write failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| PixeError::Serialization(format!("gzip finish failed: {e}")))?;
    Ok(format!(
        "{GZIP_MARKER}{}",
        general_purpose::STANDARD.encode(compressed)
    ))
}

/// Strict inverse of [`compress`]: payloads without the marker come back
/// unchanged, payloads with a broken envelope are an error.
pub fn decompress(data: &str) -> Result<Vec<u8>> {
    let Some(encoded) = data.strip_prefix(GZIP_MARKER) else {
        return Ok(data.as_bytes().to_vec());
    };
    let compressed = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| PixeError::Serialization(format!("bad compression envelope: {e}")))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PixeError::Serialization(format!("gzip decode failed: {e}")))?;
    Ok(out)
}

/// Tolerant variant used on extraction paths: a payload that happens to start
/// with the marker but does not parse as an envelope is returned verbatim.
pub fn decompress_if_needed(data: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(data) else {
        return data.to_vec();
    };
    if !text.starts_with(GZIP_MARKER) {
        return data.to_vec();
    }
    match decompress(text) {
        Ok(out) => out,
        Err(_) => data.to_vec(),
    }
}
