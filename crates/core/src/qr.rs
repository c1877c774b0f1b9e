use std::path::{Path, PathBuf};

use image::Luma;
use qrcode::{EcLevel, QrCode};

use crate::chunk::ChunkRecord;
use crate::error::{PixeError, Result};

/// Rendered side length of every frame image.
pub const FRAME_SIZE: u32 = 512;

/// Payloads at or below this size get the stronger error-correction level.
const HIGH_EC_THRESHOLD: usize = 1000;

pub fn frame_file_name(frame_number: usize) -> String {
    format!("frame_{frame_number:05}.png")
}

/// Serializes a chunk record and renders it as a 512x512 QR frame at
/// `dir/frame_NNNNN.png`. The metadata frame and small payloads use level H,
/// everything else level M.
pub fn encode_frame(chunk: &ChunkRecord, dir: &Path, frame_number: usize) -> Result<PathBuf> {
    let payload = serde_json::to_string(chunk)?;
    let level = if chunk.is_metadata() || payload.len() <= HIGH_EC_THRESHOLD {
        EcLevel::H
    } else {
        EcLevel::M
    };
    let code = QrCode::with_error_correction_level(payload.as_bytes(), level)
        .map_err(|e| PixeError::Serialization(format!("qr encode failed: {e}")))?;
    let image = code
        .render::<Luma<u8>>()
        .min_dimensions(FRAME_SIZE, FRAME_SIZE)
        .build();
    let path = dir.join(frame_file_name(frame_number));
    image.save(&path)?;
    Ok(path)
}

/// Decodes the single QR code in a frame image back into a chunk record.
/// Multi-code frames resolve to the first non-empty payload.
pub fn decode_frame(path: &Path) -> Result<ChunkRecord> {
    let image = image::open(path)?.to_luma8();
    let mut prepared = rqrr::PreparedImage::prepare(image);
    let grids = prepared.detect_grids();
    if grids.is_empty() {
        return Err(PixeError::NoQrFound(path.to_path_buf()));
    }

    let mut text = None;
    for grid in &grids {
        match grid.decode() {
            Ok((_, content)) if !content.is_empty() => {
                text = Some(content);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                if grids.len() == 1 {
                    return Err(PixeError::Serialization(format!(
                        "qr decode failed for {path:?}: {e}"
                    )));
                }
            }
        }
    }
    let Some(text) = text else {
        return Err(if grids.len() > 1 {
            PixeError::AmbiguousQr(path.to_path_buf())
        } else {
            PixeError::NoQrFound(path.to_path_buf())
        });
    };

    serde_json::from_str(&text)
        .map_err(|e| PixeError::Serialization(format!("frame record parse failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkRecord, Chunker, SourceInfo};
    use crate::config::Config;
    use chrono::Utc;

    fn sample_chunk(data: &str) -> ChunkRecord {
        let chunker = Chunker::new(&Config::default());
        let source = SourceInfo {
            name: "readme.md".to_string(),
            mime_type: "text/markdown".to_string(),
            hash: "ab12cd34ef56".to_string(),
        };
        let mut chunks = chunker.split(data, &source, false, 0);
        chunks[0].total = chunks.len();
        chunks.remove(0)
    }

    #[test]
    fn frame_roundtrip_preserves_record() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = sample_chunk("hello, pixe\n");
        let path = encode_frame(&chunk, dir.path(), 1).unwrap();
        assert!(path.ends_with("frame_00001.png"));
        let decoded = decode_frame(&path).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn metadata_frame_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = ChunkRecord {
            id: "meta_0".to_string(),
            index: -1,
            total: 3,
            data: r#"{"version":"1.0"}"#.to_string(),
            source_file: "pixe.metadata".to_string(),
            mime_type: "application/json".to_string(),
            hash: String::new(),
            encrypted: false,
            created_at: Utc::now(),
            segmented: false,
            extra: serde_json::Map::new(),
        };
        let path = encode_frame(&chunk, dir.path(), 0).unwrap();
        let decoded = decode_frame(&path).unwrap();
        assert!(decoded.is_metadata());
        assert_eq!(decoded.data, chunk.data);
    }

    #[test]
    fn unknown_record_fields_survive_reencoding() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = sample_chunk("payload");
        chunk
            .extra
            .insert("origin_shard".to_string(), serde_json::json!(7));
        let path = encode_frame(&chunk, dir.path(), 1).unwrap();
        let decoded = decode_frame(&path).unwrap();
        assert_eq!(decoded.extra.get("origin_shard"), Some(&serde_json::json!(7)));
    }

    #[test]
    fn blank_image_has_no_qr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.png");
        image::GrayImage::from_pixel(64, 64, Luma([255u8]))
            .save(&path)
            .unwrap();
        assert!(matches!(
            decode_frame(&path),
            Err(PixeError::NoQrFound(_))
        ));
    }

    #[test]
    fn frame_names_are_zero_padded() {
        assert_eq!(frame_file_name(0), "frame_00000.png");
        assert_eq!(frame_file_name(123), "frame_00123.png");
    }
}
