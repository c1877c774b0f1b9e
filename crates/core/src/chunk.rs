use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::crypto::{NONCE_LEN, SALT_LEN, TAG_LEN};

/// One unit of encoded payload, serialized 1:1 into a QR data frame.
/// `index == -1` marks the metadata frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub index: i64,
    pub total: usize,
    pub data: String,
    pub source_file: String,
    pub mime_type: String,
    pub hash: String,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    /// True when this chunk's payload was transformed on its own (streaming
    /// mode) rather than as a slice of a whole-file payload.
    #[serde(default, skip_serializing_if = "is_false")]
    pub segmented: bool,
    /// Fields this version does not know about survive a decode/re-encode
    /// cycle (version replay re-emits records).
    #[serde(flatten, default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl ChunkRecord {
    pub fn is_metadata(&self) -> bool {
        self.index < 0
    }
}

/// Identity of the file a chunk belongs to. `hash` is the SHA-256 hex of the
/// original file bytes, identical on every chunk of that file.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub name: String,
    pub mime_type: String,
    pub hash: String,
}

/// Splits an encoded payload into ordered chunks that fit the QR budget.
pub struct Chunker {
    effective_size: usize,
}

impl Chunker {
    pub fn new(config: &Config) -> Self {
        Self {
            effective_size: config.effective_chunk_size(),
        }
    }

    pub fn effective_size(&self) -> usize {
        self.effective_size
    }

    /// Cuts `payload` into `effective_size`-byte slices (respecting UTF-8
    /// boundaries), stamping global indexes starting at `index_offset`.
    /// `total` is back-stamped by the caller once the archive-wide count is
    /// known.
    pub fn split(
        &self,
        payload: &str,
        source: &SourceInfo,
        encrypted: bool,
        index_offset: usize,
    ) -> Vec<ChunkRecord> {
        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < payload.len() {
            let mut end = (start + self.effective_size).min(payload.len());
            while !payload.is_char_boundary(end) {
                end -= 1;
            }
            if end == start {
                // A single character wider than the budget still has to move.
                end = start + 1;
                while end < payload.len() && !payload.is_char_boundary(end) {
                    end += 1;
                }
            }
            let index = index_offset + chunks.len();
            chunks.push(self.make_chunk(&payload[start..end], source, encrypted, index, false));
            start = end;
        }
        chunks
    }

    /// Builds a single self-contained chunk (streaming mode).
    pub fn single(
        &self,
        data: &str,
        source: &SourceInfo,
        encrypted: bool,
        index: usize,
    ) -> ChunkRecord {
        self.make_chunk(data, source, encrypted, index, true)
    }

    fn make_chunk(
        &self,
        data: &str,
        source: &SourceInfo,
        encrypted: bool,
        index: usize,
        segmented: bool,
    ) -> ChunkRecord {
        ChunkRecord {
            id: format!("{}_{}", &source.hash[..8.min(source.hash.len())], index),
            index: index as i64,
            total: 0,
            data: data.to_string(),
            source_file: source.name.clone(),
            mime_type: source.mime_type.clone(),
            hash: source.hash.clone(),
            encrypted,
            created_at: Utc::now(),
            segmented,
            extra: serde_json::Map::new(),
        }
    }
}

/// Stamps the final chunk count onto every record of a batch.
pub fn stamp_total(chunks: &mut [ChunkRecord], total: usize) {
    for chunk in chunks.iter_mut() {
        chunk.total = total;
    }
}

/// Largest raw slice whose transformed form (optional AEAD envelope, then
/// base64) still fits in `effective_size` characters. Used by the streaming
/// pipeline to align chunk boundaries to the post-transform size.
pub fn raw_slice_capacity(effective_size: usize, encrypted: bool) -> usize {
    let max_binary = (effective_size / 4) * 3;
    let capacity = if encrypted {
        max_binary.saturating_sub(SALT_LEN + NONCE_LEN + TAG_LEN)
    } else {
        max_binary
    };
    capacity.max(1)
}

/// Media type inferred from the filename extension; unknown extensions map
/// to `application/octet-stream`.
pub fn mime_for_path(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt" | "text" | "log" | "ini" | "cfg" | "conf" | "toml" | "yaml" | "yml") => {
            "text/plain"
        }
        Some("md" | "markdown") => "text/markdown",
        Some("csv") => "text/csv",
        Some("tsv") => "text/tab-separated-values",
        Some("html" | "htm") => "text/html",
        Some("xml") => "text/xml",
        Some("rs" | "go" | "py" | "js" | "ts" | "c" | "h" | "cpp" | "java" | "sh") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        _ => "application/octet-stream",
    }
}

pub fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
}

/// Human-readable byte count: `"12 B"`, `"1.0 KB"`, `"2.5 MB"`.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, b"KMGTPE"[exp] as char)
}
