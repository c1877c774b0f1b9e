use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use pixe_core::{decompress_if_needed, CancellationToken, ChunkRecord, VideoBridge};

use crate::embedding::{embed_with_retry, EmbeddingSink};
use crate::error::{Result, SearchError};

const PREVIEW_LEN: usize = 200;
const EMBED_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameIndexEntry {
    pub frame_number: usize,
    pub chunk_index: usize,
    pub source_file: String,
    pub content_hash: String,
    pub content_len: usize,
    pub embedding: Vec<f32>,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryIndex {
    pub archive_id: String,
    pub artifact_path: PathBuf,
    pub total_frames: usize,
    pub vector_dim: usize,
    pub entries: Vec<FrameIndexEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version_tag: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub frame_number: usize,
    pub score: f32,
    pub source_file: String,
    pub chunk_index: usize,
    pub preview: String,
}

/// Per-archive vector index persisted as a `.index` sidecar. Builds are
/// serialized per archive through an exclusive lock; searches run lock-free
/// against a loaded snapshot.
pub struct IndexStore {
    index_dir: PathBuf,
    bridge: VideoBridge,
}

impl IndexStore {
    pub fn new(index_dir: impl Into<PathBuf>) -> Result<Self> {
        let index_dir = index_dir.into();
        fs::create_dir_all(&index_dir)?;
        Ok(Self {
            index_dir,
            bridge: VideoBridge::new()?,
        })
    }

    fn sidecar_path(&self, archive_id: &str) -> PathBuf {
        // Archive ids are artifact paths for now; keep the sidecar flat.
        let name: String = archive_id
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        self.index_dir.join(format!("{name}.index"))
    }

    /// Extracts every frame of `artifact`, embeds the decoded frame text and
    /// persists the index atomically. Frames that cannot be embedded are
    /// skipped with a warning; the build fails only when nothing embeds.
    pub fn build(
        &self,
        archive_id: &str,
        artifact: &Path,
        embedder: &dyn EmbeddingSink,
        cancel: Option<&CancellationToken>,
    ) -> Result<MemoryIndex> {
        let lock_path = self.sidecar_path(archive_id).with_extension("index.lock");
        let lock = File::create(&lock_path)?;
        lock.lock_exclusive()?;

        let scratch = tempfile::tempdir()?;
        let frame_paths = self.bridge.extract_all(artifact, scratch.path())?;

        let mut records = Vec::new();
        for (frame_number, path) in frame_paths.iter().enumerate() {
            if let Some(token) = cancel {
                token.check().map_err(SearchError::Core)?;
            }
            match pixe_core::decode_frame(path) {
                Ok(record) => records.push((frame_number, record)),
                Err(e) => tracing::warn!("frame {frame_number} undecodable, skipping: {e}"),
            }
        }

        let entries = build_entries(&records, embedder, cancel)?;
        if entries.is_empty() {
            return Err(SearchError::EmptyIndex(archive_id.to_string()));
        }

        let now = Utc::now();
        let index = MemoryIndex {
            archive_id: archive_id.to_string(),
            artifact_path: artifact.to_path_buf(),
            total_frames: entries.len(),
            vector_dim: embedder.dim(),
            entries,
            created_at: now,
            updated_at: now,
            version_tag: 1,
        };
        self.save(&index)?;
        fs2::FileExt::unlock(&lock)?;
        Ok(index)
    }

    pub fn load(&self, archive_id: &str) -> Result<MemoryIndex> {
        let path = self.sidecar_path(archive_id);
        let data = fs::read_to_string(&path)
            .map_err(|_| SearchError::IndexNotFound(archive_id.to_string()))?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Atomic write-then-rename.
    pub fn save(&self, index: &MemoryIndex) -> Result<()> {
        let path = self.sidecar_path(&index.archive_id);
        let mut tmp = NamedTempFile::new_in(&self.index_dir)?;
        tmp.write_all(serde_json::to_string_pretty(index)?.as_bytes())?;
        tmp.persist(&path).map_err(|e| SearchError::Io(e.error))?;
        Ok(())
    }

    /// Cosine-similarity search over a loaded snapshot. Results come back in
    /// descending score order, ties in entry order.
    pub fn search(
        &self,
        index: &MemoryIndex,
        query: &str,
        top_k: usize,
        embedder: &dyn EmbeddingSink,
    ) -> Result<Vec<SearchResult>> {
        if embedder.dim() != index.vector_dim {
            return Err(SearchError::DimensionMismatch {
                want: index.vector_dim,
                got: embedder.dim(),
            });
        }
        let query_vector = embedder.embed(query)?;

        let mut results: Vec<SearchResult> = index
            .entries
            .iter()
            .map(|entry| SearchResult {
                frame_number: entry.frame_number,
                score: cosine_similarity(&query_vector, &entry.embedding),
                source_file: entry.source_file.clone(),
                chunk_index: entry.chunk_index,
                preview: entry.preview.clone(),
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k.min(index.entries.len()));
        Ok(results)
    }
}

/// Maps decoded data-frame records to index entries. Metadata and encrypted
/// frames are skipped: neither yields indexable text.
pub fn build_entries(
    records: &[(usize, ChunkRecord)],
    embedder: &dyn EmbeddingSink,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<FrameIndexEntry>> {
    let mut entries = Vec::new();
    for (frame_number, record) in records {
        if let Some(token) = cancel {
            token.check().map_err(SearchError::Core)?;
        }
        if record.is_metadata() {
            continue;
        }
        if record.encrypted {
            tracing::warn!("frame {frame_number} is encrypted, skipping index entry");
            continue;
        }
        let bytes = decompress_if_needed(record.data.as_bytes());
        let text = String::from_utf8_lossy(&bytes);
        if text.is_empty() {
            continue;
        }
        let embedding = match embed_with_retry(embedder, &text, EMBED_ATTEMPTS) {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!("frame {frame_number} failed to embed, skipping: {e}");
                continue;
            }
        };
        entries.push(FrameIndexEntry {
            frame_number: *frame_number,
            chunk_index: record.index.max(0) as usize,
            source_file: record.source_file.clone(),
            content_hash: hex::encode(Sha256::digest(text.as_bytes())),
            content_len: text.len(),
            embedding,
            preview: preview(&text),
        });
    }
    Ok(entries)
}

fn preview(text: &str) -> String {
    if text.len() <= PREVIEW_LEN {
        return text.to_string();
    }
    let mut end = PREVIEW_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
