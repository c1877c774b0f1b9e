use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::Builder;
use walkdir::WalkDir;

use crate::chunk::{
    format_size, is_text_mime, mime_for_path, stamp_total, ChunkRecord, Chunker, SourceInfo,
};
use crate::compress::{compress, decompress_if_needed, GZIP_MARKER};
use crate::config::{Config, STREAMING_THRESHOLD};
use crate::crypto::EncryptionService;
use crate::error::{PixeError, Result};
use crate::qr;
use crate::video::VideoBridge;

pub const CONTAINER_VERSION: &str = "1.0";

/// Name stamped on the metadata frame's record.
pub const METADATA_SOURCE: &str = "pixe.metadata";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub name: String,
    pub mime_type: String,
    pub size: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// Header record carried by frame 0 of every archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub total_chunks: usize,
    pub contents: Vec<ContentItem>,
    pub encrypted: bool,
    pub config_snapshot: crate::config::ConfigSnapshot,
}

#[derive(Debug, Clone)]
pub struct ConvertProgress {
    pub stage: &'static str,
    pub percentage: u8,
    pub message: String,
}

/// Orchestrates chunking, QR rendering and video assembly into `.pixe`
/// containers, and the reverse extraction path.
pub struct Archiver {
    config: Config,
    cipher: EncryptionService,
    bridge: VideoBridge,
}

impl Archiver {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let cipher = EncryptionService::new(config.pbkdf2_iterations);
        let bridge = VideoBridge::new()?;
        Ok(Self {
            config,
            cipher,
            bridge,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cipher(&self) -> &EncryptionService {
        &self.cipher
    }

    pub fn bridge(&self) -> &VideoBridge {
        &self.bridge
    }

    /// Encodes `input` (a file or a directory tree) into a `.pixe` archive.
    /// Inputs above the streaming threshold are routed through the streaming
    /// pipeline automatically.
    pub fn convert(
        &self,
        input: &Path,
        output: &Path,
        password: Option<&str>,
    ) -> Result<ArchiveMetadata> {
        self.convert_with_progress(input, output, password, &|_| {})
    }

    /// Forces the streaming pipeline regardless of input size.
    pub fn convert_streaming(
        &self,
        input: &Path,
        output: &Path,
        password: Option<&str>,
        progress: Option<&dyn Fn(crate::streaming::StreamProgress)>,
        cancel: Option<&crate::cancel::CancellationToken>,
    ) -> Result<ArchiveMetadata> {
        let files = collect_input_files(input)?;
        crate::streaming::StreamingProcessor::new(self)
            .convert(&files, output, password, progress, cancel)
    }

    pub fn convert_with_progress(
        &self,
        input: &Path,
        output: &Path,
        password: Option<&str>,
        progress: &dyn Fn(ConvertProgress),
    ) -> Result<ArchiveMetadata> {
        progress(ConvertProgress {
            stage: "analyze",
            percentage: 10,
            message: format!("scanning {input:?}"),
        });
        let files = collect_input_files(input)?;
        let total_bytes: u64 = files
            .iter()
            .map(|f| fs::metadata(f).map(|m| m.len()).unwrap_or(0))
            .sum();
        if total_bytes == 0 {
            return Err(PixeError::EmptyInput(input.to_path_buf()));
        }
        if total_bytes > STREAMING_THRESHOLD {
            return crate::streaming::StreamingProcessor::new(self).convert(
                &files,
                output,
                password,
                None,
                None,
            );
        }

        progress(ConvertProgress {
            stage: "process",
            percentage: 25,
            message: format!("processing {} file(s)", files.len()),
        });
        let mut all_chunks = Vec::new();
        let mut contents = Vec::new();
        for (i, file) in files.iter().enumerate() {
            let (chunks, item) = self.process_file(file, password, all_chunks.len())?;
            all_chunks.extend(chunks);
            contents.push(item);
            progress(ConvertProgress {
                stage: "process",
                percentage: (25 + (i + 1) * 30 / files.len()) as u8,
                message: format!("processed {:?}", file.file_name().unwrap_or_default()),
            });
        }
        if all_chunks.is_empty() {
            return Err(PixeError::EmptyInput(input.to_path_buf()));
        }
        let total = all_chunks.len();
        stamp_total(&mut all_chunks, total);

        let metadata = ArchiveMetadata {
            version: CONTAINER_VERSION.to_string(),
            created_at: Utc::now(),
            total_chunks: total,
            contents,
            encrypted: password.is_some(),
            config_snapshot: self.config.snapshot(),
        };

        progress(ConvertProgress {
            stage: "render",
            percentage: 60,
            message: format!("rendering {} QR frames", total + 1),
        });
        self.write_from_records(&metadata, &all_chunks, output)?;
        progress(ConvertProgress {
            stage: "complete",
            percentage: 100,
            message: format!("archive written to {output:?}"),
        });
        Ok(metadata)
    }

    /// Renders metadata plus data frames into a scratch directory and
    /// assembles the video. The scratch directory is removed on success and
    /// preserved for diagnosis when assembly fails.
    pub fn write_from_records(
        &self,
        metadata: &ArchiveMetadata,
        chunks: &[ChunkRecord],
        output: &Path,
    ) -> Result<()> {
        let scratch = Builder::new()
            .prefix("pixe-")
            .tempdir_in(&self.config.temp_dir)?;
        let result = self.render_and_assemble(metadata, chunks, scratch.path(), output);
        if let Err(e) = result {
            let kept = scratch.into_path();
            tracing::warn!("assembly failed, frames preserved at {:?}", kept);
            return Err(e);
        }
        Ok(())
    }

    fn render_and_assemble(
        &self,
        metadata: &ArchiveMetadata,
        chunks: &[ChunkRecord],
        scratch: &Path,
        output: &Path,
    ) -> Result<()> {
        let mut frame_paths = Vec::with_capacity(chunks.len() + 1);
        frame_paths.push(qr::encode_frame(&metadata_record(metadata)?, scratch, 0)?);
        for chunk in chunks {
            let frame_number = (chunk.index + 1) as usize;
            frame_paths.push(qr::encode_frame(chunk, scratch, frame_number)?);
        }
        self.bridge.assemble(
            &frame_paths,
            self.config.frame_rate,
            self.config.quality,
            output,
        )
    }

    fn process_file(
        &self,
        path: &Path,
        password: Option<&str>,
        index_offset: usize,
    ) -> Result<(Vec<ChunkRecord>, ContentItem)> {
        let raw = fs::read(path)?;
        let mime = mime_for_path(path);
        let hash = hex::encode(Sha256::digest(&raw));
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PixeError::InvalidPath(path.to_path_buf()))?
            .to_string();

        let item = ContentItem {
            name: name.clone(),
            mime_type: mime.to_string(),
            size: format_size(raw.len() as u64),
            hash: hash.clone(),
            created_at: Utc::now(),
        };
        let source = SourceInfo {
            name,
            mime_type: mime.to_string(),
            hash,
        };

        let payload = encode_payload(
            &raw,
            mime,
            self.config.compression_enabled,
            &self.cipher,
            password,
        )?;
        let chunker = Chunker::new(&self.config);
        let chunks = chunker.split(&payload, &source, password.is_some(), index_offset);
        Ok((chunks, item))
    }

    /// Reads frame 0 only.
    pub fn read_metadata(&self, archive: &Path) -> Result<ArchiveMetadata> {
        let frame_count = self.bridge.probe_frame_count(archive)?;
        if frame_count == 0 {
            return Err(PixeError::MissingMetadataFrame);
        }
        let record = self.bridge.extract_frame(archive, 0)?;
        parse_metadata(&record)
    }

    pub fn list_contents(&self, archive: &Path) -> Result<Vec<ContentItem>> {
        Ok(self.read_metadata(archive)?.contents)
    }

    /// Decodes every frame of an archive: the metadata record plus all data
    /// records sorted by chunk index. Undecodable frames are reported as
    /// `CorruptArchive`.
    pub fn read_all_records(&self, archive: &Path) -> Result<(ArchiveMetadata, Vec<ChunkRecord>)> {
        let scratch = Builder::new()
            .prefix("pixe-")
            .tempdir_in(&self.config.temp_dir)?;
        let frame_paths = self.bridge.extract_all(archive, scratch.path())?;

        let mut metadata = None;
        let mut records = Vec::new();
        let mut missing = Vec::new();
        for (frame_number, path) in frame_paths.iter().enumerate() {
            match qr::decode_frame(path) {
                Ok(record) if record.is_metadata() => metadata = Some(parse_metadata(&record)?),
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("frame {frame_number} undecodable: {e}");
                    missing.push(frame_number);
                }
            }
        }
        let Some(metadata) = metadata else {
            return Err(PixeError::MissingMetadataFrame);
        };
        if !missing.is_empty() {
            return Err(PixeError::CorruptArchive { missing });
        }
        // Decode order is not guaranteed; reassembly is driven by the index.
        records.sort_by_key(|r| r.index);
        if records.len() != metadata.total_chunks {
            let present: Vec<i64> = records.iter().map(|r| r.index).collect();
            let missing = (0..metadata.total_chunks)
                .filter(|i| !present.contains(&(*i as i64)))
                .map(|i| i + 1)
                .collect();
            return Err(PixeError::CorruptArchive { missing });
        }
        Ok((metadata, records))
    }

    /// Reconstructs the original files into `out_dir`. Returns the written
    /// paths in metadata order.
    pub fn extract(
        &self,
        archive: &Path,
        out_dir: &Path,
        password: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        let (metadata, records) = self.read_all_records(archive)?;
        if metadata.encrypted && password.is_none() {
            return Err(PixeError::EmptyPassword);
        }
        fs::create_dir_all(out_dir)?;

        let mut by_source: BTreeMap<&str, Vec<&ChunkRecord>> = BTreeMap::new();
        for record in &records {
            by_source.entry(&record.source_file).or_default().push(record);
        }

        let mut written = Vec::with_capacity(metadata.contents.len());
        for item in &metadata.contents {
            let chunks = by_source.remove(item.name.as_str()).unwrap_or_default();
            let bytes = reassemble_file(&chunks, item, &self.cipher, password)?;
            let actual = hex::encode(Sha256::digest(&bytes));
            if actual != item.hash {
                return Err(PixeError::Serialization(format!(
                    "content hash mismatch for {}: archive corrupt",
                    item.name
                )));
            }
            let out_path = out_dir.join(&item.name);
            fs::write(&out_path, &bytes)?;
            written.push(out_path);
        }
        Ok(written)
    }
}

pub(crate) fn metadata_record(metadata: &ArchiveMetadata) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: "metadata".to_string(),
        index: -1,
        total: metadata.total_chunks,
        data: serde_json::to_string(metadata)?,
        source_file: METADATA_SOURCE.to_string(),
        mime_type: "application/json".to_string(),
        hash: String::new(),
        encrypted: metadata.encrypted,
        created_at: metadata.created_at,
        segmented: false,
        extra: serde_json::Map::new(),
    })
}

fn parse_metadata(record: &ChunkRecord) -> Result<ArchiveMetadata> {
    if !record.is_metadata() {
        return Err(PixeError::MissingMetadataFrame);
    }
    let metadata: ArchiveMetadata = serde_json::from_str(&record.data)
        .map_err(|e| PixeError::Serialization(format!("metadata parse failed: {e}")))?;
    if metadata.version != CONTAINER_VERSION {
        return Err(PixeError::UnsupportedVersion(metadata.version));
    }
    Ok(metadata)
}

pub fn collect_input_files(input: &Path) -> Result<Vec<PathBuf>> {
    let meta = fs::metadata(input).map_err(|_| PixeError::InvalidPath(input.to_path_buf()))?;
    if meta.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files: Vec<PathBuf> = WalkDir::new(input)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(PixeError::EmptyInput(input.to_path_buf()));
    }
    Ok(files)
}

/// Transforms raw file bytes into the text-safe payload carried by data
/// frames: optional `GZ:` envelope, optional AEAD, base64 where needed.
/// Compression always runs before encryption.
pub fn encode_payload(
    raw: &[u8],
    mime: &str,
    compress_on: bool,
    cipher: &EncryptionService,
    password: Option<&str>,
) -> Result<String> {
    let compressed = if compress_on {
        Some(compress(raw)?)
    } else {
        None
    };
    let plaintext: &[u8] = match &compressed {
        Some(envelope) => envelope.as_bytes(),
        None => raw,
    };
    if let Some(password) = password {
        let encrypted = cipher.encrypt(plaintext, password)?;
        return Ok(general_purpose::STANDARD.encode(encrypted));
    }
    if let Some(envelope) = compressed {
        return Ok(envelope);
    }
    if is_text_mime(mime) {
        if let Ok(text) = std::str::from_utf8(raw) {
            return Ok(text.to_string());
        }
    }
    Ok(general_purpose::STANDARD.encode(raw))
}

/// Inverse of [`encode_payload`] for a whole-file payload.
pub fn decode_payload(
    payload: &str,
    mime: &str,
    encrypted: bool,
    cipher: &EncryptionService,
    password: Option<&str>,
) -> Result<Vec<u8>> {
    if encrypted {
        let password = password.ok_or(PixeError::EmptyPassword)?;
        let ciphertext = general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| PixeError::Serialization(format!("bad ciphertext encoding: {e}")))?;
        let plaintext = cipher.decrypt(&ciphertext, password)?;
        return Ok(decompress_if_needed(&plaintext));
    }
    if payload.starts_with(GZIP_MARKER) {
        return Ok(decompress_if_needed(payload.as_bytes()));
    }
    if is_text_mime(mime) {
        return Ok(payload.as_bytes().to_vec());
    }
    general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| PixeError::Serialization(format!("bad payload encoding: {e}")))
}

fn reassemble_file(
    chunks: &[&ChunkRecord],
    item: &ContentItem,
    cipher: &EncryptionService,
    password: Option<&str>,
) -> Result<Vec<u8>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    let mut chunks: Vec<&ChunkRecord> = chunks.to_vec();
    chunks.sort_by_key(|c| c.index);
    if chunks.iter().all(|c| c.segmented) {
        // Streaming archives: every chunk is an independently transformed
        // slice of the original bytes.
        let mut out = Vec::new();
        for chunk in chunks {
            let bytes = general_purpose::STANDARD
                .decode(&chunk.data)
                .map_err(|e| PixeError::Serialization(format!("bad chunk encoding: {e}")))?;
            let bytes = if chunk.encrypted {
                let password = password.ok_or(PixeError::EmptyPassword)?;
                cipher.decrypt(&bytes, password)?
            } else {
                bytes
            };
            out.extend_from_slice(&decompress_if_needed(&bytes));
        }
        return Ok(out);
    }
    let payload: String = chunks.iter().map(|c| c.data.as_str()).collect();
    let encrypted = chunks.iter().any(|c| c.encrypted);
    let bytes = decode_payload(&payload, &item.mime_type, encrypted, cipher, password)?;
    if !encrypted && is_text_mime(&item.mime_type) {
        // A text-typed source that was not valid UTF-8 went to base64 at
        // encode time; the content hash tells the two layouts apart.
        if hex::encode(Sha256::digest(&bytes)) != item.hash {
            if let Ok(alt) = general_purpose::STANDARD.decode(payload.trim()) {
                if hex::encode(Sha256::digest(&alt)) == item.hash {
                    return Ok(alt);
                }
            }
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;

    fn cipher() -> EncryptionService {
        EncryptionService::new(1000)
    }

    fn sample_metadata() -> ArchiveMetadata {
        ArchiveMetadata {
            version: CONTAINER_VERSION.to_string(),
            created_at: Utc::now(),
            total_chunks: 2,
            contents: vec![ContentItem {
                name: "a.txt".to_string(),
                mime_type: "text/plain".to_string(),
                size: "12 B".to_string(),
                hash: "00".repeat(32),
                created_at: Utc::now(),
            }],
            encrypted: false,
            config_snapshot: ConfigSnapshot {
                chunk_size: 2900,
                quality: 23,
                frame_rate: 2.0,
                encryption_enabled: false,
                compression_enabled: false,
            },
        }
    }

    #[test]
    fn payload_roundtrip_text() {
        let raw = b"hello, pixe\n";
        let payload = encode_payload(raw, "text/plain", false, &cipher(), None).unwrap();
        assert_eq!(payload, "hello, pixe\n");
        let decoded = decode_payload(&payload, "text/plain", false, &cipher(), None).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn payload_roundtrip_binary() {
        let raw: Vec<u8> = (0u8..=255).collect();
        let payload =
            encode_payload(&raw, "application/octet-stream", false, &cipher(), None).unwrap();
        let decoded =
            decode_payload(&payload, "application/octet-stream", false, &cipher(), None).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn payload_roundtrip_compressed_and_encrypted() {
        let svc = cipher();
        let raw = b"repetitive repetitive repetitive payload".repeat(50);
        let payload = encode_payload(&raw, "text/plain", true, &svc, Some("pw")).unwrap();
        let decoded = decode_payload(&payload, "text/plain", true, &svc, Some("pw")).unwrap();
        assert_eq!(decoded, raw);
        assert!(matches!(
            decode_payload(&payload, "text/plain", true, &svc, Some("other")),
            Err(PixeError::AuthenticationFailed)
        ));
    }

    #[test]
    fn payload_text_with_accidental_marker_survives() {
        let raw = b"GZ:this is just text, not an envelope";
        let payload = encode_payload(raw, "text/plain", false, &cipher(), None).unwrap();
        let decoded = decode_payload(&payload, "text/plain", false, &cipher(), None).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn encrypted_payload_needs_password() {
        let svc = cipher();
        let payload = encode_payload(b"secret", "text/plain", false, &svc, Some("pw")).unwrap();
        assert!(matches!(
            decode_payload(&payload, "text/plain", true, &svc, None),
            Err(PixeError::EmptyPassword)
        ));
    }

    #[test]
    fn metadata_record_roundtrip() {
        let metadata = sample_metadata();
        let record = metadata_record(&metadata).unwrap();
        assert!(record.is_metadata());
        assert_eq!(record.source_file, METADATA_SOURCE);
        let parsed = parse_metadata(&record).unwrap();
        assert_eq!(parsed.total_chunks, 2);
        assert_eq!(parsed.contents[0].name, "a.txt");
    }

    #[test]
    fn unknown_container_version_is_rejected() {
        let mut metadata = sample_metadata();
        metadata.version = "9.9".to_string();
        let record = metadata_record(&metadata).unwrap();
        assert!(matches!(
            parse_metadata(&record),
            Err(PixeError::UnsupportedVersion(v)) if v == "9.9"
        ));
    }

    #[test]
    fn reassembles_out_of_order_chunks() {
        let svc = cipher();
        let cfg = Config {
            chunk_size: 210,
            ..Config::default()
        };
        let chunker = Chunker::new(&cfg);
        let source = SourceInfo {
            name: "data.txt".to_string(),
            mime_type: "text/plain".to_string(),
            hash: "abcd1234".to_string(),
        };
        let text = "0123456789".repeat(5);
        let mut chunks = chunker.split(&text, &source, false, 0);
        let total = chunks.len();
        stamp_total(&mut chunks, total);
        assert!(chunks.len() > 1);
        chunks.reverse();
        let refs: Vec<&ChunkRecord> = chunks.iter().collect();
        let item = ContentItem {
            name: "data.txt".to_string(),
            mime_type: "text/plain".to_string(),
            size: format_size(text.len() as u64),
            hash: hex::encode(Sha256::digest(text.as_bytes())),
            created_at: Utc::now(),
        };
        let bytes = reassemble_file(&refs, &item, &svc, None).unwrap();
        assert_eq!(bytes, text.as_bytes());
    }

    #[test]
    fn text_typed_binary_falls_back_to_base64_layout() {
        let svc = cipher();
        let raw = [0xff, 0xfe, 0x00, 0x41, 0x42];
        let payload = encode_payload(&raw, "text/plain", false, &svc, None).unwrap();
        let cfg = Config {
            chunk_size: 210,
            ..Config::default()
        };
        let source = SourceInfo {
            name: "weird.txt".to_string(),
            mime_type: "text/plain".to_string(),
            hash: hex::encode(Sha256::digest(raw)),
        };
        let mut chunks = Chunker::new(&cfg).split(&payload, &source, false, 0);
        let total = chunks.len();
        stamp_total(&mut chunks, total);
        let refs: Vec<&ChunkRecord> = chunks.iter().collect();
        let item = ContentItem {
            name: "weird.txt".to_string(),
            mime_type: "text/plain".to_string(),
            size: format_size(raw.len() as u64),
            hash: hex::encode(Sha256::digest(raw)),
            created_at: Utc::now(),
        };
        assert_eq!(reassemble_file(&refs, &item, &svc, None).unwrap(), raw);
    }
}
