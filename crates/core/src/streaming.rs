use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tempfile::Builder;

use crate::archive::{metadata_record, ArchiveMetadata, Archiver, ContentItem, CONTAINER_VERSION};
use crate::cancel::CancellationToken;
use crate::chunk::{format_size, mime_for_path, raw_slice_capacity, ChunkRecord, Chunker, SourceInfo};
use crate::compress::compress;
use crate::error::{PixeError, Result};
use crate::qr;

/// Default read increment: 1 MiB.
pub const READ_INCREMENT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StreamProgress {
    pub bytes_read: u64,
    pub bytes_total: u64,
    pub chunk_index: usize,
    pub chunk_total_estimate: usize,
}

/// Runs the encode pipeline with bounded memory: the resident set stays at
/// one read increment plus one chunk, independent of input size. Each chunk
/// is transformed on its own so decoding needs no whole-file buffer either.
pub struct StreamingProcessor<'a> {
    archiver: &'a Archiver,
    read_increment: usize,
}

struct FilePlan {
    path: PathBuf,
    source: SourceInfo,
    size: u64,
    chunk_count: usize,
}

impl<'a> StreamingProcessor<'a> {
    pub fn new(archiver: &'a Archiver) -> Self {
        Self {
            archiver,
            read_increment: READ_INCREMENT,
        }
    }

    pub fn with_read_increment(mut self, bytes: usize) -> Self {
        self.read_increment = bytes.max(1);
        self
    }

    /// Streams `files` into an archive at `output`. Chunk totals are exact:
    /// a first pass hashes and sizes every file, the second pass transforms
    /// and renders, so no frame needs re-stamping.
    pub fn convert(
        &self,
        files: &[PathBuf],
        output: &Path,
        password: Option<&str>,
        progress: Option<&dyn Fn(StreamProgress)>,
        cancel: Option<&CancellationToken>,
    ) -> Result<ArchiveMetadata> {
        let config = self.archiver.config();
        let raw_slice = raw_slice_capacity(config.effective_chunk_size(), password.is_some());

        let mut plans = Vec::with_capacity(files.len());
        let mut contents = Vec::with_capacity(files.len());
        let mut total_chunks = 0usize;
        let mut bytes_total = 0u64;
        for path in files {
            let plan = self.scan_file(path, raw_slice)?;
            contents.push(ContentItem {
                name: plan.source.name.clone(),
                mime_type: plan.source.mime_type.clone(),
                size: format_size(plan.size),
                hash: plan.source.hash.clone(),
                created_at: Utc::now(),
            });
            total_chunks += plan.chunk_count;
            bytes_total += plan.size;
            plans.push(plan);
        }
        if total_chunks == 0 {
            return Err(PixeError::EmptyInput(
                files.first().cloned().unwrap_or_default(),
            ));
        }

        let metadata = ArchiveMetadata {
            version: CONTAINER_VERSION.to_string(),
            created_at: Utc::now(),
            total_chunks,
            contents,
            encrypted: password.is_some(),
            config_snapshot: config.snapshot(),
        };

        let scratch = Builder::new()
            .prefix("pixe-")
            .tempdir_in(&config.temp_dir)?;
        let result = self.encode_all(
            &plans,
            &metadata,
            raw_slice,
            total_chunks,
            bytes_total,
            password,
            progress,
            cancel,
            scratch.path(),
            output,
        );
        match result {
            Ok(()) => Ok(metadata),
            Err(PixeError::Cancelled) => {
                // Scratch is dropped; partial outputs must not survive.
                let _ = fs::remove_file(output);
                Err(PixeError::Cancelled)
            }
            Err(e) => {
                let kept = scratch.into_path();
                tracing::warn!("streaming encode failed, frames preserved at {:?}", kept);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_all(
        &self,
        plans: &[FilePlan],
        metadata: &ArchiveMetadata,
        raw_slice: usize,
        total_chunks: usize,
        bytes_total: u64,
        password: Option<&str>,
        progress: Option<&dyn Fn(StreamProgress)>,
        cancel: Option<&CancellationToken>,
        scratch: &Path,
        output: &Path,
    ) -> Result<()> {
        let mut frame_paths = Vec::with_capacity(total_chunks + 1);
        frame_paths.push(qr::encode_frame(&metadata_record(metadata)?, scratch, 0)?);

        let mut index = 0usize;
        let mut bytes_read = 0u64;
        for plan in plans {
            let emitted = self.stream_file(
                plan,
                raw_slice,
                total_chunks,
                password,
                index,
                &mut |chunk| {
                    let frame_number = (chunk.index + 1) as usize;
                    frame_paths.push(qr::encode_frame(&chunk, scratch, frame_number)?);
                    Ok(())
                },
                &mut bytes_read,
                bytes_total,
                progress,
                cancel,
            )?;
            if emitted != plan.chunk_count {
                return Err(PixeError::Io(std::io::Error::other(format!(
                    "{:?} changed during streaming: expected {} chunks, emitted {}",
                    plan.path, plan.chunk_count, emitted
                ))));
            }
            index += emitted;
        }

        // Pushed in frame order: metadata first, then chunks by index.
        self.archiver.bridge().assemble(
            &frame_paths,
            self.archiver.config().frame_rate,
            self.archiver.config().quality,
            output,
        )
    }

    /// First pass: size, MIME and running SHA-256 of the original bytes.
    fn scan_file(&self, path: &Path, raw_slice: usize) -> Result<FilePlan> {
        let meta =
            fs::metadata(path).map_err(|_| PixeError::InvalidPath(path.to_path_buf()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PixeError::InvalidPath(path.to_path_buf()))?
            .to_string();

        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.read_increment];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let size = meta.len();
        Ok(FilePlan {
            path: path.to_path_buf(),
            source: SourceInfo {
                name,
                mime_type: mime_for_path(path).to_string(),
                hash: hex::encode(hasher.finalize()),
            },
            size,
            chunk_count: (size as usize).div_ceil(raw_slice.max(1)),
        })
    }

    /// Second pass: read in increments, cut raw slices, transform each slice
    /// independently, hand the finished chunk to `emit`.
    #[allow(clippy::too_many_arguments)]
    fn stream_file(
        &self,
        plan: &FilePlan,
        raw_slice: usize,
        total_chunks: usize,
        password: Option<&str>,
        index_offset: usize,
        emit: &mut dyn FnMut(ChunkRecord) -> Result<()>,
        bytes_read: &mut u64,
        bytes_total: u64,
        progress: Option<&dyn Fn(StreamProgress)>,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        let config = self.archiver.config();
        let chunker = Chunker::new(config);
        let mut file = File::open(&plan.path)?;
        let mut buf = vec![0u8; self.read_increment];
        let mut pending: Vec<u8> = Vec::with_capacity(raw_slice * 2);
        let mut emitted = 0usize;

        loop {
            let n = file.read(&mut buf)?;
            if n > 0 {
                *bytes_read += n as u64;
                pending.extend_from_slice(&buf[..n]);
            }
            let eof = n == 0;
            while pending.len() >= raw_slice || (eof && !pending.is_empty()) {
                if let Some(token) = cancel {
                    token.check()?;
                }
                let take = raw_slice.min(pending.len());
                let slice: Vec<u8> = pending.drain(..take).collect();
                let data = self.transform_slice(&slice, password)?;
                let index = index_offset + emitted;
                let mut chunk = chunker.single(&data, &plan.source, password.is_some(), index);
                chunk.total = total_chunks;
                emit(chunk)?;
                emitted += 1;
                if let Some(report) = progress {
                    report(StreamProgress {
                        bytes_read: *bytes_read,
                        bytes_total,
                        chunk_index: index,
                        chunk_total_estimate: total_chunks,
                    });
                }
            }
            if eof {
                break;
            }
        }
        Ok(emitted)
    }

    /// `[GZ: envelope when it helps] -> [AEAD] -> base64`, sized so the
    /// result fits the QR payload budget.
    fn transform_slice(&self, slice: &[u8], password: Option<&str>) -> Result<String> {
        let config = self.archiver.config();
        let compressed = if config.compression_enabled {
            let envelope = compress(slice)?;
            (envelope.len() < slice.len()).then(|| envelope.into_bytes())
        } else {
            None
        };
        let plaintext: &[u8] = compressed.as_deref().unwrap_or(slice);
        let bytes = match password {
            Some(password) => self.archiver.cipher().encrypt(plaintext, password)?,
            None => plaintext.to_vec(),
        };
        Ok(general_purpose::STANDARD.encode(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archiver;
    use crate::config::Config;

    fn archiver() -> Archiver {
        let dir = tempfile::tempdir().unwrap().into_path();
        Archiver::new(Config {
            temp_dir: dir.join("tmp"),
            output_dir: dir.join("out"),
            pbkdf2_iterations: 1000,
            ..Config::default()
        })
        .unwrap()
    }

    #[test]
    fn scan_plans_exact_chunk_counts() {
        let archiver = archiver();
        let sp = StreamingProcessor::new(&archiver).with_read_increment(1024);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![7u8; 10_000]).unwrap();

        let raw_slice = 4096usize;
        let plan = sp.scan_file(&path, raw_slice).unwrap();
        assert_eq!(plan.chunk_count, 3);
        assert_eq!(plan.size, 10_000);
        assert_eq!(
            plan.source.hash,
            hex::encode(Sha256::digest(vec![7u8; 10_000]))
        );
    }

    #[test]
    fn streamed_chunks_reassemble_to_original() {
        let archiver = archiver();
        let sp = StreamingProcessor::new(&archiver).with_read_increment(512);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let original: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &original).unwrap();

        let raw_slice = 900usize;
        let plan = sp.scan_file(&path, raw_slice).unwrap();
        let mut chunks = Vec::new();
        let mut bytes_read = 0u64;
        let emitted = sp
            .stream_file(
                &plan,
                raw_slice,
                plan.chunk_count,
                None,
                0,
                &mut |chunk| {
                    chunks.push(chunk);
                    Ok(())
                },
                &mut bytes_read,
                plan.size,
                None,
                None,
            )
            .unwrap();
        assert_eq!(emitted, plan.chunk_count);
        assert_eq!(bytes_read, plan.size);

        let mut out = Vec::new();
        for chunk in &chunks {
            assert!(chunk.segmented);
            let bytes = general_purpose::STANDARD.decode(&chunk.data).unwrap();
            out.extend_from_slice(&bytes);
        }
        assert_eq!(out, original);
    }

    #[test]
    fn progress_is_monotonic_and_cancellation_stops_early() {
        let archiver = archiver();
        let sp = StreamingProcessor::new(&archiver).with_read_increment(256);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, vec![1u8; 8192]).unwrap();

        let raw_slice = 512usize;
        let plan = sp.scan_file(&path, raw_slice).unwrap();

        let seen = std::cell::RefCell::new(Vec::new());
        let report = |p: StreamProgress| seen.borrow_mut().push(p.bytes_read);
        let mut bytes_read = 0u64;
        sp.stream_file(
            &plan,
            raw_slice,
            plan.chunk_count,
            None,
            0,
            &mut |_| Ok(()),
            &mut bytes_read,
            plan.size,
            Some(&report),
            None,
        )
        .unwrap();
        let seen = seen.into_inner();
        assert_eq!(seen.len(), plan.chunk_count);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));

        let token = CancellationToken::new();
        token.cancel();
        let mut bytes_read = 0u64;
        let err = sp
            .stream_file(
                &plan,
                raw_slice,
                plan.chunk_count,
                None,
                0,
                &mut |_| Ok(()),
                &mut bytes_read,
                plan.size,
                None,
                Some(&token),
            )
            .unwrap_err();
        assert!(matches!(err, PixeError::Cancelled));
    }

    #[test]
    fn encrypted_slices_fit_the_qr_budget() {
        let archiver = archiver();
        let sp = StreamingProcessor::new(&archiver);
        let effective = archiver.config().effective_chunk_size();
        let raw_slice = raw_slice_capacity(effective, true);
        let slice = vec![42u8; raw_slice];
        let data = sp.transform_slice(&slice, Some("pw")).unwrap();
        assert!(data.len() <= effective);
    }
}
