use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use pixe_core::{Archiver, ChunkRecord};

use crate::error::{DeltaError, Result};
use crate::types::{DeltaOp, VersionRecord, VersionedArchive};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// No history existed; version 1 now points at the given artifact.
    BaseInitialized { version: u64 },
    /// A delta version was appended.
    Appended { version: u64 },
}

/// Persists an ordered version log per archive under
/// `<delta_dir>/<archive_id>.versions`. Appends are serialized by an
/// exclusive file lock; the log itself is rewritten atomically.
pub struct DeltaManager {
    delta_dir: PathBuf,
}

impl DeltaManager {
    pub fn new(delta_dir: impl Into<PathBuf>) -> Result<Self> {
        let delta_dir = delta_dir.into();
        fs::create_dir_all(&delta_dir)?;
        Ok(Self { delta_dir })
    }

    fn log_path(&self, archive_id: &str) -> PathBuf {
        let name: String = archive_id
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        self.delta_dir.join(format!("{name}.versions"))
    }

    pub fn create_version(
        &self,
        archive_id: &str,
        new_artifact: &Path,
        message: &str,
        author: &str,
    ) -> Result<CreateOutcome> {
        let lock_path = self.log_path(archive_id).with_extension("versions.lock");
        let lock = File::create(&lock_path)?;
        lock.lock_exclusive()?;
        let outcome = self.create_version_locked(archive_id, new_artifact, message, author);
        fs2::FileExt::unlock(&lock)?;
        outcome
    }

    fn create_version_locked(
        &self,
        archive_id: &str,
        new_artifact: &Path,
        message: &str,
        author: &str,
    ) -> Result<CreateOutcome> {
        let now = Utc::now();
        match self.load(archive_id) {
            Err(DeltaError::HistoryNotFound(_)) => {
                let base = VersionRecord {
                    version: 1,
                    parent_version: None,
                    timestamp: now,
                    delta_artifact_path: new_artifact.to_path_buf(),
                    operations: Vec::new(),
                    message: message.to_string(),
                    author: author.to_string(),
                    frame_count: 0,
                };
                let archive = VersionedArchive {
                    archive_id: archive_id.to_string(),
                    base_artifact_path: new_artifact.to_path_buf(),
                    head_version: 1,
                    versions: vec![base],
                    branches: BTreeMap::from([("main".to_string(), 1)]),
                    created_at: now,
                    updated_at: now,
                };
                self.save(&archive)?;
                Ok(CreateOutcome::BaseInitialized { version: 1 })
            }
            Err(e) => Err(e),
            Ok(mut archive) => {
                let version = archive.head_version + 1;
                let parent_timestamp = archive
                    .record(archive.head_version)
                    .map(|r| r.timestamp)
                    .unwrap_or(now);
                let operations = compute_delta(new_artifact)?;
                let record = VersionRecord {
                    version,
                    parent_version: Some(archive.head_version),
                    // Clock skew must not break timestamp monotonicity.
                    timestamp: now.max(parent_timestamp),
                    delta_artifact_path: new_artifact.to_path_buf(),
                    frame_count: operations.len(),
                    operations,
                    message: message.to_string(),
                    author: author.to_string(),
                };
                archive.versions.push(record);
                archive.head_version = version;
                archive.branches.insert("main".to_string(), version);
                archive.updated_at = now;
                self.save(&archive)?;
                Ok(CreateOutcome::Appended { version })
            }
        }
    }

    pub fn load(&self, archive_id: &str) -> Result<VersionedArchive> {
        let path = self.log_path(archive_id);
        let data = fs::read_to_string(&path)
            .map_err(|_| DeltaError::HistoryNotFound(archive_id.to_string()))?;
        let archive: VersionedArchive = serde_json::from_str(&data)
            .map_err(|e| DeltaError::CorruptVersionLog(e.to_string()))?;
        validate(&archive)?;
        Ok(archive)
    }

    fn save(&self, archive: &VersionedArchive) -> Result<()> {
        let path = self.log_path(&archive.archive_id);
        let mut tmp = NamedTempFile::new_in(&self.delta_dir)?;
        tmp.write_all(
            serde_json::to_string_pretty(archive)
                .map_err(|e| DeltaError::CorruptVersionLog(e.to_string()))?
                .as_bytes(),
        )?;
        tmp.persist(&path).map_err(|e| DeltaError::Io(e.error))?;
        Ok(())
    }

    pub fn list_versions(&self, archive_id: &str) -> Result<Vec<VersionRecord>> {
        Ok(self.load(archive_id)?.versions)
    }

    pub fn list_branches(&self, archive_id: &str) -> Result<BTreeMap<String, u64>> {
        Ok(self.load(archive_id)?.branches)
    }

    /// Flattened operations over the half-open range `(from, to]`.
    pub fn get_version_diff(
        &self,
        archive_id: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<DeltaOp>> {
        let archive = self.load(archive_id)?;
        for endpoint in [from, to] {
            if endpoint == 0 || endpoint > archive.head_version {
                return Err(DeltaError::VersionOutOfRange {
                    version: endpoint,
                    head: archive.head_version,
                });
            }
        }
        if from > to {
            return Err(DeltaError::VersionOutOfRange {
                version: from,
                head: to,
            });
        }
        Ok(archive
            .versions
            .iter()
            .filter(|r| r.version > from && r.version <= to)
            .flat_map(|r| r.operations.iter().cloned())
            .collect())
    }

    pub fn create_branch(&self, archive_id: &str, name: &str, from_version: u64) -> Result<()> {
        let lock_path = self.log_path(archive_id).with_extension("versions.lock");
        let lock = File::create(&lock_path)?;
        lock.lock_exclusive()?;
        let result = (|| {
            let mut archive = self.load(archive_id)?;
            if archive.branches.contains_key(name) {
                return Err(DeltaError::BranchExists(name.to_string()));
            }
            if from_version == 0 || from_version > archive.head_version {
                return Err(DeltaError::VersionOutOfRange {
                    version: from_version,
                    head: archive.head_version,
                });
            }
            archive.branches.insert(name.to_string(), from_version);
            archive.updated_at = Utc::now();
            self.save(&archive)
        })();
        fs2::FileExt::unlock(&lock)?;
        result
    }

    /// Replays versions `2..=version` onto the base artifact and materializes
    /// the result as a read-only copy under the delta directory. The head is
    /// never mutated. Frame-level operations need `archiver` to decode and
    /// re-encode the working artifact; `replace_all` logs replay without one.
    pub fn reconstruct_version(
        &self,
        archive_id: &str,
        version: u64,
        archiver: Option<&Archiver>,
    ) -> Result<PathBuf> {
        let archive = self.load(archive_id)?;
        if version == 0 || version > archive.head_version {
            return Err(DeltaError::VersionOutOfRange {
                version,
                head: archive.head_version,
            });
        }
        if version == 1 {
            return Ok(archive.base_artifact_path.clone());
        }

        let scratch = self.delta_dir.join("reconstructed");
        fs::create_dir_all(&scratch)?;

        let mut working = archive.base_artifact_path.clone();
        let mut generation = 0usize;
        for record in archive
            .versions
            .iter()
            .filter(|r| r.version > 1 && r.version <= version)
        {
            let mut pending_frame_ops: Vec<&DeltaOp> = Vec::new();
            for op in &record.operations {
                match op {
                    DeltaOp::ReplaceAll { .. } => {
                        working = record.delta_artifact_path.clone();
                        pending_frame_ops.clear();
                    }
                    other => pending_frame_ops.push(other),
                }
            }
            if !pending_frame_ops.is_empty() {
                let Some(archiver) = archiver else {
                    return Err(DeltaError::ReplayNeedsArchiver);
                };
                generation += 1;
                let out = scratch.join(format!(
                    "{}-v{}-g{}.pixe",
                    sanitize(archive_id),
                    record.version,
                    generation
                ));
                apply_frame_ops(archiver, &working, &pending_frame_ops, &out)?;
                working = out;
            }
        }

        let materialized = scratch.join(format!("{}-v{}.pixe", sanitize(archive_id), version));
        fs::copy(&working, &materialized)?;
        tracing::debug!("materialized {archive_id} v{version} at {:?}", materialized);
        Ok(materialized)
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// MVP diff policy: the whole artifact is recorded as one `replace_all`
/// referencing the new content hash. The log format accommodates finer
/// `insert`/`delete`/`replace` operations; see `apply_frame_ops`.
fn compute_delta(new_artifact: &Path) -> Result<Vec<DeltaOp>> {
    Ok(vec![DeltaOp::ReplaceAll {
        new_hash: hash_file(new_artifact)?,
    }])
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Applies frame-granular operations by decoding the working artifact,
/// editing the chunk list and re-encoding the result.
fn apply_frame_ops(
    archiver: &Archiver,
    working: &Path,
    ops: &[&DeltaOp],
    out: &Path,
) -> Result<()> {
    let (mut metadata, mut records) = archiver.read_all_records(working)?;
    for op in ops {
        match op {
            DeltaOp::Insert {
                frame_index,
                chunk_payload,
                ..
            } => {
                let chunk = parse_payload(chunk_payload)?;
                let at = (*frame_index as usize).min(records.len());
                records.insert(at, chunk);
            }
            DeltaOp::Delete { frame_index, .. } => {
                let at = *frame_index as usize;
                if at >= records.len() {
                    return Err(DeltaError::CorruptVersionLog(format!(
                        "delete of frame {frame_index} beyond {} chunks",
                        records.len()
                    )));
                }
                records.remove(at);
            }
            DeltaOp::Replace {
                frame_index,
                chunk_payload,
                ..
            } => {
                let at = *frame_index as usize;
                if at >= records.len() {
                    return Err(DeltaError::CorruptVersionLog(format!(
                        "replace of frame {frame_index} beyond {} chunks",
                        records.len()
                    )));
                }
                records[at] = parse_payload(chunk_payload)?;
            }
            DeltaOp::ReplaceAll { .. } => unreachable!("handled by the caller"),
        }
    }
    for (i, record) in records.iter_mut().enumerate() {
        record.index = i as i64;
        record.total = 0;
    }
    let total = records.len();
    pixe_core::stamp_total(&mut records, total);
    metadata.total_chunks = total;
    archiver.write_from_records(&metadata, &records, out)?;
    Ok(())
}

fn parse_payload(payload: &Option<String>) -> Result<ChunkRecord> {
    let Some(payload) = payload else {
        return Err(DeltaError::CorruptVersionLog(
            "insert/replace operation without chunk payload".to_string(),
        ));
    };
    serde_json::from_str(payload)
        .map_err(|e| DeltaError::CorruptVersionLog(format!("bad chunk payload: {e}")))
}

fn validate(archive: &VersionedArchive) -> Result<()> {
    let mut expected = 1u64;
    for record in &archive.versions {
        if record.version != expected {
            return Err(DeltaError::CorruptVersionLog(format!(
                "version {} out of sequence (expected {expected})",
                record.version
            )));
        }
        match (record.version, record.parent_version) {
            (1, None) => {}
            (v, Some(p)) if p == v - 1 => {}
            (v, p) => {
                return Err(DeltaError::CorruptVersionLog(format!(
                    "version {v} has invalid parent {p:?}"
                )))
            }
        }
        expected += 1;
    }
    if archive.head_version != archive.versions.len() as u64 {
        return Err(DeltaError::CorruptVersionLog(format!(
            "head {} does not match {} recorded versions",
            archive.head_version,
            archive.versions.len()
        )));
    }
    for (name, target) in &archive.branches {
        if *target == 0 || *target > archive.head_version {
            return Err(DeltaError::CorruptVersionLog(format!(
                "branch {name} points at missing version {target}"
            )));
        }
    }
    Ok(())
}
