use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single edit transforming one archive state into the next.
/// `frame_index` is the 0-based chunk index the operation applies to.
/// Unknown operation tags fail decoding and surface as a corrupt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOp {
    Insert {
        frame_index: u64,
        new_hash: String,
        /// Serialized chunk record carrying the inserted frame's payload.
        chunk_payload: Option<String>,
    },
    Delete {
        frame_index: u64,
        old_hash: String,
    },
    Replace {
        frame_index: u64,
        old_hash: String,
        new_hash: String,
        chunk_payload: Option<String>,
    },
    /// The whole artifact was replaced; `new_hash` is the SHA-256 of the new
    /// artifact file. The payload lives at the version's
    /// `delta_artifact_path`.
    ReplaceAll { new_hash: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: u64,
    /// Absent on the base version.
    pub parent_version: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub delta_artifact_path: PathBuf,
    pub operations: Vec<DeltaOp>,
    pub message: String,
    pub author: String,
    pub frame_count: usize,
}

/// The persisted version log of one archive. Records are append-only;
/// `branches` points into `versions` by number, never by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedArchive {
    pub archive_id: String,
    pub base_artifact_path: PathBuf,
    pub head_version: u64,
    pub versions: Vec<VersionRecord>,
    pub branches: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VersionedArchive {
    pub fn record(&self, version: u64) -> Option<&VersionRecord> {
        self.versions.iter().find(|r| r.version == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_op_tags_roundtrip() {
        let op = DeltaOp::Replace {
            frame_index: 3,
            old_hash: "aa".to_string(),
            new_hash: "bb".to_string(),
            chunk_payload: None,
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains(r#""op":"replace""#));
        assert_eq!(serde_json::from_str::<DeltaOp>(&json).unwrap(), op);
    }

    #[test]
    fn unknown_op_tag_fails_to_decode() {
        let json = r#"{"op":"teleport","frame_index":0}"#;
        assert!(serde_json::from_str::<DeltaOp>(json).is_err());
    }
}
