mod archive;
mod cancel;
mod chunk;
mod compress;
mod config;
mod crypto;
mod error;
mod qr;
mod streaming;
mod verify;
mod video;

pub use archive::{
    collect_input_files, decode_payload, encode_payload, ArchiveMetadata, Archiver, ContentItem,
    ConvertProgress, CONTAINER_VERSION, METADATA_SOURCE,
};
pub use cancel::CancellationToken;
pub use chunk::{
    format_size, is_text_mime, mime_for_path, raw_slice_capacity, stamp_total, ChunkRecord,
    Chunker, SourceInfo,
};
pub use compress::{compress, decompress, decompress_if_needed, GZIP_MARKER};
pub use config::{Config, ConfigSnapshot, ENVELOPE_RESERVE, STREAMING_THRESHOLD};
pub use crypto::{password_fingerprint, random_password, EncryptionService};
pub use error::{PixeError, Result};
pub use qr::{decode_frame, encode_frame, frame_file_name, FRAME_SIZE};
pub use streaming::{StreamProgress, StreamingProcessor, READ_INCREMENT};
pub use verify::{
    FrameFailure, IntegrityVerifier, Verdict, VerifyProgress, VerifyReport,
};
pub use video::{VideoBridge, ASSEMBLE_TIMEOUT, SEEK_TIMEOUT};
