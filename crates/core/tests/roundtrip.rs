use pixe_core::{
    decode_frame, decode_payload, encode_frame, encode_payload, stamp_total, ChunkRecord, Chunker,
    Config, EncryptionService, SourceInfo,
};
use sha2::{Digest, Sha256};

fn test_config(chunk_size: usize) -> Config {
    let dir = tempfile::tempdir().unwrap().into_path();
    Config {
        chunk_size,
        temp_dir: dir.join("tmp"),
        output_dir: dir.join("out"),
        pbkdf2_iterations: 1000,
        ..Config::default()
    }
}

fn encode_file(
    raw: &[u8],
    name: &str,
    mime: &str,
    config: &Config,
    cipher: &EncryptionService,
    password: Option<&str>,
    index_offset: usize,
) -> Vec<ChunkRecord> {
    let source = SourceInfo {
        name: name.to_string(),
        mime_type: mime.to_string(),
        hash: hex::encode(Sha256::digest(raw)),
    };
    let payload = encode_payload(raw, mime, config.compression_enabled, cipher, password).unwrap();
    Chunker::new(config).split(&payload, &source, password.is_some(), index_offset)
}

fn decode_file(
    chunks: &[ChunkRecord],
    mime: &str,
    cipher: &EncryptionService,
    password: Option<&str>,
) -> Vec<u8> {
    let payload: String = chunks.iter().map(|c| c.data.as_str()).collect();
    let encrypted = chunks.iter().any(|c| c.encrypted);
    decode_payload(&payload, mime, encrypted, cipher, password).unwrap()
}

#[test]
fn text_file_survives_chunk_and_frame_roundtrip() {
    let config = test_config(500);
    let cipher = EncryptionService::new(config.pbkdf2_iterations);
    let raw = "line one\nline two\nline three\n".repeat(40);

    let mut chunks = encode_file(raw.as_bytes(), "notes.txt", "text/plain", &config, &cipher, None, 0);
    let total = chunks.len();
    stamp_total(&mut chunks, total);
    assert!(chunks.len() > 1);

    // Through the QR layer and back, one frame per chunk.
    let dir = tempfile::tempdir().unwrap();
    let mut decoded = Vec::new();
    for chunk in &chunks {
        let frame = encode_frame(chunk, dir.path(), (chunk.index + 1) as usize).unwrap();
        decoded.push(decode_frame(&frame).unwrap());
    }
    // Frames decode in arbitrary order in practice; the index restores it.
    decoded.reverse();
    decoded.sort_by_key(|c| c.index);
    assert_eq!(decoded, chunks);

    assert_eq!(decode_file(&decoded, "text/plain", &cipher, None), raw.as_bytes());
}

#[test]
fn binary_file_roundtrip() {
    let config = test_config(600);
    let cipher = EncryptionService::new(config.pbkdf2_iterations);
    let raw: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 256) as u8).collect();

    let mut chunks = encode_file(
        &raw,
        "blob.bin",
        "application/octet-stream",
        &config,
        &cipher,
        None,
        0,
    );
    let total = chunks.len();
    stamp_total(&mut chunks, total);
    assert_eq!(
        decode_file(&chunks, "application/octet-stream", &cipher, None),
        raw
    );
}

#[test]
fn encrypted_roundtrip_rejects_wrong_password() {
    let config = test_config(800);
    let cipher = EncryptionService::new(config.pbkdf2_iterations);
    let raw = b"the archive holds twelve secrets".repeat(30);

    let mut chunks = encode_file(
        &raw,
        "secrets.txt",
        "text/plain",
        &config,
        &cipher,
        Some("correct horse"),
        0,
    );
    let total = chunks.len();
    stamp_total(&mut chunks, total);
    assert!(chunks.iter().all(|c| c.encrypted));

    assert_eq!(
        decode_file(&chunks, "text/plain", &cipher, Some("correct horse")),
        raw
    );

    let payload: String = chunks.iter().map(|c| c.data.as_str()).collect();
    let err = pixe_core::decode_payload(&payload, "text/plain", true, &cipher, Some("wrong"))
        .unwrap_err();
    assert!(matches!(err, pixe_core::PixeError::AuthenticationFailed));
}

#[test]
fn compressed_roundtrip_shrinks_repetitive_payloads() {
    let mut config = test_config(800);
    config.compression_enabled = true;
    let cipher = EncryptionService::new(config.pbkdf2_iterations);
    let raw = "repetition legitimizes. ".repeat(500);

    let plain = encode_payload(raw.as_bytes(), "text/plain", false, &cipher, None).unwrap();
    let compressed = encode_payload(raw.as_bytes(), "text/plain", true, &cipher, None).unwrap();
    assert!(compressed.len() < plain.len());
    assert!(compressed.starts_with(pixe_core::GZIP_MARKER));

    let decoded = decode_payload(&compressed, "text/plain", false, &cipher, None).unwrap();
    assert_eq!(decoded, raw.as_bytes());
}

#[test]
fn multi_file_indexes_are_global_and_contiguous() {
    let config = test_config(500);
    let cipher = EncryptionService::new(config.pbkdf2_iterations);

    let first = encode_file(
        &b"x".repeat(700),
        "a.txt",
        "text/plain",
        &config,
        &cipher,
        None,
        0,
    );
    let second = encode_file(
        &b"y".repeat(700),
        "b.txt",
        "text/plain",
        &config,
        &cipher,
        None,
        first.len(),
    );

    let mut all: Vec<ChunkRecord> = first.into_iter().chain(second).collect();
    let total = all.len();
    stamp_total(&mut all, total);
    for (i, chunk) in all.iter().enumerate() {
        assert_eq!(chunk.index, i as i64);
        assert_eq!(chunk.total, total);
    }
}
