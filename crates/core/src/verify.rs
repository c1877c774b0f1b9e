use std::path::Path;

use base64::{engine::general_purpose, Engine as _};

use crate::archive::Archiver;
use crate::cancel::CancellationToken;
use crate::error::Result;

/// Failures reported in detail before the verifier switches to counting.
const MAX_DETAILED_FAILURES: usize = 5;

/// Progress is emitted every this many frames, and on the final frame.
const PROGRESS_INTERVAL: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Good,
    Degraded { fail_count: usize },
}

#[derive(Debug, Clone)]
pub struct FrameFailure {
    pub frame_number: usize,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub frame_count: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub first_failures: Vec<FrameFailure>,
}

impl VerifyReport {
    pub fn verdict(&self) -> Verdict {
        if self.fail_count == 0 {
            Verdict::Good
        } else {
            Verdict::Degraded {
                fail_count: self.fail_count,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyProgress {
    pub frames_checked: usize,
    pub frame_count: usize,
    pub success_count: usize,
}

/// Walks every frame of an archive and reports rather than fails: decoding
/// errors are accumulated, the archive-level verdict comes at the end.
pub struct IntegrityVerifier<'a> {
    archiver: &'a Archiver,
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(archiver: &'a Archiver) -> Self {
        Self { archiver }
    }

    /// Seek-and-decode check of every frame. Does not touch ciphertext
    /// authentication; see [`IntegrityVerifier::deep_verify`].
    pub fn verify(
        &self,
        archive: &Path,
        progress: Option<&dyn Fn(VerifyProgress)>,
        cancel: Option<&CancellationToken>,
    ) -> Result<VerifyReport> {
        self.walk(archive, progress, cancel, |_| Ok(()))
    }

    /// Frame decode plus per-chunk envelope and authentication checks for
    /// encrypted archives.
    pub fn deep_verify(
        &self,
        archive: &Path,
        password: &str,
        progress: Option<&dyn Fn(VerifyProgress)>,
        cancel: Option<&CancellationToken>,
    ) -> Result<VerifyReport> {
        let cipher = self.archiver.cipher().clone();
        self.walk(archive, progress, cancel, move |record| {
            if record.is_metadata() || !record.encrypted {
                return Ok(());
            }
            let ciphertext = general_purpose::STANDARD
                .decode(&record.data)
                .map_err(|e| crate::error::PixeError::Serialization(format!(
                    "bad ciphertext encoding: {e}"
                )))?;
            if record.segmented {
                cipher.decrypt(&ciphertext, password)?;
            }
            Ok(())
        })
    }

    fn walk(
        &self,
        archive: &Path,
        progress: Option<&dyn Fn(VerifyProgress)>,
        cancel: Option<&CancellationToken>,
        check: impl Fn(&crate::chunk::ChunkRecord) -> Result<()>,
    ) -> Result<VerifyReport> {
        let frame_count = self.archiver.bridge().probe_frame_count(archive)?;
        let mut report = VerifyReport {
            frame_count,
            success_count: 0,
            fail_count: 0,
            first_failures: Vec::new(),
        };

        for frame_number in 0..frame_count {
            if let Some(token) = cancel {
                token.check()?;
            }
            let outcome = self
                .archiver
                .bridge()
                .extract_frame(archive, frame_number)
                .and_then(|record| check(&record));
            match outcome {
                Ok(()) => report.success_count += 1,
                Err(e) => {
                    report.fail_count += 1;
                    if report.first_failures.len() < MAX_DETAILED_FAILURES {
                        report.first_failures.push(FrameFailure {
                            frame_number,
                            error: e.to_string(),
                        });
                    }
                }
            }
            let checked = frame_number + 1;
            if checked % PROGRESS_INTERVAL == 0 || checked == frame_count {
                if let Some(report_fn) = progress {
                    report_fn(VerifyProgress {
                        frames_checked: checked,
                        frame_count,
                        success_count: report.success_count,
                    });
                }
            }
        }
        Ok(report)
    }
}
