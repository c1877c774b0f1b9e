use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tempfile::TempDir;

use crate::chunk::ChunkRecord;
use crate::error::{PixeError, Result};
use crate::qr;

pub const ASSEMBLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const SEEK_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Concurrent frame seeks are bounded to keep the external tool responsive.
const SEEK_WORKERS: usize = 4;

/// Drives the external video tool (`ffmpeg`/`ffprobe`). All operations are
/// blocking; `extract_frames` fans out over a small fixed worker pool.
pub struct VideoBridge {
    pool: rayon::ThreadPool,
}

impl VideoBridge {
    pub fn new() -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(SEEK_WORKERS)
            .build()
            .map_err(|e| PixeError::InvalidConfig(format!("worker pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Assembles ordered `frame_NNNNN.png` files into an MP4 with a silent
    /// audio track. Frames must be contiguously numbered from zero inside a
    /// single directory; the names carry the assembly order.
    pub fn assemble(
        &self,
        frame_paths: &[PathBuf],
        fps: f64,
        quality: u8,
        out_path: &Path,
    ) -> Result<()> {
        let Some(first) = frame_paths.first() else {
            return Err(PixeError::EmptyInput(out_path.to_path_buf()));
        };
        let dir = first
            .parent()
            .ok_or_else(|| PixeError::InvalidPath(first.clone()))?;
        for (i, path) in frame_paths.iter().enumerate() {
            let expected = qr::frame_file_name(i);
            if path.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
                return Err(PixeError::InvalidPath(path.clone()));
            }
        }

        let pattern = dir.join("frame_%05d.png");
        let args = vec![
            "-y".to_string(),
            "-framerate".to_string(),
            format!("{fps}"),
            "-start_number".to_string(),
            "0".to_string(),
            "-i".to_string(),
            pattern.to_string_lossy().into_owned(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            "anullsrc=channel_layout=stereo:sample_rate=44100".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "medium".to_string(),
            "-crf".to_string(),
            quality.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-shortest".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            out_path.to_string_lossy().into_owned(),
        ];
        run_tool("ffmpeg", &args, ASSEMBLE_TIMEOUT, "assemble")?;
        Ok(())
    }

    /// Counts video packets in the container.
    pub fn probe_frame_count(&self, path: &Path) -> Result<usize> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "v:0".to_string(),
            "-count_packets".to_string(),
            "-show_entries".to_string(),
            "stream=nb_read_packets".to_string(),
            "-of".to_string(),
            "csv=p=0".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        let output = run_tool("ffprobe", &args, PROBE_TIMEOUT, "probe")?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse::<usize>()
            .map_err(|_| PixeError::ProbeError(format!("unparsable packet count: {text:?}")))
    }

    /// Extracts exactly the Nth (0-based) frame as a PNG at `out_png`.
    pub fn seek_and_extract(&self, path: &Path, frame_number: usize, out_png: &Path) -> Result<()> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            path.to_string_lossy().into_owned(),
            "-vf".to_string(),
            format!("select=eq(n\\,{frame_number})"),
            "-frames:v".to_string(),
            "1".to_string(),
            "-vsync".to_string(),
            "0".to_string(),
            out_png.to_string_lossy().into_owned(),
        ];
        match run_tool("ffmpeg", &args, SEEK_TIMEOUT, "seek") {
            Ok(_) => {}
            // A seek past the end produces an empty output rather than a
            // usable diagnostic.
            Err(PixeError::ToolFailed { ref stderr, .. })
                if stderr.contains("Output file is empty") =>
            {
                return Err(PixeError::FrameNotFound(frame_number));
            }
            Err(e) => return Err(e),
        }
        match std::fs::metadata(out_png) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(PixeError::FrameNotFound(frame_number)),
        }
    }

    /// Seeks and decodes one frame into its chunk record.
    pub fn extract_frame(&self, path: &Path, frame_number: usize) -> Result<ChunkRecord> {
        let scratch = TempDir::new()?;
        let png = scratch.path().join(qr::frame_file_name(frame_number));
        self.seek_and_extract(path, frame_number, &png)?;
        qr::decode_frame(&png)
    }

    /// Seeks and decodes several frames concurrently; results come back in
    /// request order.
    pub fn extract_frames(&self, path: &Path, frame_numbers: &[usize]) -> Result<Vec<ChunkRecord>> {
        self.pool.install(|| {
            frame_numbers
                .par_iter()
                .map(|&n| self.extract_frame(path, n))
                .collect()
        })
    }

    /// Dumps every frame into `dir` as `frame_NNNNN.png`, returning the paths
    /// in frame order.
    pub fn extract_all(&self, path: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let pattern = dir.join("frame_%05d.png");
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            path.to_string_lossy().into_owned(),
            "-vsync".to_string(),
            "0".to_string(),
            "-start_number".to_string(),
            "0".to_string(),
            pattern.to_string_lossy().into_owned(),
        ];
        run_tool("ffmpeg", &args, ASSEMBLE_TIMEOUT, "extract")?;

        let mut frames: Vec<(usize, PathBuf)> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter_map(|p| frame_number_of(&p).map(|n| (n, p)))
            .collect();
        frames.sort_by_key(|(n, _)| *n);
        Ok(frames.into_iter().map(|(_, p)| p).collect())
    }
}

/// Parses the `N` out of a `frame_NNNNN.png` file name.
fn frame_number_of(path: &Path) -> Option<usize> {
    path.file_name()
        .and_then(|n| n.to_str())?
        .strip_prefix("frame_")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}

#[derive(Debug)]
struct ToolOutput {
    stdout: Vec<u8>,
    #[allow(dead_code)]
    stderr: String,
}

fn run_tool(tool: &str, args: &[String], timeout: Duration, op: &str) -> Result<ToolOutput> {
    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PixeError::ToolMissing {
                    tool: tool.to_string(),
                }
            } else {
                PixeError::Io(e)
            }
        })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PixeError::Timeout {
                op: op.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        std::thread::sleep(Duration::from_millis(25));
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = String::from_utf8_lossy(&stderr_reader.join().unwrap_or_default()).into_owned();

    if !status.success() {
        return Err(PixeError::ToolFailed {
            tool: tool.to_string(),
            status: status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(ToolOutput { stdout, stderr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_is_reported() {
        let err = run_tool(
            "pixe-no-such-tool",
            &[],
            Duration::from_secs(1),
            "test",
        )
        .unwrap_err();
        assert!(matches!(err, PixeError::ToolMissing { ref tool } if tool == "pixe-no-such-tool"));
    }

    #[test]
    fn slow_tool_times_out() {
        let err = run_tool(
            "sleep",
            &["5".to_string()],
            Duration::from_millis(50),
            "test",
        )
        .unwrap_err();
        assert!(matches!(err, PixeError::Timeout { .. }));
    }

    #[test]
    fn assemble_rejects_misnamed_frames() {
        let bridge = VideoBridge::new().unwrap();
        let frames = vec![PathBuf::from("/tmp/x/frame_00001.png")];
        assert!(matches!(
            bridge.assemble(&frames, 2.0, 23, Path::new("/tmp/out.mp4")),
            Err(PixeError::InvalidPath(_))
        ));
    }

    #[test]
    fn frame_numbers_parse_from_names() {
        assert_eq!(frame_number_of(Path::new("/x/frame_00042.png")), Some(42));
        assert_eq!(frame_number_of(Path::new("/x/frame_123456.png")), Some(123456));
        assert_eq!(frame_number_of(Path::new("/x/noise.png")), None);
    }

    #[test]
    fn assemble_rejects_empty_frame_list() {
        let bridge = VideoBridge::new().unwrap();
        assert!(matches!(
            bridge.assemble(&[], 2.0, 23, Path::new("/tmp/out.mp4")),
            Err(PixeError::EmptyInput(_))
        ));
    }
}
