//! Frame persistence.
//!
//! `FrameSink` writes each frame to its own file in the output directory.
//! Names derive from the frame timestamp (RFC 3339, nanosecond precision,
//! `:` replaced with `_`), so lexicographic order matches capture order.
//!
//! Files are opened with create-new semantics. If a name is already taken
//! the sink appends `-1`, `-2`, ... rather than overwrite an earlier frame.
//! A file whose write or sync fails is removed again, so only complete
//! artifacts are ever left in the output directory.

use chrono::SecondsFormat;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::frame::{CaptureArtifact, Frame};

pub const DEFAULT_EXTENSION: &str = "png";

/// How many suffixed names to try before giving up on a colliding timestamp.
const MAX_COLLISION_SUFFIX: u32 = 64;

#[derive(Clone, Debug)]
pub struct FrameSink {
    extension: String,
}

impl FrameSink {
    pub fn new() -> Self {
        Self::with_extension(DEFAULT_EXTENSION)
    }

    pub fn with_extension(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Persist one frame under `output_dir`.
    ///
    /// `output_dir` must already exist; the sink never creates directories.
    pub fn write(&self, frame: &Frame, output_dir: &Path) -> io::Result<CaptureArtifact> {
        let stem = artifact_stem(frame);
        let mut suffix = 0;
        loop {
            let path = self.candidate_path(output_dir, &stem, suffix);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    write_complete(&path, file, &frame.data)?;
                    return Ok(CaptureArtifact {
                        path,
                        timestamp: frame.timestamp,
                        bytes: frame.data.len() as u64,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    suffix += 1;
                    if suffix > MAX_COLLISION_SUFFIX {
                        return Err(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            format!("too many artifacts named {}", stem),
                        ));
                    }
                    log::debug!("artifact name {} taken, trying suffix {}", stem, suffix);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn candidate_path(&self, output_dir: &Path, stem: &str, suffix: u32) -> PathBuf {
        let name = if suffix == 0 {
            format!("{}.{}", stem, self.extension)
        } else {
            format!("{}-{}.{}", stem, suffix, self.extension)
        };
        output_dir.join(name)
    }
}

impl Default for FrameSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Output that can be flushed to stable storage once fully written.
trait Durable: Write {
    fn sync(&self) -> io::Result<()>;
}

impl Durable for File {
    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Write and sync `data`, deleting `path` if either step fails.
fn write_complete<W: Durable>(path: &Path, mut out: W, data: &[u8]) -> io::Result<()> {
    let result = out.write_all(data).and_then(|()| out.sync());
    if result.is_err() {
        drop(out);
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("failed to remove partial artifact {}: {}", path.display(), e);
        }
    }
    result
}

/// Filesystem-safe stem for a frame, e.g. `2024-05-01T12_00_00.500000000Z`.
pub fn artifact_stem(frame: &Frame) -> String {
    frame
        .timestamp
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
        .replace(':', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn frame_at(millis: i64, data: &[u8]) -> Frame {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Frame::new(base + Duration::milliseconds(millis), data.to_vec())
    }

    #[test]
    fn names_are_timestamp_derived_and_colon_free() {
        let frame = frame_at(500, b"x");
        let stem = artifact_stem(&frame);
        assert_eq!(stem, "2024-05-01T12_00_00.500000000Z");
        assert!(!stem.contains(':'));
    }

    #[test]
    fn writes_one_file_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::new();

        let mut names = Vec::new();
        for i in 0..5 {
            let artifact = sink.write(&frame_at(i * 40, &[i as u8; 3]), dir.path()).unwrap();
            assert_eq!(artifact.bytes, 3);
            assert_eq!(std::fs::read(&artifact.path).unwrap(), vec![i as u8; 3]);
            names.push(artifact.file_name().unwrap().to_string());
        }

        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 5);
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn colliding_timestamp_gets_suffix_instead_of_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FrameSink::new();

        let first = sink.write(&frame_at(0, b"first"), dir.path()).unwrap();
        let second = sink.write(&frame_at(0, b"second"), dir.path()).unwrap();

        assert_ne!(first.path, second.path);
        assert!(second.file_name().unwrap().ends_with("-1.png"));
        assert_eq!(std::fs::read(&first.path).unwrap(), b"first");
        assert_eq!(std::fs::read(&second.path).unwrap(), b"second");
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        let err = FrameSink::new().write(&frame_at(0, b"x"), &missing).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn custom_extension_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = FrameSink::with_extension("jpg")
            .write(&frame_at(0, b"x"), dir.path())
            .unwrap();
        assert!(artifact.file_name().unwrap().ends_with(".jpg"));
    }

    /// Accepts `limit` bytes, then reports a full disk.
    struct FullDisk {
        file: File,
        limit: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.limit == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.limit);
            self.limit -= n;
            self.file.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl Durable for FullDisk {
        fn sync(&self) -> io::Result<()> {
            self.file.sync_data()
        }
    }

    #[test]
    fn failed_write_leaves_no_partial_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-05-01T12_00_00.000000000Z.png");
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();

        let err = write_complete(&path, FullDisk { file, limit: 4 }, b"truncated frame").unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn successful_write_keeps_complete_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let file = File::create(&path).unwrap();

        write_complete(&path, file, b"complete").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"complete");
    }
}
