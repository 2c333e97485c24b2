//! Artifact upload.
//!
//! `UploadCoordinator` walks the output directory once and hands every
//! regular file to an `UploadClient`. Each file is attempted exactly once;
//! a failure is recorded and the walk continues. Retrying is the client's
//! business.

pub mod mqtt;

pub use mqtt::{MqttUploadClient, UploadConnection};

use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};

/// Submits one file to the remote hub.
pub trait UploadClient {
    fn upload_file(&mut self, path: &Path) -> Result<()>;
}

impl<U: UploadClient + ?Sized> UploadClient for Box<U> {
    fn upload_file(&mut self, path: &Path) -> Result<()> {
        (**self).upload_file(path)
    }
}

/// A single artifact that could not be uploaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadError {
    pub path: PathBuf,
    pub message: String,
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upload of {} failed: {}", self.path.display(), self.message)
    }
}

impl std::error::Error for UploadError {}

/// Outcome for one discovered artifact.
#[derive(Clone, Debug)]
pub struct UploadOutcome {
    pub path: PathBuf,
    pub result: Result<(), UploadError>,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct UploadCoordinator<U: UploadClient> {
    client: U,
}

impl<U: UploadClient> UploadCoordinator<U> {
    pub fn new(client: U) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &U {
        &self.client
    }

    /// Attempt every artifact in `output_dir`, in directory enumeration order.
    ///
    /// Only a failure to list the directory is returned as `Err`; per-file
    /// failures are reported in the returned outcomes.
    pub fn upload_all(&mut self, output_dir: &Path) -> Result<Vec<UploadOutcome>> {
        log::info!("processing frames saved in {}", output_dir.display());
        let artifacts = list_artifacts(output_dir)?;

        let mut outcomes = Vec::with_capacity(artifacts.len());
        for path in artifacts {
            let result = self.client.upload_file(&path).map_err(|e| UploadError {
                path: path.clone(),
                message: format!("{:#}", e),
            });
            match &result {
                Ok(()) => log::info!("uploaded {}", path.display()),
                Err(e) => log::warn!("{}", e),
            }
            outcomes.push(UploadOutcome { path, result });
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        log::info!(
            "upload finished: {} succeeded, {} failed",
            outcomes.len() - failed,
            failed
        );
        Ok(outcomes)
    }
}

fn list_artifacts(output_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(output_dir)
        .with_context(|| format!("list artifacts in {}", output_dir.display()))?;
    let entries = entries.map(|entry| {
        entry.map(|entry| {
            let is_file = entry.file_type().map(|t| t.is_file());
            (entry.path(), is_file)
        })
    });
    Ok(regular_files(output_dir, entries))
}

/// Keep regular files; entries that cannot be read or stat'ed are skipped
/// so one bad entry does not cost the rest of the batch.
fn regular_files<I>(output_dir: &Path, entries: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = io::Result<(PathBuf, io::Result<bool>)>>,
{
    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok((path, Ok(true))) => paths.push(path),
            Ok((_, Ok(false))) => {}
            Ok((path, Err(e))) => log::warn!("skipping {}: {}", path.display(), e),
            Err(e) => log::warn!("skipping unreadable entry in {}: {}", output_dir.display(), e),
        }
    }
    paths
}
