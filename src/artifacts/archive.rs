//! Archive extraction for downloaded weights

use crate::error::{LmmError, LmmResult};
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Archive;

/// Suffix of archives that are unpacked in place after download
pub const ARCHIVE_SUFFIX: &str = "tar.gz";

pub fn is_archive(filename: &str) -> bool {
    filename.ends_with(ARCHIVE_SUFFIX)
}

/// Extract a tar.gz archive into `dest_dir`
fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> std::io::Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.unpack(dest_dir)
}

/// Extract on the blocking pool; any failure is an artifact error naming
/// the archive and carrying the underlying cause
pub async fn extract_archive(archive_path: PathBuf, dest_dir: PathBuf) -> LmmResult<()> {
    let filename = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    tracing::debug!(archive = ?archive_path, dest = ?dest_dir, "Extracting model archive");

    let result = tokio::task::spawn_blocking(move || extract_tar_gz(&archive_path, &dest_dir))
        .await
        .map_err(|e| {
            LmmError::artifact(format!("Failed to extract model archive {}. Error: {}", filename, e))
        })?;

    result.map_err(|e| {
        LmmError::artifact(format!("Failed to extract model archive {}. Error: {}", filename, e))
    })
}
