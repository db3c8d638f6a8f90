//! Output file naming and the pre-existing output check.
//!
//! Paths are derived deterministically from the run identifier and output
//! directory: `{run}_1.ext`, `{run}_2.ext` for paired reads and `{run}.ext`
//! for single-ended runs or containers.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::domain::{OutputFormat, RunId};
use crate::error::FetchError;

/// Every file name a run may produce with the given extension, forward
/// read first.
pub fn read_file_names(run: &RunId, extension: &str) -> [String; 3] {
    [
        format!("{run}_1.{extension}"),
        format!("{run}_2.{extension}"),
        format!("{run}.{extension}"),
    ]
}

pub fn candidate_paths(dir: &Path, run: &RunId, format: OutputFormat) -> Vec<PathBuf> {
    match format {
        OutputFormat::Sra => vec![container_path(dir, run)],
        other => read_file_names(run, other.extension())
            .iter()
            .map(|name| dir.join(name))
            .collect(),
    }
}

pub fn container_path(dir: &Path, run: &RunId) -> PathBuf {
    dir.join(format!("{run}.sra"))
}

/// Paths among `candidate_paths` that currently exist.
pub fn present_paths(dir: &Path, run: &RunId, format: OutputFormat) -> Vec<PathBuf> {
    candidate_paths(dir, run, format)
        .into_iter()
        .filter(|path| path.exists())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "paths", rename_all = "lowercase")]
pub enum ExistingOutputs {
    /// Outputs already present and not forced; nothing needs doing.
    Skip(Vec<PathBuf>),
    /// Outputs were present but forced, and have been deleted.
    Removed(Vec<PathBuf>),
    None,
}

/// Look for outputs of any requested format. With `force` they are deleted,
/// otherwise the run can be skipped. Download and standalone extraction both
/// call this before doing any work.
pub fn check_existing(
    dir: &Path,
    run: &RunId,
    formats: &[OutputFormat],
    force: bool,
) -> Result<ExistingOutputs, FetchError> {
    let mut found = Vec::new();
    for format in formats {
        for path in present_paths(dir, run, *format) {
            if !found.contains(&path) {
                found.push(path);
            }
        }
    }
    if found.is_empty() {
        return Ok(ExistingOutputs::None);
    }
    if !force {
        for path in &found {
            tracing::info!(
                "skipping download/extraction of {run} as an output file already appears to exist, as file {}",
                path.display()
            );
        }
        return Ok(ExistingOutputs::Skip(found));
    }
    for path in &found {
        tracing::warn!("removing previous file {}", path.display());
        fs::remove_file(path).map_err(|err| FetchError::fs(path.display(), err))?;
    }
    Ok(ExistingOutputs::Removed(found))
}

/// Delete whatever of `paths` exists, logging each removal.
pub fn remove_partial(paths: &[PathBuf]) {
    for path in paths {
        if path.exists() {
            tracing::info!("removing file {} because download failed", path.display());
            if let Err(err) = fs::remove_file(path) {
                tracing::warn!("could not remove {}: {err}", path.display());
            }
        }
    }
}
