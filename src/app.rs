use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::FetchConfig;
use crate::domain::{ArtifactKind, DownloadMethod, OutputFormat, RunId};
use crate::error::FetchError;
use crate::extract::Extractor;
use crate::fallback::{AttemptRecord, FallbackEngine};
use crate::methods::{self, AcquisitionMethod};
use crate::outputs::{self, ExistingOutputs};
use crate::resolver::LocationResolver;

/// Where the run identifiers of a batch come from.
#[derive(Debug, Clone)]
pub enum RunInput {
    Runs(Vec<String>),
    ListFile(PathBuf),
    BioProject(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Downloaded,
    Extracted,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: String,
    pub status: RunStatus,
    pub method: Option<DownloadMethod>,
    pub outputs: Vec<String>,
    pub attempts: Vec<AttemptRecord>,
    pub error: Option<String>,
    pub exit_code: u8,
    pub completed_at: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub runs: Vec<RunReport>,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &RunReport> {
        self.runs
            .iter()
            .filter(|run| run.status == RunStatus::Failed)
    }

    /// Exit code of the first failed run, or 0.
    pub fn exit_code(&self) -> u8 {
        self.failures().next().map(|run| run.exit_code).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

struct RunSuccess {
    status: RunStatus,
    method: Option<DownloadMethod>,
    outputs: Vec<PathBuf>,
}

pub struct App<R: LocationResolver> {
    resolver: R,
    config: FetchConfig,
}

impl<R: LocationResolver> App<R> {
    pub fn new(resolver: R, config: FetchConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Expand the batch input into run identifiers, rejecting the batch on
    /// the first malformed one.
    pub fn resolve_runs(&self, input: &RunInput) -> Result<Vec<RunId>, FetchError> {
        match input {
            RunInput::Runs(values) => values.iter().map(|value| value.parse()).collect(),
            RunInput::ListFile(path) => read_run_list(path),
            RunInput::BioProject(accession) => {
                tracing::info!("querying ENA for the runs of {accession}");
                let runs = self.resolver.bioproject_runs(accession)?;
                tracing::info!("found {} run(s) in {accession}", runs.len());
                Ok(runs)
            }
        }
    }

    /// Download and extract every run in order. A terminal failure of one
    /// run is recorded and the batch moves on.
    pub fn download_and_extract(&self, runs: &[RunId], sink: &dyn ProgressSink) -> BatchReport {
        let mut report = BatchReport::default();
        for (index, run) in runs.iter().enumerate() {
            sink.event(ProgressEvent {
                message: format!("run {}/{}: {run}", index + 1, runs.len()),
                elapsed: None,
            });
            let start = Instant::now();
            let mut attempts = Vec::new();
            let result = self.download_one(run, &mut attempts);
            sink.event(ProgressEvent {
                message: format!("run {run} finished"),
                elapsed: Some(start.elapsed()),
            });
            report.runs.push(run_report(run.to_string(), result, attempts));
        }
        report
    }

    /// Extract local `.sra` containers without downloading anything.
    pub fn extract(&self, containers: &[PathBuf], sink: &dyn ProgressSink) -> BatchReport {
        let extractor = Extractor::new(&self.config);
        let mut report = BatchReport::default();
        for container in containers {
            sink.event(ProgressEvent {
                message: format!("extracting {}", container.display()),
                elapsed: None,
            });
            let start = Instant::now();
            let result = extractor.extract(container).map(|outputs| RunSuccess {
                status: RunStatus::Extracted,
                method: None,
                outputs,
            });
            sink.event(ProgressEvent {
                message: format!("{} finished", container.display()),
                elapsed: Some(start.elapsed()),
            });
            report
                .runs
                .push(run_report(container.display().to_string(), result, Vec::new()));
        }
        report
    }

    fn download_one(
        &self,
        run: &RunId,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Result<RunSuccess, FetchError> {
        let config = &self.config;
        let dir = &config.output_dir;
        fs::create_dir_all(dir).map_err(|err| FetchError::fs(dir.display(), err))?;

        if !config.stdout {
            let existing = outputs::check_existing(dir, run, &config.output_formats, config.force)?;
            if let ExistingOutputs::Skip(paths) = existing {
                return Ok(RunSuccess {
                    status: RunStatus::Skipped,
                    method: None,
                    outputs: paths,
                });
            }
        }

        let methods: Vec<Box<dyn AcquisitionMethod>> =
            config.methods.iter().copied().map(methods::method_for).collect();
        let engine = FallbackEngine::new(config, &self.resolver);
        let report = engine.run(run, &methods);
        attempts.extend(report.attempts.iter().cloned());
        let acquired = report.into_result(run)?;

        let extractor = Extractor::new(config);
        let produced = match acquired.kind {
            ArtifactKind::SraContainer => {
                let container = outputs::container_path(dir, run);
                if config.output_formats.contains(&OutputFormat::Sra) {
                    vec![container]
                } else {
                    let produced = extractor.extract(&container)?;
                    tracing::info!("deleting .sra file {}", container.display());
                    fs::remove_file(&container)
                        .map_err(|err| FetchError::fs(container.display(), err))?;
                    produced
                }
            }
            ArtifactKind::CompressedReads => {
                if config.stdout {
                    outputs::remove_partial(&acquired.artifact_paths);
                    return Err(FetchError::Configuration(format!(
                        "{} downloads gzipped FASTQ, which cannot be streamed to stdout",
                        acquired.method
                    )));
                }
                extractor.convert_downloaded(&acquired.artifact_paths)?
            }
        };

        if produced.is_empty() && !config.stdout {
            return Err(FetchError::NoOutputProduced(run.to_string()));
        }
        tracing::info!("finished downloading {run}");
        Ok(RunSuccess {
            status: RunStatus::Downloaded,
            method: Some(acquired.method),
            outputs: produced,
        })
    }
}

fn run_report(
    run: String,
    result: Result<RunSuccess, FetchError>,
    attempts: Vec<AttemptRecord>,
) -> RunReport {
    match result {
        Ok(success) => RunReport {
            run,
            status: success.status,
            method: success.method,
            outputs: success
                .outputs
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
            attempts,
            error: None,
            exit_code: 0,
            completed_at: now_rfc3339(),
        },
        Err(err) => {
            tracing::error!("{run} failed: {err}");
            RunReport {
                run,
                status: RunStatus::Failed,
                method: None,
                outputs: Vec::new(),
                attempts,
                error: Some(err.to_string()),
                exit_code: err.exit_code(),
                completed_at: now_rfc3339(),
            }
        }
    }
}

/// One run identifier per line; blank lines are ignored.
pub fn read_run_list(path: &Path) -> Result<Vec<RunId>, FetchError> {
    let content = fs::read_to_string(path).map_err(|err| FetchError::fs(path.display(), err))?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
