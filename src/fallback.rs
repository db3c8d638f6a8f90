//! Ordered fallback over acquisition methods.
//!
//! Each method attempt moves through
//! `Resolving -> Transferring -> Validating` and ends either
//! `Succeeded` or `FailedRecoverable`. Methods run strictly one after another;
//! the first validated artifact ends the run and later methods are never
//! touched. An error that is not recoverable (see
//! [`FetchError::is_recoverable`]) stops the run as `Failed`, except a
//! resolution error, which only rules out methods backed by that location
//! service.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::Serialize;

use crate::config::FetchConfig;
use crate::domain::{ArtifactKind, DownloadMethod, LocationApi, RunId};
use crate::error::FetchError;
use crate::methods::{AcquisitionMethod, Candidate, DownloadOutcome, MethodContext};
use crate::outputs;
use crate::resolver::LocationResolver;
use crate::verify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptState {
    Resolving,
    Transferring,
    Validating,
    Succeeded,
    FailedRecoverable,
    /// Failed with an error no other method can fix; the run stops here.
    Failed,
    /// Not attempted: incompatible with the requested formats, or its
    /// location service already returned garbage for this run.
    Skipped,
}

/// One line of the attempt log.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub method: DownloadMethod,
    pub location: Option<String>,
    pub state: AttemptState,
    /// Last stage entered before `state` was decided.
    pub reached: Option<AttemptState>,
    pub error: Option<String>,
}

impl AttemptRecord {
    fn reached(mut self, stage: AttemptState) -> Self {
        self.reached = Some(stage);
        self
    }
}

/// A validated download.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub method: DownloadMethod,
    pub kind: ArtifactKind,
    pub artifact_paths: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct FallbackReport {
    pub outcome: DownloadOutcome,
    pub acquired: Option<Acquired>,
    pub attempts: Vec<AttemptRecord>,
    /// Every failure was a malformed location-service response.
    only_resolution_errors: Option<String>,
    /// `outcome` carries an error that stopped the run early.
    terminal: bool,
}

impl FallbackReport {
    /// Success as [`Acquired`]; a terminal error as itself; exhaustion as
    /// `NoDownloadMethodSucceeded`, or as the resolution error itself when
    /// nothing else went wrong.
    pub fn into_result(self, run: &RunId) -> Result<Acquired, FetchError> {
        if let Some(acquired) = self.acquired {
            return Ok(acquired);
        }
        if self.terminal {
            if let DownloadOutcome::Failure { reason, .. } = self.outcome {
                return Err(reason);
            }
        }
        match self.only_resolution_errors {
            Some(message) => Err(FetchError::Resolution(message)),
            None => Err(FetchError::NoDownloadMethodSucceeded(run.to_string())),
        }
    }
}

pub struct FallbackEngine<'a> {
    config: &'a FetchConfig,
    resolver: &'a dyn LocationResolver,
}

impl<'a> FallbackEngine<'a> {
    pub fn new(config: &'a FetchConfig, resolver: &'a dyn LocationResolver) -> Self {
        Self { config, resolver }
    }

    pub fn run(&self, run: &RunId, methods: &[Box<dyn AcquisitionMethod>]) -> FallbackReport {
        let ctx = MethodContext {
            run,
            config: self.config,
            resolver: self.resolver,
        };
        let mut attempts = Vec::new();
        let mut poisoned: HashSet<LocationApi> = HashSet::new();
        let mut resolution_message = None;
        let mut other_failure = false;

        for method in methods {
            let kind = method.kind();
            if !kind.artifact_kind().satisfies_any(&self.config.output_formats) {
                tracing::warn!(
                    "skipping download method {kind}: it cannot produce any of the requested output formats"
                );
                attempts.push(record(kind, None, AttemptState::Skipped, None));
                continue;
            }
            if let Some(api) = kind.location_api().filter(|api| poisoned.contains(api)) {
                tracing::warn!(
                    "skipping download method {kind}: the {api:?} location service failed earlier for {run}"
                );
                attempts.push(record(kind, None, AttemptState::Skipped, None));
                continue;
            }

            tracing::info!("attempting download method {kind} for run {run}");
            tracing::debug!("{kind}: resolving");
            let candidates = match method.candidates(&ctx) {
                Ok(candidates) => candidates,
                Err(FetchError::Resolution(message)) => {
                    let err = FetchError::Resolution(message);
                    tracing::warn!("method {kind} failed for {run}: {err}");
                    if let Some(api) = kind.location_api() {
                        poisoned.insert(api);
                    }
                    resolution_message.get_or_insert_with(|| err.to_string());
                    attempts.push(
                        record(kind, None, AttemptState::FailedRecoverable, Some(err.to_string()))
                            .reached(AttemptState::Resolving),
                    );
                    continue;
                }
                Err(err) if !err.is_recoverable() => {
                    let failed = AttemptFailure {
                        stage: AttemptState::Resolving,
                        err,
                        partial_paths: Vec::new(),
                    };
                    return abort(kind, None, failed, attempts, run);
                }
                Err(err) => {
                    tracing::warn!("method {kind} failed for {run}: {err}");
                    other_failure = true;
                    attempts.push(
                        record(kind, None, AttemptState::FailedRecoverable, Some(err.to_string()))
                            .reached(AttemptState::Resolving),
                    );
                    continue;
                }
            };
            if candidates.is_empty() {
                let err = FetchError::NoLocationFound(format!("{kind} has no location for {run}"));
                tracing::warn!("method {kind} failed for {run}: {err}");
                other_failure = true;
                attempts.push(
                    record(kind, None, AttemptState::FailedRecoverable, Some(err.to_string()))
                        .reached(AttemptState::Resolving),
                );
                continue;
            }

            for candidate in &candidates {
                let where_from = candidate.describe();
                tracing::debug!("{kind}: transferring from {where_from}");
                let result = match method.transfer(&ctx, candidate) {
                    DownloadOutcome::Success { artifact_paths } => {
                        tracing::debug!("{kind}: validating");
                        match self.validate(kind.artifact_kind(), candidate, &artifact_paths) {
                            Ok(()) => Ok(artifact_paths),
                            Err(err) => Err(AttemptFailure {
                                stage: AttemptState::Validating,
                                err,
                                partial_paths: artifact_paths,
                            }),
                        }
                    }
                    DownloadOutcome::Failure {
                        reason,
                        partial_paths,
                    } => Err(AttemptFailure {
                        stage: AttemptState::Transferring,
                        err: reason,
                        partial_paths,
                    }),
                };

                match result {
                    Ok(artifact_paths) => {
                        tracing::info!("download method {kind} completed successfully for {run}");
                        attempts.push(
                            record(kind, Some(where_from), AttemptState::Succeeded, None)
                                .reached(AttemptState::Validating),
                        );
                        return FallbackReport {
                            outcome: DownloadOutcome::Success {
                                artifact_paths: artifact_paths.clone(),
                            },
                            acquired: Some(Acquired {
                                method: kind,
                                kind: kind.artifact_kind(),
                                artifact_paths,
                            }),
                            attempts,
                            only_resolution_errors: None,
                            terminal: false,
                        };
                    }
                    Err(failed) if !failed.err.is_recoverable() => {
                        return abort(kind, Some(where_from), failed, attempts, run);
                    }
                    Err(failed) => {
                        let err = failed.err;
                        tracing::warn!("method {kind} failed for {run} from {where_from}: {err}");
                        outputs::remove_partial(&failed.partial_paths);
                        other_failure = true;
                        attempts.push(
                            record(
                                kind,
                                Some(where_from),
                                AttemptState::FailedRecoverable,
                                Some(err.to_string()),
                            )
                            .reached(failed.stage),
                        );
                    }
                }
            }
        }

        tracing::warn!("no download method succeeded for {run}");
        let only_resolution_errors = if other_failure {
            None
        } else {
            resolution_message
        };
        FallbackReport {
            outcome: DownloadOutcome::Failure {
                reason: FetchError::NoDownloadMethodSucceeded(run.to_string()),
                partial_paths: Vec::new(),
            },
            acquired: None,
            attempts,
            only_resolution_errors,
            terminal: false,
        }
    }

    /// Check every artifact's leading bytes, then its checksum against the
    /// location it came from when checking is enabled.
    fn validate(
        &self,
        kind: ArtifactKind,
        candidate: &Candidate,
        artifact_paths: &[PathBuf],
    ) -> Result<(), FetchError> {
        if artifact_paths.is_empty() {
            return Err(FetchError::TransferFailed("no file was written".to_string()));
        }
        for path in artifact_paths {
            if !path.exists() {
                return Err(FetchError::TransferFailed(format!(
                    "{} was not written",
                    path.display()
                )));
            }
            if !verify::has_magic(path, kind.magic())? {
                return Err(FetchError::TransferFailed(format!(
                    "{} does not look like a {kind:?} file",
                    path.display()
                )));
            }
        }
        if !self.config.check_md5sums {
            return Ok(());
        }
        if candidate.guessed {
            tracing::warn!("not checking md5sum of a download from a guessed location");
            return Ok(());
        }
        for (index, path) in artifact_paths.iter().enumerate() {
            let Some(expected) = candidate.locations.get(index).and_then(|loc| loc.checksum())
            else {
                tracing::warn!("no md5sum available for {}, not checking it", path.display());
                continue;
            };
            tracing::debug!("checking md5sum of {}", path.display());
            if !verify::verify(path, expected)? {
                return Err(FetchError::VerificationFailed(format!(
                    "md5sum of {} does not match {expected}",
                    path.display()
                )));
            }
            tracing::info!("md5sum OK for {}", path.display());
        }
        Ok(())
    }
}

struct AttemptFailure {
    stage: AttemptState,
    err: FetchError,
    partial_paths: Vec<PathBuf>,
}

/// A terminal error ends the run: no later method is tried.
fn abort(
    kind: DownloadMethod,
    location: Option<String>,
    failed: AttemptFailure,
    mut attempts: Vec<AttemptRecord>,
    run: &RunId,
) -> FallbackReport {
    let AttemptFailure {
        stage,
        err,
        partial_paths,
    } = failed;
    tracing::error!("method {kind} failed for {run}, not trying further methods: {err}");
    outputs::remove_partial(&partial_paths);
    attempts.push(
        record(kind, location, AttemptState::Failed, Some(err.to_string())).reached(stage),
    );
    FallbackReport {
        outcome: DownloadOutcome::Failure {
            reason: err,
            partial_paths,
        },
        acquired: None,
        attempts,
        only_resolution_errors: None,
        terminal: true,
    }
}

fn record(
    method: DownloadMethod,
    location: Option<String>,
    state: AttemptState,
    error: Option<String>,
) -> AttemptRecord {
    AttemptRecord {
        method,
        location,
        state,
        reached: None,
        error,
    }
}
