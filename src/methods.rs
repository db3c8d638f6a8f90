//! Acquisition methods: how one run's raw data gets onto local disk.
//!
//! Each method is stateless. It asks the resolver for candidates (if it needs
//! locations at all) and then transfers one candidate at a time. Byte-level
//! validation and cleanup belong to [`crate::fallback`].

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::config::FetchConfig;
use crate::domain::{CloudProvider, DownloadMethod, RunId};
use crate::error::FetchError;
use crate::location::{
    BulkFtpLocation, ContainerQuality, Location, ObjectQuery, ObjectStoreLocation,
};
use crate::outputs;
use crate::process;
use crate::resolver::LocationResolver;

const DEFAULT_PREFETCH_MAX_SIZE: &str = "0G";
const ENA_ASPERA_HOST: &str = "era-fasp@fasp.sra.ebi.ac.uk";

/// One sub-attempt of a method. Prefetch needs no location; object-store
/// methods yield one candidate per location; bulk-archive methods yield a
/// single candidate covering every read file of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub locations: Vec<Location>,
    /// Built without consulting a location service, so no checksum is known.
    pub guessed: bool,
}

impl Candidate {
    pub fn resolved(locations: Vec<Location>) -> Self {
        Self {
            locations,
            guessed: false,
        }
    }

    pub fn describe(&self) -> String {
        if self.locations.is_empty() {
            return "managed retrieval".to_string();
        }
        self.locations
            .iter()
            .map(Location::describe)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug)]
pub enum DownloadOutcome {
    /// Artifacts in the same order as the candidate's locations.
    Success { artifact_paths: Vec<PathBuf> },
    Failure {
        reason: FetchError,
        partial_paths: Vec<PathBuf>,
    },
}

impl DownloadOutcome {
    fn failed(reason: FetchError, partial_paths: Vec<PathBuf>) -> Self {
        DownloadOutcome::Failure {
            reason,
            partial_paths,
        }
    }
}

/// What every method can see while working on one run.
pub struct MethodContext<'a> {
    pub run: &'a RunId,
    pub config: &'a FetchConfig,
    pub resolver: &'a dyn LocationResolver,
}

impl MethodContext<'_> {
    fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    fn container_path(&self) -> PathBuf {
        outputs::container_path(self.output_dir(), self.run)
    }
}

pub trait AcquisitionMethod {
    fn kind(&self) -> DownloadMethod;

    fn candidates(&self, ctx: &MethodContext<'_>) -> Result<Vec<Candidate>, FetchError>;

    fn transfer(&self, ctx: &MethodContext<'_>, candidate: &Candidate) -> DownloadOutcome;
}

pub fn method_for(kind: DownloadMethod) -> Box<dyn AcquisitionMethod> {
    match kind {
        DownloadMethod::Prefetch => Box::new(PrefetchMethod),
        DownloadMethod::AwsHttp => Box::new(AwsHttpMethod),
        DownloadMethod::AwsCp => Box::new(AwsCpMethod),
        DownloadMethod::GcpCp => Box::new(GcpCpMethod),
        DownloadMethod::EnaAscp => Box::new(EnaAscpMethod),
        DownloadMethod::EnaFtp => Box::new(EnaFtpMethod),
    }
}

/// NCBI `prefetch`, which locates the data itself.
pub struct PrefetchMethod;

impl AcquisitionMethod for PrefetchMethod {
    fn kind(&self) -> DownloadMethod {
        DownloadMethod::Prefetch
    }

    fn candidates(&self, _ctx: &MethodContext<'_>) -> Result<Vec<Candidate>, FetchError> {
        Ok(vec![Candidate::resolved(Vec::new())])
    }

    fn transfer(&self, ctx: &MethodContext<'_>, _candidate: &Candidate) -> DownloadOutcome {
        let output = ctx.container_path();
        let max_size = ctx
            .config
            .prefetch_max_size
            .as_deref()
            .unwrap_or(DEFAULT_PREFETCH_MAX_SIZE);
        let mut cmd = Command::new(&ctx.config.tools.prefetch);
        if ctx.config.sequence_only() {
            cmd.arg("--eliminate-quals");
        }
        cmd.arg("--max-size")
            .arg(max_size)
            .arg("-o")
            .arg(&output)
            .arg(ctx.run.as_str());
        if let Err(err) = run_transfer(ctx.config, &mut cmd) {
            return DownloadOutcome::failed(err, vec![output]);
        }
        if !output.exists() {
            return DownloadOutcome::failed(
                FetchError::TransferFailed(format!(
                    "prefetch exited successfully but {} was not written",
                    output.display()
                )),
                Vec::new(),
            );
        }
        DownloadOutcome::Success {
            artifact_paths: vec![output],
        }
    }
}

/// Plain HTTPS from anonymously readable AWS buckets, with `curl` or a
/// multi-connection `aria2c`.
pub struct AwsHttpMethod;

impl AcquisitionMethod for AwsHttpMethod {
    fn kind(&self) -> DownloadMethod {
        DownloadMethod::AwsHttp
    }

    fn candidates(&self, ctx: &MethodContext<'_>) -> Result<Vec<Candidate>, FetchError> {
        if ctx.config.guess_aws_location {
            let guessed = ObjectStoreLocation::guessed_aws_odp(ctx.run);
            return Ok(vec![Candidate {
                locations: vec![Location::ObjectStore(guessed)],
                guessed: true,
            }]);
        }
        let query = ObjectQuery {
            provider: CloudProvider::Aws,
            quality: ContainerQuality::Full,
            allow_paid: false,
        };
        let locations = ctx.resolver.ncbi_locations(ctx.run, &query)?;
        Ok(locations
            .into_iter()
            .filter(|location| match location {
                Location::ObjectStore(loc) => loc.class.is_anonymous() && loc.link.is_some(),
                Location::BulkFtp(_) => false,
            })
            .map(|location| Candidate::resolved(vec![location]))
            .collect())
    }

    fn transfer(&self, ctx: &MethodContext<'_>, candidate: &Candidate) -> DownloadOutcome {
        let output = ctx.container_path();
        let link = match candidate.locations.first() {
            Some(Location::ObjectStore(ObjectStoreLocation {
                link: Some(link), ..
            })) => link.clone(),
            _ => {
                return DownloadOutcome::failed(
                    FetchError::TransferFailed("location has no HTTPS link".to_string()),
                    Vec::new(),
                );
            }
        };
        tracing::info!("downloading .sra file from {link}");
        match fetch_url(ctx.config, &link, &output) {
            Ok(()) => DownloadOutcome::Success {
                artifact_paths: vec![output],
            },
            Err(err) => DownloadOutcome::failed(err, vec![output]),
        }
    }
}

/// `aws s3 cp`, covering requester-pays buckets when allowed.
pub struct AwsCpMethod;

impl AcquisitionMethod for AwsCpMethod {
    fn kind(&self) -> DownloadMethod {
        DownloadMethod::AwsCp
    }

    fn candidates(&self, ctx: &MethodContext<'_>) -> Result<Vec<Candidate>, FetchError> {
        let allow_paid = ctx.config.allow_paid.aws;
        let query = ObjectQuery {
            provider: CloudProvider::Aws,
            quality: ContainerQuality::Full,
            allow_paid,
        };
        let locations = ctx.resolver.ncbi_locations(ctx.run, &query)?;
        Ok(locations
            .into_iter()
            .filter(|location| match location {
                Location::ObjectStore(loc) => allow_paid || !loc.is_paid(),
                Location::BulkFtp(_) => false,
            })
            .map(|location| Candidate::resolved(vec![location]))
            .collect())
    }

    fn transfer(&self, ctx: &MethodContext<'_>, candidate: &Candidate) -> DownloadOutcome {
        let output = ctx.container_path();
        let Some(Location::ObjectStore(location)) = candidate.locations.first() else {
            return DownloadOutcome::failed(
                FetchError::TransferFailed("aws-cp needs an object-store location".to_string()),
                Vec::new(),
            );
        };
        let uri = match location.copy_uri() {
            Ok(uri) => uri,
            Err(err) => return DownloadOutcome::failed(err, Vec::new()),
        };

        let mut cmd = Command::new(&ctx.config.tools.aws);
        cmd.args(["s3", "cp"]).arg(uri).arg(&output);
        match &ctx.config.aws_credentials {
            Some(creds) => {
                cmd.env("AWS_ACCESS_KEY_ID", &creds.access_key_id)
                    .env("AWS_SECRET_ACCESS_KEY", &creds.secret_access_key);
            }
            None if location.class.is_anonymous() => {
                cmd.arg("--no-sign-request");
            }
            None => {}
        }
        if location.is_paid() {
            cmd.args(["--request-payer", "requester"]);
        }
        if ctx.config.hide_download_progress {
            cmd.arg("--only-show-errors");
        }

        tracing::info!("downloading .sra file from {uri} with aws s3 cp");
        match run_transfer(ctx.config, &mut cmd) {
            Ok(()) => DownloadOutcome::Success {
                artifact_paths: vec![output],
            },
            Err(err) => DownloadOutcome::failed(err, vec![output]),
        }
    }
}

/// `gsutil cp` from Google Cloud Storage. Requester-pays buckets are billed
/// to a discovered project.
pub struct GcpCpMethod;

impl AcquisitionMethod for GcpCpMethod {
    fn kind(&self) -> DownloadMethod {
        DownloadMethod::GcpCp
    }

    fn candidates(&self, ctx: &MethodContext<'_>) -> Result<Vec<Candidate>, FetchError> {
        let query = ObjectQuery {
            provider: CloudProvider::Gcp,
            quality: ContainerQuality::Full,
            allow_paid: ctx.config.allow_paid.gcp,
        };
        let locations = ctx.resolver.ncbi_locations(ctx.run, &query)?;
        Ok(locations
            .into_iter()
            .filter(|location| matches!(location, Location::ObjectStore(_)))
            .map(|location| Candidate::resolved(vec![location]))
            .collect())
    }

    fn transfer(&self, ctx: &MethodContext<'_>, candidate: &Candidate) -> DownloadOutcome {
        let output = ctx.container_path();
        let Some(Location::ObjectStore(location)) = candidate.locations.first() else {
            return DownloadOutcome::failed(
                FetchError::TransferFailed("gcp-cp needs an object-store location".to_string()),
                Vec::new(),
            );
        };
        let uri = match location.copy_uri() {
            Ok(uri) => uri,
            Err(err) => return DownloadOutcome::failed(err, Vec::new()),
        };

        let mut cmd = Command::new(&ctx.config.tools.gsutil);
        if location.requires_payment {
            match discover_gcp_project(ctx.config) {
                Ok(project) => {
                    cmd.arg("-u").arg(project);
                }
                Err(err) => return DownloadOutcome::failed(err, Vec::new()),
            }
        }
        cmd.arg("cp").arg(uri).arg(&output);

        tracing::info!("downloading .sra file from {uri} with gsutil");
        match run_transfer(ctx.config, &mut cmd) {
            Ok(()) => DownloadOutcome::Success {
                artifact_paths: vec![output],
            },
            Err(err) => DownloadOutcome::failed(err, vec![output]),
        }
    }
}

#[derive(Deserialize)]
struct GcpKeyFile {
    project_id: Option<String>,
}

/// Billing project: explicit, else the key file's `project_id` after
/// activating it, else the gcloud default.
fn discover_gcp_project(config: &FetchConfig) -> Result<String, FetchError> {
    if let Some(project) = &config.gcp_project {
        return Ok(project.clone());
    }
    if let Some(key_file) = &config.gcp_user_key_file {
        let mut activate = Command::new(&config.tools.gcloud);
        activate
            .args(["auth", "activate-service-account", "--key-file"])
            .arg(key_file);
        process::run_captured(&mut activate).map_err(FetchError::TransferFailed)?;
        let content = fs::read_to_string(key_file)
            .map_err(|err| FetchError::fs(key_file.display(), err))?;
        let key: GcpKeyFile = serde_json::from_str(&content).map_err(|err| {
            FetchError::TransferFailed(format!("{}: {err}", key_file.display()))
        })?;
        if let Some(project) = key.project_id.filter(|p| !p.is_empty()) {
            tracing::info!("using GCP project {project} from the key file");
            return Ok(project);
        }
    }
    let mut cmd = Command::new(&config.tools.gcloud);
    cmd.args(["config", "get-value", "project"]);
    let project = process::run_captured(&mut cmd)
        .map_err(FetchError::TransferFailed)?
        .trim()
        .to_string();
    if project.is_empty() || project == "(unset)" {
        return Err(FetchError::TransferFailed(
            "no GCP project given and none is configured in gcloud".to_string(),
        ));
    }
    tracing::info!("using GCP project {project}");
    Ok(project)
}

/// Aspera transfer of the ENA gzipped FASTQ files.
pub struct EnaAscpMethod;

impl AcquisitionMethod for EnaAscpMethod {
    fn kind(&self) -> DownloadMethod {
        DownloadMethod::EnaAscp
    }

    fn candidates(&self, ctx: &MethodContext<'_>) -> Result<Vec<Candidate>, FetchError> {
        ena_candidates(ctx)
    }

    fn transfer(&self, ctx: &MethodContext<'_>, candidate: &Candidate) -> DownloadOutcome {
        let Some(key) = ctx.config.resolve_ascp_ssh_key() else {
            return DownloadOutcome::failed(
                FetchError::TransferFailed("no aspera ssh key available".to_string()),
                Vec::new(),
            );
        };
        transfer_each(ctx, candidate, |location, _output| {
            let mut cmd = Command::new(&ctx.config.tools.ascp);
            cmd.args(["-T", "-l", "300m", "-P33001"])
                .args(ctx.config.ascp_args.split_whitespace());
            if ctx.config.hide_download_progress {
                cmd.arg("-Q");
            }
            cmd.arg("-i")
                .arg(&key)
                .arg(format!("{ENA_ASPERA_HOST}:{}", location.aspera_path()))
                .arg(ctx.output_dir());
            run_transfer(ctx.config, &mut cmd)
        })
    }
}

/// FTP transfer of the ENA gzipped FASTQ files.
pub struct EnaFtpMethod;

impl AcquisitionMethod for EnaFtpMethod {
    fn kind(&self) -> DownloadMethod {
        DownloadMethod::EnaFtp
    }

    fn candidates(&self, ctx: &MethodContext<'_>) -> Result<Vec<Candidate>, FetchError> {
        ena_candidates(ctx)
    }

    fn transfer(&self, ctx: &MethodContext<'_>, candidate: &Candidate) -> DownloadOutcome {
        transfer_each(ctx, candidate, |location, output| {
            fetch_url(ctx.config, &location.ftp_url(), output)
        })
    }
}

fn ena_candidates(ctx: &MethodContext<'_>) -> Result<Vec<Candidate>, FetchError> {
    let locations = ctx.resolver.ena_locations(ctx.run)?;
    if locations.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![Candidate::resolved(locations)])
}

/// Fetch every bulk-archive file of `candidate` in order. A failure reports
/// every file touched so far as partial.
fn transfer_each<F>(ctx: &MethodContext<'_>, candidate: &Candidate, mut fetch: F) -> DownloadOutcome
where
    F: FnMut(&BulkFtpLocation, &Path) -> Result<(), FetchError>,
{
    let mut written = Vec::new();
    for location in &candidate.locations {
        let Location::BulkFtp(location) = location else {
            return DownloadOutcome::failed(
                FetchError::TransferFailed("expected an ENA file location".to_string()),
                written,
            );
        };
        let output = ctx.output_dir().join(location.file_name());
        tracing::info!("downloading {}", location.url);
        written.push(output.clone());
        if let Err(err) = fetch(location, &output) {
            return DownloadOutcome::failed(err, written);
        }
    }
    DownloadOutcome::Success {
        artifact_paths: written,
    }
}

/// Single-connection `curl`, or `aria2c` when more than one download thread
/// is configured.
fn fetch_url(config: &FetchConfig, url: &str, output: &Path) -> Result<(), FetchError> {
    let mut cmd = if config.download_threads > 1 {
        if config.download_threads > config.threads_for_aria2() {
            tracing::warn!(
                "capping aria2c at {} connections (requested {})",
                config.threads_for_aria2(),
                config.download_threads
            );
        }
        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        let name = output
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut cmd = Command::new(&config.tools.aria2c);
        cmd.arg("-x")
            .arg(config.threads_for_aria2().to_string())
            .arg("-d")
            .arg(dir)
            .arg("-o")
            .arg(name);
        if config.hide_download_progress {
            cmd.arg("--quiet");
        }
        cmd
    } else {
        let mut cmd = Command::new(&config.tools.curl);
        cmd.arg("--fail").arg("-o").arg(output);
        if config.hide_download_progress {
            cmd.args(["--silent", "--show-error"]);
        }
        cmd
    };
    cmd.arg(url);
    run_transfer(config, &mut cmd)
}

fn run_transfer(config: &FetchConfig, cmd: &mut Command) -> Result<(), FetchError> {
    let result = if config.hide_download_progress {
        process::run_captured(cmd).map(|_| ())
    } else {
        process::run_visible(cmd)
    };
    result.map_err(FetchError::TransferFailed)
}
