use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{DownloadMethod, OutputFormat};
use crate::error::FetchError;
use crate::process::ToolPaths;

pub const DEFAULT_THREADS: usize = 8;
pub const DEFAULT_ASCP_ARGS: &str = "-k 2";
pub const CONFIG_FILE_NAME: &str = "kira-rf.json";
const ASPERA_KEY_RELATIVE: &str = ".aspera/connect/etc/asperaweb_id_dsa.openssh";

pub fn default_output_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Fastq, OutputFormat::FastqGz]
}

/// Requester-pays sources the caller agreed to be billed for, per provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaidSources {
    #[serde(default)]
    pub aws: bool,
    #[serde(default)]
    pub gcp: bool,
}

impl PaidSources {
    pub fn all() -> Self {
        Self {
            aws: true,
            gcp: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Everything one batch needs. Built once, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub methods: Vec<DownloadMethod>,
    pub output_formats: Vec<OutputFormat>,
    pub output_dir: PathBuf,
    pub force: bool,
    pub unsorted: bool,
    pub stdout: bool,
    /// The batch report is printed to stdout as JSON.
    pub json_report: bool,
    pub allow_paid: PaidSources,
    pub guess_aws_location: bool,
    pub check_md5sums: bool,
    pub download_threads: usize,
    pub extraction_threads: usize,
    pub hide_download_progress: bool,
    /// Passed verbatim to `prefetch --max-size`, e.g. `1M` or `20G`.
    pub prefetch_max_size: Option<String>,
    pub gcp_project: Option<String>,
    pub gcp_user_key_file: Option<PathBuf>,
    pub aws_credentials: Option<AwsCredentials>,
    pub ascp_ssh_key: Option<PathBuf>,
    pub ascp_args: String,
    pub tools: ToolPaths,
}

impl FetchConfig {
    pub fn new(methods: Vec<DownloadMethod>) -> Self {
        Self {
            methods,
            output_formats: default_output_formats(),
            output_dir: PathBuf::from("."),
            force: false,
            unsorted: false,
            stdout: false,
            json_report: false,
            allow_paid: PaidSources::default(),
            guess_aws_location: false,
            check_md5sums: false,
            download_threads: DEFAULT_THREADS,
            extraction_threads: DEFAULT_THREADS,
            hide_download_progress: false,
            prefetch_max_size: None,
            gcp_project: None,
            gcp_user_key_file: None,
            aws_credentials: None,
            ascp_ssh_key: None,
            ascp_args: DEFAULT_ASCP_ARGS.to_string(),
            tools: ToolPaths::default(),
        }
    }

    /// Layer values from a config file under a fresh configuration.
    pub fn from_file(methods: Vec<DownloadMethod>, file: ConfigFile) -> Self {
        let mut config = Self::new(methods);
        if let Some(formats) = file.output_formats {
            config.output_formats = formats;
        }
        if let Some(dir) = file.output_dir {
            config.output_dir = dir;
        }
        if let Some(paid) = file.allow_paid {
            config.allow_paid = paid;
        }
        if let Some(threads) = file.download_threads {
            config.download_threads = threads;
        }
        if let Some(threads) = file.extraction_threads {
            config.extraction_threads = threads;
        }
        config.prefetch_max_size = file.prefetch_max_size;
        config.gcp_project = file.gcp_project;
        config.gcp_user_key_file = file.gcp_user_key_file;
        config.aws_credentials = file.aws;
        config.ascp_ssh_key = file.ascp_ssh_key;
        if let Some(args) = file.ascp_args {
            config.ascp_args = args;
        }
        if let Some(tools) = file.tools {
            config.tools = tools;
        }
        config
    }

    pub fn threads_for_aria2(&self) -> usize {
        self.download_threads.min(16)
    }

    /// Every requested format is sequence-only, so quality scores are not
    /// needed from the container.
    pub fn sequence_only(&self) -> bool {
        !self.output_formats.is_empty() && self.output_formats.iter().all(|f| f.is_sequence_only())
    }

    /// The Aspera key to use: explicit, else the Aspera Connect default in
    /// the user's home directory.
    pub fn resolve_ascp_ssh_key(&self) -> Option<PathBuf> {
        if let Some(key) = &self.ascp_ssh_key {
            return Some(key.clone());
        }
        let key = BaseDirs::new()?.home_dir().join(ASPERA_KEY_RELATIVE);
        key.exists().then_some(key)
    }

    /// Reject conflicting or missing options before anything touches the
    /// network, and warn about options that will have no effect.
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.methods.is_empty() {
            return Err(FetchError::Configuration(
                "at least one download method is required".to_string(),
            ));
        }
        if self.output_formats.is_empty() {
            return Err(FetchError::Configuration(
                "at least one output format is required".to_string(),
            ));
        }
        self.validate_extraction()?;
        if self.download_threads == 0 {
            return Err(FetchError::Configuration(
                "download threads must be at least 1".to_string(),
            ));
        }
        if self.gcp_project.is_some() && self.gcp_user_key_file.is_some() {
            return Err(FetchError::Configuration(
                "--gcp-project is incompatible with --gcp-user-key-file; the project in the key file is used when no project is given".to_string(),
            ));
        }
        if let Some(creds) = &self.aws_credentials {
            if creds.access_key_id.is_empty() || creds.secret_access_key.is_empty() {
                return Err(FetchError::Configuration(
                    "AWS credentials need both a key id and a secret".to_string(),
                ));
            }
        }
        if self.methods.contains(&DownloadMethod::EnaAscp) && self.resolve_ascp_ssh_key().is_none()
        {
            return Err(FetchError::Configuration(
                "cannot find aspera ssh key file, please specify one with --ascp-ssh-key".to_string(),
            ));
        }

        if self.guess_aws_location && self.check_md5sums {
            tracing::warn!(
                "guessing the AWS location is not compatible with checking md5sums; guessed AWS downloads will not be verified"
            );
        }
        if self.allow_paid.gcp && !self.methods.contains(&DownloadMethod::GcpCp) {
            tracing::warn!(
                "allowing download from requester-pays GCP buckets, but gcp-cp is not a selected download method, so this has no effect"
            );
        }
        if self.allow_paid.aws && !self.methods.contains(&DownloadMethod::AwsCp) {
            tracing::warn!(
                "allowing download from requester-pays AWS buckets, but aws-cp is not a selected download method, so this has no effect"
            );
        }
        Ok(())
    }

    /// The subset of checks that also applies to standalone extraction.
    pub fn validate_extraction(&self) -> Result<(), FetchError> {
        if self.stdout && !self.unsorted {
            return Err(FetchError::Configuration(
                "--stdout must be used with --unsorted".to_string(),
            ));
        }
        if self.stdout && self.json_report {
            return Err(FetchError::Configuration(
                "--stdout cannot be combined with --json, both write to stdout".to_string(),
            ));
        }
        if self.stdout && self.output_formats.first() == Some(&OutputFormat::Sra) {
            return Err(FetchError::Configuration(
                "--stdout cannot write the sra format".to_string(),
            ));
        }
        if self.extraction_threads == 0 {
            return Err(FetchError::Configuration(
                "extraction threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// On-disk defaults, all optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub output_formats: Option<Vec<OutputFormat>>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub allow_paid: Option<PaidSources>,
    #[serde(default)]
    pub download_threads: Option<usize>,
    #[serde(default)]
    pub extraction_threads: Option<usize>,
    #[serde(default)]
    pub prefetch_max_size: Option<String>,
    #[serde(default)]
    pub gcp_project: Option<String>,
    #[serde(default)]
    pub gcp_user_key_file: Option<PathBuf>,
    #[serde(default)]
    pub aws: Option<AwsCredentials>,
    #[serde(default)]
    pub ascp_ssh_key: Option<PathBuf>,
    #[serde(default)]
    pub ascp_args: Option<String>,
    #[serde(default)]
    pub tools: Option<ToolPaths>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load `path`, or `kira-rf.json` from the working directory when it
    /// exists. A missing default file yields empty defaults.
    pub fn load(path: Option<&Path>) -> Result<ConfigFile, FetchError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };
        if path.is_none() && !config_path.exists() {
            return Ok(ConfigFile::default());
        }
        let content = fs::read_to_string(&config_path)
            .map_err(|_| FetchError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<ConfigFile, FetchError> {
        serde_json::from_str(content).map_err(|err| FetchError::ConfigParse(err.to_string()))
    }
}
