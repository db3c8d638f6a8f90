use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_run_fetch::app::{App, BatchReport, ProgressSink, RunInput};
use kira_run_fetch::config::{AwsCredentials, ConfigLoader, FetchConfig, PaidSources};
use kira_run_fetch::domain::{DownloadMethod, OutputFormat};
use kira_run_fetch::error::FetchError;
use kira_run_fetch::output::{HumanOutput, JsonOutput, OutputMode};
use kira_run_fetch::resolver::HttpLocationResolver;

#[derive(Parser)]
#[command(name = "kira-rf")]
#[command(about = "Download sequencing runs from SRA, ENA or their cloud mirrors and extract reads")]
#[command(version, author)]
struct Cli {
    /// Print the batch report as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download runs and extract them to the requested formats")]
    Get(GetArgs),
    #[command(about = "Extract local .sra files")]
    Extract(ExtractArgs),
}

#[derive(Args, Clone)]
struct OutputArgs {
    /// Acceptable output formats, most preferred first.
    #[arg(short = 'f', long = "output-format-possibilities", num_args = 1..)]
    output_formats: Option<Vec<OutputFormat>>,

    #[arg(long = "output-directory")]
    output_dir: Option<PathBuf>,

    /// Replace outputs that already exist.
    #[arg(long)]
    force: bool,

    /// Extract reads in container order, streaming through compressors.
    #[arg(long)]
    unsorted: bool,

    /// Write reads to stdout; requires --unsorted.
    #[arg(long)]
    stdout: bool,

    #[arg(short = 't', long = "extraction-threads")]
    extraction_threads: Option<usize>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Clone)]
#[command(group(
    ArgGroup::new("input")
        .required(true)
        .args(["run_identifiers", "run_identifiers_list", "bioproject_accession"])
))]
struct GetArgs {
    #[arg(short = 'r', long = "run-identifiers", num_args = 1..)]
    run_identifiers: Option<Vec<String>>,

    /// File with one run identifier per line.
    #[arg(long = "run-identifiers-list")]
    run_identifiers_list: Option<PathBuf>,

    #[arg(short = 'p', long = "bioproject-accession")]
    bioproject_accession: Option<String>,

    /// Download methods to try, in order.
    #[arg(short = 'm', long = "download-methods", num_args = 1.., required = true)]
    methods: Vec<DownloadMethod>,

    #[command(flatten)]
    output: OutputArgs,

    /// Allow requester-pays buckets on every provider.
    #[arg(long)]
    allow_paid: bool,

    #[arg(long)]
    allow_paid_from_aws: bool,

    #[arg(long)]
    allow_paid_from_gcp: bool,

    /// Download from the usual AWS Open Data path without asking NCBI.
    #[arg(long)]
    guess_aws_location: bool,

    #[arg(long)]
    check_md5sums: bool,

    #[arg(long = "download-threads")]
    download_threads: Option<usize>,

    #[arg(long)]
    hide_download_progress: bool,

    /// Passed to `prefetch --max-size`, e.g. 20G.
    #[arg(long)]
    prefetch_max_size: Option<String>,

    #[arg(long)]
    gcp_project: Option<String>,

    #[arg(long)]
    gcp_user_key_file: Option<PathBuf>,

    #[arg(long, requires = "aws_secret_access_key")]
    aws_access_key_id: Option<String>,

    #[arg(long, requires = "aws_access_key_id")]
    aws_secret_access_key: Option<String>,

    #[arg(long)]
    ascp_ssh_key: Option<PathBuf>,

    #[arg(long, allow_hyphen_values = true)]
    ascp_args: Option<String>,
}

#[derive(Args, Clone)]
struct ExtractArgs {
    /// Local .sra files to extract.
    #[arg(long = "sra", num_args = 1.., required = true)]
    containers: Vec<PathBuf>,

    #[command(flatten)]
    output: OutputArgs,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<FetchError>() {
                return ExitCode::from(err.exit_code());
            }
            ExitCode::from(1)
        }
    }
}

fn run() -> miette::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Get(args) => run_get(args, output_mode),
        Commands::Extract(args) => run_extract(args, output_mode),
    }
}

fn run_get(args: GetArgs, output_mode: OutputMode) -> miette::Result<u8> {
    let input = if let Some(runs) = args.run_identifiers.clone() {
        RunInput::Runs(runs)
    } else if let Some(path) = args.run_identifiers_list.clone() {
        RunInput::ListFile(path)
    } else if let Some(accession) = args.bioproject_accession.clone() {
        RunInput::BioProject(accession)
    } else {
        return Err(FetchError::Configuration("no run identifiers given".to_string()).into());
    };

    let config = build_get_config(args, output_mode)?;
    config.validate()?;

    let resolver = HttpLocationResolver::new()?;
    let app = App::new(resolver, config);
    let runs = app.resolve_runs(&input)?;
    if runs.is_empty() {
        tracing::warn!("no runs to download");
    }
    let report = with_sink(output_mode, |sink| app.download_and_extract(&runs, sink));
    finish(&report, output_mode)
}

fn run_extract(args: ExtractArgs, output_mode: OutputMode) -> miette::Result<u8> {
    let file = ConfigLoader::load(args.output.config.as_deref())?;
    let mut config = FetchConfig::from_file(Vec::new(), file);
    apply_output_args(&mut config, &args.output, output_mode);
    config.validate_extraction()?;

    let resolver = HttpLocationResolver::new()?;
    let app = App::new(resolver, config);
    let report = with_sink(output_mode, |sink| app.extract(&args.containers, sink));
    finish(&report, output_mode)
}

fn build_get_config(args: GetArgs, output_mode: OutputMode) -> Result<FetchConfig, FetchError> {
    let file = ConfigLoader::load(args.output.config.as_deref())?;
    let mut config = FetchConfig::from_file(args.methods.clone(), file);
    apply_output_args(&mut config, &args.output, output_mode);

    if args.allow_paid {
        config.allow_paid = PaidSources::all();
    }
    config.allow_paid.aws |= args.allow_paid_from_aws;
    config.allow_paid.gcp |= args.allow_paid_from_gcp;
    config.guess_aws_location = args.guess_aws_location;
    config.check_md5sums = args.check_md5sums;
    config.hide_download_progress = args.hide_download_progress;
    if let Some(threads) = args.download_threads {
        config.download_threads = threads;
    }
    if args.prefetch_max_size.is_some() {
        config.prefetch_max_size = args.prefetch_max_size;
    }
    if args.gcp_project.is_some() {
        config.gcp_project = args.gcp_project;
    }
    if args.gcp_user_key_file.is_some() {
        config.gcp_user_key_file = args.gcp_user_key_file;
    }
    if let (Some(access_key_id), Some(secret_access_key)) =
        (args.aws_access_key_id, args.aws_secret_access_key)
    {
        config.aws_credentials = Some(AwsCredentials {
            access_key_id,
            secret_access_key,
        });
    }
    if args.ascp_ssh_key.is_some() {
        config.ascp_ssh_key = args.ascp_ssh_key;
    }
    if let Some(ascp_args) = args.ascp_args {
        config.ascp_args = ascp_args;
    }
    Ok(config)
}

fn apply_output_args(config: &mut FetchConfig, args: &OutputArgs, output_mode: OutputMode) {
    if let Some(formats) = &args.output_formats {
        config.output_formats = formats.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(threads) = args.extraction_threads {
        config.extraction_threads = threads;
    }
    config.force = args.force;
    config.unsorted = args.unsorted;
    config.stdout = args.stdout;
    config.json_report = output_mode == OutputMode::Json;
}

fn with_sink<F>(output_mode: OutputMode, work: F) -> BatchReport
where
    F: FnOnce(&dyn ProgressSink) -> BatchReport,
{
    match output_mode {
        OutputMode::Json => work(&JsonOutput),
        OutputMode::Human => work(&HumanOutput),
    }
}

fn finish(report: &BatchReport, output_mode: OutputMode) -> miette::Result<u8> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_report(report).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_summary(report),
    }
    Ok(report.exit_code())
}
