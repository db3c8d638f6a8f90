use std::cell::Cell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use assert_matches::assert_matches;
use kira_run_fetch::config::FetchConfig;
use kira_run_fetch::domain::{DownloadMethod, OutputFormat, RunId};
use kira_run_fetch::error::FetchError;
use kira_run_fetch::fallback::{AttemptState, FallbackEngine};
use kira_run_fetch::location::{BulkFtpLocation, Location, ObjectQuery};
use kira_run_fetch::methods::{AcquisitionMethod, Candidate, DownloadOutcome, MethodContext};
use kira_run_fetch::resolver::LocationResolver;
use kira_run_fetch::verify::md5_file;

struct NullResolver;

impl LocationResolver for NullResolver {
    fn ncbi_locations(&self, _: &RunId, _: &ObjectQuery) -> Result<Vec<Location>, FetchError> {
        Ok(Vec::new())
    }
    fn ena_locations(&self, _: &RunId) -> Result<Vec<Location>, FetchError> {
        Ok(Vec::new())
    }
    fn bioproject_runs(&self, _: &str) -> Result<Vec<RunId>, FetchError> {
        Ok(Vec::new())
    }
}

enum Plan {
    NoLocation,
    Resolution,
    /// Write these (file name, content) pairs and report success.
    Write(Vec<(&'static str, Vec<u8>)>),
    /// Leave a partial container behind and report a failure.
    Fail { terminal: bool },
}

struct FakeMethod {
    kind: DownloadMethod,
    plan: Plan,
    checksums: Vec<Option<String>>,
    transfers: Rc<Cell<usize>>,
}

impl FakeMethod {
    fn new(kind: DownloadMethod, plan: Plan) -> Self {
        Self {
            kind,
            plan,
            checksums: Vec::new(),
            transfers: Rc::new(Cell::new(0)),
        }
    }

    fn with_checksum(mut self, checksum: &str) -> Self {
        self.checksums = vec![Some(checksum.to_string())];
        self
    }

    fn transfer_count(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.transfers)
    }
}

impl AcquisitionMethod for FakeMethod {
    fn kind(&self) -> DownloadMethod {
        self.kind
    }

    fn candidates(&self, _ctx: &MethodContext<'_>) -> Result<Vec<Candidate>, FetchError> {
        match &self.plan {
            Plan::NoLocation => Ok(Vec::new()),
            Plan::Resolution => Err(FetchError::Resolution("garbage".to_string())),
            Plan::Fail { .. } => Ok(vec![Candidate::resolved(Vec::new())]),
            Plan::Write(files) => {
                let locations = files
                    .iter()
                    .enumerate()
                    .map(|(i, (name, _))| {
                        Location::BulkFtp(BulkFtpLocation {
                            url: format!("ftp.example.org/{name}"),
                            checksum: self
                                .checksums
                                .get(i)
                                .cloned()
                                .flatten()
                                .map(|c| c.parse().unwrap()),
                        })
                    })
                    .collect();
                Ok(vec![Candidate::resolved(locations)])
            }
        }
    }

    fn transfer(&self, ctx: &MethodContext<'_>, _candidate: &Candidate) -> DownloadOutcome {
        self.transfers.set(self.transfers.get() + 1);
        if let Plan::Fail { terminal } = &self.plan {
            let partial = ctx.config.output_dir.join("SRR12118866.sra");
            fs::write(&partial, b"NCBI.sra trunc").unwrap();
            let reason = if *terminal {
                FetchError::Filesystem("disk full".to_string())
            } else {
                FetchError::TransferFailed("connection reset".to_string())
            };
            return DownloadOutcome::Failure {
                reason,
                partial_paths: vec![partial],
            };
        }
        let Plan::Write(files) = &self.plan else {
            unreachable!("transfer without candidates");
        };
        let mut paths = Vec::new();
        for (name, content) in files {
            let path = ctx.config.output_dir.join(name);
            fs::write(&path, content).unwrap();
            paths.push(path);
        }
        DownloadOutcome::Success {
            artifact_paths: paths,
        }
    }
}

fn sra_bytes() -> Vec<u8> {
    b"NCBI.sra\x8f\xe2\x99\x11 container".to_vec()
}

fn gz_bytes() -> Vec<u8> {
    vec![0x1f, 0x8b, 0x08, 0x00, 0x01, 0x02]
}

fn config(dir: &std::path::Path, formats: Vec<OutputFormat>) -> FetchConfig {
    let mut config = FetchConfig::new(Vec::new());
    config.output_dir = dir.to_path_buf();
    config.output_formats = formats;
    config
}

fn boxed(methods: Vec<FakeMethod>) -> Vec<Box<dyn AcquisitionMethod>> {
    methods
        .into_iter()
        .map(|m| Box::new(m) as Box<dyn AcquisitionMethod>)
        .collect()
}

fn run() -> RunId {
    "SRR12118866".parse().unwrap()
}

#[test]
fn no_location_then_paired_success() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![OutputFormat::FastqGz]);
    let methods = boxed(vec![
        FakeMethod::new(DownloadMethod::AwsHttp, Plan::NoLocation),
        FakeMethod::new(
            DownloadMethod::EnaFtp,
            Plan::Write(vec![
                ("SRR12118866_1.fastq.gz", gz_bytes()),
                ("SRR12118866_2.fastq.gz", gz_bytes()),
            ]),
        ),
    ]);

    let report = FallbackEngine::new(&config, &NullResolver).run(&run(), &methods);
    let expected: Vec<PathBuf> = vec![
        dir.path().join("SRR12118866_1.fastq.gz"),
        dir.path().join("SRR12118866_2.fastq.gz"),
    ];
    assert_matches!(
        &report.outcome,
        DownloadOutcome::Success { artifact_paths } if *artifact_paths == expected
    );
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[0].method, DownloadMethod::AwsHttp);
    assert_eq!(report.attempts[0].state, AttemptState::FailedRecoverable);
    assert!(report.attempts[0].error.as_deref().unwrap().contains("no location"));
    assert_eq!(report.attempts[1].state, AttemptState::Succeeded);

    let acquired = report.into_result(&run()).unwrap();
    assert_eq!(acquired.method, DownloadMethod::EnaFtp);
}

#[test]
fn later_methods_never_attempted_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![OutputFormat::Fastq]);
    let first = FakeMethod::new(
        DownloadMethod::Prefetch,
        Plan::Write(vec![("SRR12118866.sra", sra_bytes())]),
    );
    let second = FakeMethod::new(
        DownloadMethod::AwsHttp,
        Plan::Write(vec![("SRR12118866.sra", sra_bytes())]),
    );
    let first_count = first.transfer_count();
    let second_count = second.transfer_count();
    let methods: Vec<Box<dyn AcquisitionMethod>> = vec![Box::new(first), Box::new(second)];

    let report = FallbackEngine::new(&config, &NullResolver).run(&run(), &methods);
    assert_eq!(first_count.get(), 1);
    assert_eq!(second_count.get(), 0);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].method, DownloadMethod::Prefetch);
    assert!(report.into_result(&run()).is_ok());
}

#[test]
fn wrong_magic_is_rejected_and_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![OutputFormat::Fastq]);
    let methods = boxed(vec![FakeMethod::new(
        DownloadMethod::AwsHttp,
        Plan::Write(vec![(
            "SRR12118866.sra",
            b"<?xml version=\"1.0\"?><Error>AccessDenied</Error>".to_vec(),
        )]),
    )]);

    let report = FallbackEngine::new(&config, &NullResolver).run(&run(), &methods);
    assert_matches!(&report.outcome, DownloadOutcome::Failure { .. });
    assert_eq!(report.attempts[0].reached, Some(AttemptState::Validating));
    assert!(!dir.path().join("SRR12118866.sra").exists());
    assert_matches!(
        report.into_result(&run()),
        Err(FetchError::NoDownloadMethodSucceeded(_))
    );
}

#[test]
fn checksum_mismatch_falls_through_to_next_method() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), vec![OutputFormat::Fastq]);
    config.check_md5sums = true;

    let reference = dir.path().join("reference");
    fs::write(&reference, sra_bytes()).unwrap();
    let good = md5_file(&reference).unwrap();
    fs::remove_file(&reference).unwrap();

    let methods = boxed(vec![
        FakeMethod::new(
            DownloadMethod::AwsHttp,
            Plan::Write(vec![("SRR12118866.sra", sra_bytes())]),
        )
        .with_checksum("00000000000000000000000000000000"),
        FakeMethod::new(
            DownloadMethod::GcpCp,
            Plan::Write(vec![("SRR12118866.sra", sra_bytes())]),
        )
        .with_checksum(good.as_str()),
    ]);

    let report = FallbackEngine::new(&config, &NullResolver).run(&run(), &methods);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[0].state, AttemptState::FailedRecoverable);
    assert!(report.attempts[0].error.as_deref().unwrap().contains("md5"));
    let acquired = report.into_result(&run()).unwrap();
    assert_eq!(acquired.method, DownloadMethod::GcpCp);
    assert!(dir.path().join("SRR12118866.sra").exists());
}

#[test]
fn resolution_error_poisons_only_its_service() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![OutputFormat::Fastq]);
    let aws_cp = FakeMethod::new(
        DownloadMethod::AwsCp,
        Plan::Write(vec![("SRR12118866.sra", sra_bytes())]),
    );
    let methods: Vec<Box<dyn AcquisitionMethod>> = vec![
        Box::new(FakeMethod::new(DownloadMethod::AwsHttp, Plan::Resolution)),
        Box::new(aws_cp),
        Box::new(FakeMethod::new(
            DownloadMethod::EnaFtp,
            Plan::Write(vec![("SRR12118866.fastq.gz", gz_bytes())]),
        )),
    ];

    let report = FallbackEngine::new(&config, &NullResolver).run(&run(), &methods);
    let states: Vec<AttemptState> = report.attempts.iter().map(|a| a.state).collect();
    assert_eq!(
        states,
        vec![
            AttemptState::FailedRecoverable,
            AttemptState::Skipped,
            AttemptState::Succeeded
        ]
    );
    assert_eq!(report.into_result(&run()).unwrap().method, DownloadMethod::EnaFtp);
}

#[test]
fn only_resolution_failures_surface_as_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![OutputFormat::Fastq]);
    let methods = boxed(vec![FakeMethod::new(DownloadMethod::AwsHttp, Plan::Resolution)]);
    let report = FallbackEngine::new(&config, &NullResolver).run(&run(), &methods);
    assert_matches!(report.into_result(&run()), Err(FetchError::Resolution(_)));
}

#[test]
fn bulk_archive_skipped_when_only_container_requested() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![OutputFormat::Sra]);
    let ena = FakeMethod::new(
        DownloadMethod::EnaFtp,
        Plan::Write(vec![("SRR12118866.fastq.gz", gz_bytes())]),
    );
    let methods: Vec<Box<dyn AcquisitionMethod>> = vec![Box::new(ena)];
    let report = FallbackEngine::new(&config, &NullResolver).run(&run(), &methods);
    assert_eq!(report.attempts[0].state, AttemptState::Skipped);
    assert!(!dir.path().join("SRR12118866.fastq.gz").exists());
    assert_matches!(
        report.into_result(&run()),
        Err(FetchError::NoDownloadMethodSucceeded(_))
    );
}

#[test]
fn failed_transfer_cleans_up_and_moves_on() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![OutputFormat::Fastq]);
    let methods = boxed(vec![
        FakeMethod::new(DownloadMethod::Prefetch, Plan::Fail { terminal: false }),
        FakeMethod::new(
            DownloadMethod::EnaFtp,
            Plan::Write(vec![("SRR12118866.fastq.gz", gz_bytes())]),
        ),
    ]);

    let report = FallbackEngine::new(&config, &NullResolver).run(&run(), &methods);
    assert_eq!(report.attempts[0].state, AttemptState::FailedRecoverable);
    assert_eq!(report.attempts[0].reached, Some(AttemptState::Transferring));
    assert!(!dir.path().join("SRR12118866.sra").exists());
    assert_eq!(report.into_result(&run()).unwrap().method, DownloadMethod::EnaFtp);
}

#[test]
fn terminal_error_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), vec![OutputFormat::Fastq]);
    let second = FakeMethod::new(
        DownloadMethod::AwsHttp,
        Plan::Write(vec![("SRR12118866.sra", sra_bytes())]),
    );
    let second_count = second.transfer_count();
    let methods: Vec<Box<dyn AcquisitionMethod>> = vec![
        Box::new(FakeMethod::new(
            DownloadMethod::Prefetch,
            Plan::Fail { terminal: true },
        )),
        Box::new(second),
    ];

    let report = FallbackEngine::new(&config, &NullResolver).run(&run(), &methods);
    assert_eq!(second_count.get(), 0);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].state, AttemptState::Failed);
    assert!(!dir.path().join("SRR12118866.sra").exists());
    assert_matches!(report.into_result(&run()), Err(FetchError::Filesystem(_)));
}
