//! Turning a raw `.sra` container (or bulk-archive reads) into the requested
//! output format.
//!
//! Three regimes:
//!
//! - **ordered**: `fasterq-dump` writes FASTQ with mates kept in step, then the
//!   cheapest conversion chain derives the first requested format from it;
//! - **unordered**: `sracat` streams reads in container order. Compressed
//!   formats are produced by one `pigz` per named pipe, concurrently with
//!   `sracat`, so the uncompressed reads never touch the disk;
//! - **stdout**: `sracat` (optionally through `pigz`) streams to our stdout.
//!
//! Known risk: `sracat` does not signal some malformed-input errors through
//! its exit status. The only available signal is missing or empty output,
//! which is reported as [`FetchError::NoOutputProduced`].

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::config::FetchConfig;
use crate::convert::{self, can_derive, convert_reads};
use crate::domain::{OutputFormat, RunId};
use crate::error::FetchError;
use crate::outputs::{self, ExistingOutputs, read_file_names};
use crate::process;

const PIPE_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
const PIPE_OPEN_POLL: Duration = Duration::from_millis(10);

pub struct Extractor<'a> {
    config: &'a FetchConfig,
}

impl<'a> Extractor<'a> {
    pub fn new(config: &'a FetchConfig) -> Self {
        Self { config }
    }

    /// Extract `container` into the configured output directory. Existing
    /// outputs short-circuit the dump tool unless forced. The container itself
    /// is left in place.
    pub fn extract(&self, container: &Path) -> Result<Vec<PathBuf>, FetchError> {
        let run = run_from_container(container)?;
        tracing::debug!("using run identifier {run}");
        let dir = &self.config.output_dir;

        if !self.config.stdout {
            // The container is the input here, never an output to replace.
            let formats: Vec<OutputFormat> = self
                .config
                .output_formats
                .iter()
                .copied()
                .filter(|format| *format != OutputFormat::Sra)
                .collect();
            let existing = outputs::check_existing(dir, &run, &formats, self.config.force)?;
            if let ExistingOutputs::Skip(paths) = existing {
                return Ok(paths);
            }
        }

        let container = fs::canonicalize(container)
            .map_err(|err| FetchError::fs(container.display(), err))?;
        let format = self.first_extractable_format()?;

        if self.config.stdout {
            self.extract_to_stdout(&container, format)?;
            return Ok(Vec::new());
        }
        let produced = if self.config.unsorted {
            self.extract_unordered(&container, &run, format)?
        } else {
            self.extract_ordered(&container, &run)?
        };
        if produced.is_empty() {
            return Err(FetchError::NoOutputProduced(run.to_string()));
        }
        tracing::info!("output files: {}", display_paths(&produced));
        Ok(produced)
    }

    /// Convert gzipped FASTQ fetched from the bulk archive into the first
    /// requested format derivable from it.
    pub fn convert_downloaded(&self, files: &[PathBuf]) -> Result<Vec<PathBuf>, FetchError> {
        let formats = &self.config.output_formats;
        if formats.contains(&OutputFormat::FastqGz) {
            return Ok(files.to_vec());
        }
        let target = formats
            .iter()
            .copied()
            .find(|format| can_derive(OutputFormat::FastqGz, *format))
            .ok_or_else(|| {
                FetchError::ConversionFailed(
                    "no requested format can be derived from fastq.gz".to_string(),
                )
            })?;
        files
            .iter()
            .map(|file| {
                convert_reads(
                    &self.config.tools,
                    self.config.extraction_threads,
                    file,
                    OutputFormat::FastqGz,
                    target,
                )
            })
            .collect()
    }

    fn first_extractable_format(&self) -> Result<OutputFormat, FetchError> {
        self.config
            .output_formats
            .iter()
            .copied()
            .find(|format| *format != OutputFormat::Sra)
            .ok_or_else(|| {
                FetchError::Configuration("no output format requires extraction".to_string())
            })
    }

    fn extract_ordered(&self, container: &Path, run: &RunId) -> Result<Vec<PathBuf>, FetchError> {
        let dir = &self.config.output_dir;
        let formats = &self.config.output_formats;
        tracing::info!("extracting .sra file with fasterq-dump");
        let mut cmd = Command::new(&self.config.tools.fasterq_dump);
        cmd.arg("--threads")
            .arg(self.config.extraction_threads.to_string())
            .arg(container)
            .current_dir(dir);
        process::run_visible(&mut cmd).map_err(FetchError::ConversionFailed)?;

        let fastqs = outputs::present_paths(dir, run, OutputFormat::Fastq);
        if formats.contains(&OutputFormat::Fastq) {
            return Ok(fastqs);
        }
        let target = formats
            .iter()
            .copied()
            .find(|format| can_derive(OutputFormat::Fastq, *format))
            .ok_or_else(|| {
                FetchError::ConversionFailed("no requested format can be derived from fastq".to_string())
            })?;
        fastqs
            .iter()
            .map(|fastq| {
                convert_reads(
                    &self.config.tools,
                    self.config.extraction_threads,
                    fastq,
                    OutputFormat::Fastq,
                    target,
                )
            })
            .collect()
    }

    /// `sracat [--qual] [-o prefix] container`; without a prefix reads go
    /// to stdout.
    fn sracat(&self, container: &Path, with_quality: bool, prefix: Option<&RunId>) -> Command {
        let mut cmd = Command::new(&self.config.tools.sracat);
        if with_quality {
            cmd.arg("--qual");
        }
        if let Some(prefix) = prefix {
            cmd.arg("-o").arg(prefix.as_str());
        }
        cmd.arg(container);
        cmd
    }

    fn extract_unordered(
        &self,
        container: &Path,
        run: &RunId,
        format: OutputFormat,
    ) -> Result<Vec<PathBuf>, FetchError> {
        let dir = &self.config.output_dir;
        let with_quality = !format.is_sequence_only();
        // sracat names FASTA output .fna
        let raw_extension = if with_quality { "fastq" } else { "fna" };
        tracing::info!("extracting .sra file to file(s) in unsorted {format} format");

        if format.is_compressed() {
            return self.extract_unordered_compressed(container, run, format, raw_extension);
        }

        let mut cmd = self.sracat(container, with_quality, Some(run));
        cmd.current_dir(dir);
        process::run_captured(&mut cmd).map_err(FetchError::ConversionFailed)?;

        let mut produced = Vec::new();
        for (name, final_name) in stream_names(run, raw_extension, format) {
            let raw = dir.join(&name);
            if !raw.exists() {
                continue;
            }
            let final_path = dir.join(final_name);
            if final_path != raw {
                fs::rename(&raw, &final_path).map_err(|err| FetchError::fs(raw.display(), err))?;
            }
            produced.push(final_path);
        }
        Ok(produced)
    }

    fn extract_unordered_compressed(
        &self,
        container: &Path,
        run: &RunId,
        format: OutputFormat,
        raw_extension: &str,
    ) -> Result<Vec<PathBuf>, FetchError> {
        let dir = &self.config.output_dir;
        let scratch = tempfile::Builder::new()
            .prefix(".kira-rf-fifo")
            .tempdir_in(dir)
            .map_err(|err| FetchError::fs(dir.display(), err))?;

        tracing::debug!("creating FIFOs");
        let mut pipes = Vec::new();
        for (name, final_name) in stream_names(run, raw_extension, format) {
            let fifo = scratch.path().join(&name);
            let spawned = mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(|err| {
                    FetchError::ConversionFailed(format!("mkfifo {}: {err}", fifo.display()))
                })
                .and_then(|()| {
                    StreamPipe::spawn(
                        &self.config.tools.pigz,
                        self.config.extraction_threads,
                        fifo,
                        dir.join(final_name),
                    )
                });
            match spawned {
                Ok(pipe) => pipes.push(pipe),
                Err(err) => {
                    abort_pipes(pipes);
                    return Err(err);
                }
            }
        }

        let supervisor = match PipeSupervisor::attach(&mut pipes) {
            Ok(supervisor) => supervisor,
            Err(err) => {
                abort_pipes(pipes);
                return Err(err);
            }
        };

        let mut cmd = self.sracat(container, !format.is_sequence_only(), Some(run));
        cmd.current_dir(scratch.path());
        let produced = process::run_captured(&mut cmd);

        supervisor.release();
        let mut failure = produced.err().map(FetchError::ConversionFailed);
        let mut outputs = Vec::new();
        for mut pipe in pipes {
            tracing::debug!("waiting for {}", pipe.cmd_line);
            if let Err(message) = process::wait(&pipe.cmd_line, &mut pipe.compressor) {
                failure.get_or_insert(FetchError::ConversionFailed(message));
            }
            outputs.push(pipe.output);
        }

        if let Some(err) = failure {
            outputs::remove_partial(&outputs);
            return Err(err);
        }

        let mut produced = Vec::new();
        for output in outputs {
            if convert::gz_is_empty(&output)? {
                tracing::debug!("compressed file {} is empty, removing", output.display());
                fs::remove_file(&output).map_err(|err| FetchError::fs(output.display(), err))?;
            } else {
                produced.push(output);
            }
        }
        Ok(produced)
    }

    fn extract_to_stdout(&self, container: &Path, format: OutputFormat) -> Result<(), FetchError> {
        tracing::info!("extracting unsorted .sra file to STDOUT in {format} format");
        let mut producer = self.sracat(container, !format.is_sequence_only(), None);
        if !format.is_compressed() {
            producer.stdout(Stdio::inherit());
            let status = producer
                .stdin(Stdio::null())
                .status()
                .map_err(|err| FetchError::ConversionFailed(err.to_string()))?;
            return process::check_status(&producer, status).map_err(FetchError::ConversionFailed);
        }

        producer.stdin(Stdio::null()).stdout(Stdio::piped());
        let producer_line = process::describe(&producer);
        let mut producer_child = process::spawn(&mut producer).map_err(FetchError::ConversionFailed)?;
        let Some(reads) = producer_child.stdout.take() else {
            return Err(FetchError::ConversionFailed("sracat stdout unavailable".to_string()));
        };
        let mut compressor = Command::new(&self.config.tools.pigz);
        compressor
            .arg("-p")
            .arg(self.config.extraction_threads.to_string())
            .arg("-c")
            .stdin(Stdio::from(reads))
            .stdout(Stdio::inherit());
        let compressor_line = process::describe(&compressor);
        let mut compressor_child = match process::spawn(&mut compressor) {
            Ok(child) => child,
            Err(message) => {
                let _ = producer_child.kill();
                let _ = producer_child.wait();
                return Err(FetchError::ConversionFailed(message));
            }
        };

        let produced = process::wait(&producer_line, &mut producer_child);
        let compressed = process::wait(&compressor_line, &mut compressor_child);
        produced.and(compressed).map_err(FetchError::ConversionFailed)
    }
}

/// One named pipe with its attached compressor.
struct StreamPipe {
    fifo: PathBuf,
    output: PathBuf,
    compressor: Child,
    cmd_line: String,
}

impl StreamPipe {
    fn spawn(pigz: &Path, threads: usize, fifo: PathBuf, output: PathBuf) -> Result<Self, FetchError> {
        let out = File::create(&output).map_err(|err| FetchError::fs(output.display(), err))?;
        let mut cmd = Command::new(pigz);
        cmd.arg("-c")
            .arg("-p")
            .arg(threads.to_string())
            .arg(&fifo)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out));
        let cmd_line = process::describe(&cmd);
        let compressor = process::spawn(&mut cmd).map_err(FetchError::ConversionFailed)?;
        Ok(Self {
            fifo,
            output,
            compressor,
            cmd_line,
        })
    }
}

/// Holds the write end of every pipe while the producer runs. A producer
/// that never opens one of its pipes would otherwise leave that pipe's
/// compressor waiting forever; releasing the supervisor closes the last
/// writer so every compressor sees end-of-stream.
struct PipeSupervisor {
    writers: Vec<File>,
}

impl PipeSupervisor {
    fn attach(pipes: &mut [StreamPipe]) -> Result<Self, FetchError> {
        let mut writers = Vec::with_capacity(pipes.len());
        for pipe in pipes.iter_mut() {
            writers.push(open_writer(pipe)?);
        }
        Ok(Self { writers })
    }

    fn release(self) {
        tracing::debug!("closing supervisor ends of {} pipes", self.writers.len());
        drop(self.writers);
    }
}

/// Open the write end without blocking: retry until the compressor has the
/// read end open, and give up if it exits first.
fn open_writer(pipe: &mut StreamPipe) -> Result<File, FetchError> {
    let started = Instant::now();
    loop {
        let opened = OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&pipe.fifo);
        match opened {
            Ok(file) => return Ok(file),
            Err(err) if err.raw_os_error() == Some(Errno::ENXIO as i32) => {}
            Err(err) => return Err(FetchError::fs(pipe.fifo.display(), err)),
        }
        if let Ok(Some(status)) = pipe.compressor.try_wait() {
            return Err(FetchError::ConversionFailed(format!(
                "{} exited ({status}) before opening its pipe",
                pipe.cmd_line
            )));
        }
        if started.elapsed() > PIPE_OPEN_TIMEOUT {
            return Err(FetchError::ConversionFailed(format!(
                "timed out waiting for {} to open {}",
                pipe.cmd_line,
                pipe.fifo.display()
            )));
        }
        thread::sleep(PIPE_OPEN_POLL);
    }
}

fn abort_pipes(pipes: Vec<StreamPipe>) {
    for mut pipe in pipes {
        let _ = pipe.compressor.kill();
        let _ = pipe.compressor.wait();
        outputs::remove_partial(std::slice::from_ref(&pipe.output));
    }
}

/// Pairs of (name the producer writes, name of the final output).
fn stream_names(run: &RunId, raw_extension: &str, format: OutputFormat) -> [(String, String); 3] {
    let [a, b, c] = read_file_names(run, raw_extension);
    let [x, y, z] = read_file_names(run, format.extension());
    [(a, x), (b, y), (c, z)]
}

fn run_from_container(container: &Path) -> Result<RunId, FetchError> {
    let name = container
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| FetchError::InvalidRunId(container.display().to_string()))?;
    name.strip_suffix(".sra").unwrap_or(&name).parse()
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
