//! Single conversion steps between read formats.
//!
//! Each step reads one file and writes one file, removing its input only once
//! the output is fully written. Compression runs through `pigz`; FASTQ to
//! FASTA is a record-level rewrite done in-process, decompressing gzip input
//! on the fly.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use flate2::read::{GzDecoder, MultiGzDecoder};

use crate::domain::OutputFormat;
use crate::error::FetchError;
use crate::process::{self, ToolPaths};

/// Rewrite FASTQ records as FASTA: `@name` becomes `>name`, the sequence line
/// is kept and the `+` and quality lines are dropped. Returns the number of
/// records written.
pub fn fastq_to_fasta<R: BufRead, W: Write>(mut reader: R, mut writer: W) -> io::Result<u64> {
    let mut header = Vec::new();
    let mut sequence = Vec::new();
    let mut skip = Vec::new();
    let mut records = 0u64;
    loop {
        header.clear();
        if reader.read_until(b'\n', &mut header)? == 0 {
            break;
        }
        sequence.clear();
        if reader.read_until(b'\n', &mut sequence)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated FASTQ record",
            ));
        }
        for _ in 0..2 {
            skip.clear();
            reader.read_until(b'\n', &mut skip)?;
        }
        let name = trim_line_end(&header);
        writer.write_all(b">")?;
        writer.write_all(name.get(1..).unwrap_or_default())?;
        writer.write_all(b"\n")?;
        writer.write_all(trim_line_end(&sequence))?;
        writer.write_all(b"\n")?;
        records += 1;
    }
    writer.flush()?;
    Ok(records)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// True when a gzip file decompresses to nothing.
pub fn gz_is_empty(path: &Path) -> Result<bool, FetchError> {
    let len = fs::metadata(path)
        .map_err(|err| FetchError::fs(path.display(), err))?
        .len();
    if len == 0 {
        return Ok(true);
    }
    let file = File::open(path).map_err(|err| FetchError::fs(path.display(), err))?;
    let mut decoder = GzDecoder::new(file);
    let mut some = [0u8; 10];
    let n = decoder
        .read(&mut some)
        .map_err(|err| FetchError::ConversionFailed(format!("{}: {err}", path.display())))?;
    Ok(n == 0)
}

/// Output path for converting `input` from `from` to `to`, e.g.
/// `SRR1_1.fastq.gz` to `SRR1_1.fasta`.
pub fn converted_path(input: &Path, from: OutputFormat, to: OutputFormat) -> PathBuf {
    let name = input
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let suffix = format!(".{}", from.extension());
    let stem = name.strip_suffix(&suffix).unwrap_or(&name);
    input.with_file_name(format!("{stem}.{}", to.extension()))
}

/// Whether `to` can be produced from `from` without a dump tool.
pub fn can_derive(from: OutputFormat, to: OutputFormat) -> bool {
    use OutputFormat::*;
    matches!(
        (from, to),
        (Fastq, FastqGz | Fasta | FastaGz) | (FastqGz, Fastq | Fasta | FastaGz)
    ) || (from == to && from != Sra)
}

/// Convert one read file. The input is gone afterwards unless `from == to`.
pub fn convert_reads(
    tools: &ToolPaths,
    threads: usize,
    input: &Path,
    from: OutputFormat,
    to: OutputFormat,
) -> Result<PathBuf, FetchError> {
    if from == to {
        return Ok(input.to_path_buf());
    }
    if !can_derive(from, to) {
        return Err(FetchError::ConversionFailed(format!(
            "cannot derive {to} from {from}"
        )));
    }
    let output = converted_path(input, from, to);
    let result = match (from, to) {
        (OutputFormat::Fastq, OutputFormat::FastqGz) => {
            tracing::info!("compressing {} with pigz", input.display());
            pigz_in_place(tools, threads, input, false)
        }
        (OutputFormat::FastqGz, OutputFormat::Fastq) => {
            tracing::info!("decompressing {} with pigz", input.display());
            pigz_in_place(tools, threads, input, true)
        }
        _ => {
            tracing::info!("converting {} to {}", input.display(), to);
            let gzipped = from == OutputFormat::FastqGz;
            fastq_file_to_fasta(tools, threads, input, gzipped, &output, to.is_compressed())
        }
    };
    if let Err(err) = result {
        if output.exists() && output != input {
            let _ = fs::remove_file(&output);
        }
        return Err(err);
    }
    if !output.exists() {
        return Err(FetchError::ConversionFailed(format!(
            "expected {} to be written",
            output.display()
        )));
    }
    if input.exists() {
        fs::remove_file(input).map_err(|err| FetchError::fs(input.display(), err))?;
    }
    Ok(output)
}

fn pigz_in_place(
    tools: &ToolPaths,
    threads: usize,
    input: &Path,
    decompress: bool,
) -> Result<(), FetchError> {
    let mut cmd = Command::new(&tools.pigz);
    cmd.arg("-p").arg(threads.to_string());
    if decompress {
        cmd.arg("-d");
    }
    cmd.arg(input);
    process::run_captured(&mut cmd)
        .map(|_| ())
        .map_err(FetchError::ConversionFailed)
}

fn fastq_file_to_fasta(
    tools: &ToolPaths,
    threads: usize,
    input: &Path,
    gzipped_input: bool,
    output: &Path,
    compress_output: bool,
) -> Result<(), FetchError> {
    let file = File::open(input).map_err(|err| FetchError::fs(input.display(), err))?;
    let reader: Box<dyn BufRead> = if gzipped_input {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    if !compress_output {
        let out = File::create(output).map_err(|err| FetchError::fs(output.display(), err))?;
        fastq_to_fasta(reader, BufWriter::new(out))
            .map_err(|err| FetchError::ConversionFailed(format!("{}: {err}", input.display())))?;
        return Ok(());
    }

    let mut compressor = Compressor::spawn(tools, threads, output)?;
    let converted = match compressor.stdin() {
        Some(stdin) => fastq_to_fasta(reader, BufWriter::new(stdin)),
        None => Err(io::Error::other("compressor stdin unavailable")),
    };
    let finished = compressor.finish();
    converted
        .map_err(|err| FetchError::ConversionFailed(format!("{}: {err}", input.display())))?;
    finished
}

/// A `pigz -c` process compressing its stdin into a file.
pub struct Compressor {
    child: std::process::Child,
    cmd_line: String,
}

impl Compressor {
    pub fn spawn(tools: &ToolPaths, threads: usize, output: &Path) -> Result<Self, FetchError> {
        let out = File::create(output).map_err(|err| FetchError::fs(output.display(), err))?;
        let mut cmd = Command::new(&tools.pigz);
        cmd.arg("-c")
            .arg("-p")
            .arg(threads.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out));
        let cmd_line = process::describe(&cmd);
        let child = process::spawn(&mut cmd).map_err(FetchError::ConversionFailed)?;
        Ok(Self { child, cmd_line })
    }

    pub fn stdin(&mut self) -> Option<&mut std::process::ChildStdin> {
        self.child.stdin.as_mut()
    }

    /// Close stdin and wait for the compressor to exit.
    pub fn finish(mut self) -> Result<(), FetchError> {
        drop(self.child.stdin.take());
        process::wait(&self.cmd_line, &mut self.child).map_err(FetchError::ConversionFailed)
    }
}
