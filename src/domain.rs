use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Accession of a single sequencing run, e.g. `SRR12118866` or `ERR1346134`.
///
/// The value is otherwise opaque; it is only checked to be safe to embed in
/// file names and URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
            && !trimmed.starts_with('.');
        if !is_valid {
            return Err(FetchError::InvalidRunId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum OutputFormat {
    #[serde(rename = "sra")]
    #[value(name = "sra")]
    Sra,
    #[serde(rename = "fastq")]
    #[value(name = "fastq")]
    Fastq,
    #[serde(rename = "fastq.gz")]
    #[value(name = "fastq.gz")]
    FastqGz,
    #[serde(rename = "fasta")]
    #[value(name = "fasta")]
    Fasta,
    #[serde(rename = "fasta.gz")]
    #[value(name = "fasta.gz")]
    FastaGz,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Sra => "sra",
            OutputFormat::Fastq => "fastq",
            OutputFormat::FastqGz => "fastq.gz",
            OutputFormat::Fasta => "fasta",
            OutputFormat::FastaGz => "fasta.gz",
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, OutputFormat::FastqGz | OutputFormat::FastaGz)
    }

    /// Formats that carry bases only, no quality scores.
    pub fn is_sequence_only(self) -> bool {
        matches!(self, OutputFormat::Fasta | OutputFormat::FastaGz)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "sra" => Ok(OutputFormat::Sra),
            "fastq" => Ok(OutputFormat::Fastq),
            "fastq.gz" => Ok(OutputFormat::FastqGz),
            "fasta" => Ok(OutputFormat::Fasta),
            "fasta.gz" => Ok(OutputFormat::FastaGz),
            _ => Err(FetchError::InvalidFormat(value.to_string())),
        }
    }
}

/// Which metadata API a download method depends on to find its locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationApi {
    Ncbi,
    Ena,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Gcp,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudProvider::Aws => write!(f, "aws"),
            CloudProvider::Gcp => write!(f, "gcp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadMethod {
    Prefetch,
    AwsHttp,
    AwsCp,
    GcpCp,
    EnaAscp,
    EnaFtp,
}

impl DownloadMethod {
    pub fn name(self) -> &'static str {
        match self {
            DownloadMethod::Prefetch => "prefetch",
            DownloadMethod::AwsHttp => "aws-http",
            DownloadMethod::AwsCp => "aws-cp",
            DownloadMethod::GcpCp => "gcp-cp",
            DownloadMethod::EnaAscp => "ena-ascp",
            DownloadMethod::EnaFtp => "ena-ftp",
        }
    }

    pub fn location_api(self) -> Option<LocationApi> {
        match self {
            DownloadMethod::Prefetch => None,
            DownloadMethod::AwsHttp | DownloadMethod::AwsCp | DownloadMethod::GcpCp => {
                Some(LocationApi::Ncbi)
            }
            DownloadMethod::EnaAscp | DownloadMethod::EnaFtp => Some(LocationApi::Ena),
        }
    }

    pub fn artifact_kind(self) -> ArtifactKind {
        match self {
            DownloadMethod::EnaAscp | DownloadMethod::EnaFtp => ArtifactKind::CompressedReads,
            _ => ArtifactKind::SraContainer,
        }
    }
}

impl fmt::Display for DownloadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DownloadMethod {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "prefetch" => Ok(DownloadMethod::Prefetch),
            "aws-http" => Ok(DownloadMethod::AwsHttp),
            "aws-cp" => Ok(DownloadMethod::AwsCp),
            "gcp-cp" => Ok(DownloadMethod::GcpCp),
            "ena-ascp" => Ok(DownloadMethod::EnaAscp),
            "ena-ftp" => Ok(DownloadMethod::EnaFtp),
            _ => Err(FetchError::InvalidMethod(value.to_string())),
        }
    }
}

/// Shape of the file(s) a download method leaves on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// A single `.sra` container.
    SraContainer,
    /// One gzipped FASTQ per read direction.
    CompressedReads,
}

impl ArtifactKind {
    pub fn magic(self) -> &'static [u8] {
        match self {
            ArtifactKind::SraContainer => b"NCBI.sra",
            ArtifactKind::CompressedReads => &[0x1f, 0x8b],
        }
    }

    /// Whether some requested format can be produced from this artifact.
    pub fn satisfies_any(self, formats: &[OutputFormat]) -> bool {
        match self {
            ArtifactKind::SraContainer => !formats.is_empty(),
            ArtifactKind::CompressedReads => formats.iter().any(|f| *f != OutputFormat::Sra),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_run_id_valid() {
        let id: RunId = " SRR12118866 ".parse().unwrap();
        assert_eq!(id.as_str(), "SRR12118866");
    }

    #[test]
    fn parse_run_id_rejects_paths() {
        assert_matches!("../SRR1".parse::<RunId>(), Err(FetchError::InvalidRunId(_)));
        assert_matches!("SRR1/x".parse::<RunId>(), Err(FetchError::InvalidRunId(_)));
        assert_matches!("".parse::<RunId>(), Err(FetchError::InvalidRunId(_)));
    }

    #[test]
    fn format_names_round_trip_through_display() {
        for format in [
            OutputFormat::Sra,
            OutputFormat::Fastq,
            OutputFormat::FastqGz,
            OutputFormat::Fasta,
            OutputFormat::FastaGz,
        ] {
            assert_eq!(format.to_string().parse::<OutputFormat>().unwrap(), format);
        }
    }

    #[test]
    fn method_names() {
        let method: DownloadMethod = "aws-http".parse().unwrap();
        assert_eq!(method, DownloadMethod::AwsHttp);
        assert_eq!(method.location_api(), Some(LocationApi::Ncbi));
        assert_matches!("ftp".parse::<DownloadMethod>(), Err(FetchError::InvalidMethod(_)));
    }

    #[test]
    fn compressed_reads_cannot_become_sra() {
        assert!(!ArtifactKind::CompressedReads.satisfies_any(&[OutputFormat::Sra]));
        assert!(
            ArtifactKind::CompressedReads.satisfies_any(&[OutputFormat::Sra, OutputFormat::Fasta])
        );
        assert!(ArtifactKind::SraContainer.satisfies_any(&[OutputFormat::Sra]));
    }
}
