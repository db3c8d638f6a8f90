//! Typed candidate locations and the per-provider response parsers that
//! produce them.
//!
//! Two location services are understood:
//!
//! - the NCBI SDL locator (JSON, `result[0].files[*].locations[*]`), which
//!   yields [`ObjectStoreLocation`]s on AWS S3 or Google Cloud Storage;
//! - the ENA portal file report (TSV, one row per run), which yields one
//!   [`BulkFtpLocation`] per read file.
//!
//! A location is a read-only description of where bytes live. It owns no
//! transfer state and is discarded after one attempt.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{CloudProvider, RunId};
use crate::error::FetchError;
use crate::verify::Md5Digest;

const SDL_VERSION: &str = "2";
const SRA_FILE_TYPE: &str = "sra";
const NOQUAL_SUFFIX: &str = ".noqual";
const AWS_ODP_BUCKET: &str = "sra-pub-run-odp";
const AWS_SARS_COV2_BUCKET: &str = "sra-pub-sars-cov2";
const ENA_FTP_HOST: &str = "ftp.sra.ebi.ac.uk";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Location {
    ObjectStore(ObjectStoreLocation),
    BulkFtp(BulkFtpLocation),
}

impl Location {
    pub fn checksum(&self) -> Option<&Md5Digest> {
        match self {
            Location::ObjectStore(loc) => loc.checksum.as_ref(),
            Location::BulkFtp(loc) => loc.checksum.as_ref(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Location::ObjectStore(loc) => loc
                .link
                .clone()
                .unwrap_or_else(|| loc.provider.to_string()),
            Location::BulkFtp(loc) => loc.url.clone(),
        }
    }
}

/// How a bucket is operated, decided from the bucket name itself because the
/// locator does not always flag ownership reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BucketClass {
    /// AWS Open Data Program mirror, free to read anonymously.
    OpenData,
    /// Special-purpose public bucket (e.g. the SARS-CoV-2 mirror).
    PublicDataset,
    /// Anything else; reading may bill the requester.
    RequesterPays,
}

impl BucketClass {
    fn classify(provider: CloudProvider, bucket_hint: &str) -> Self {
        match provider {
            CloudProvider::Aws if bucket_hint.contains(AWS_ODP_BUCKET) => BucketClass::OpenData,
            CloudProvider::Aws if bucket_hint.contains(AWS_SARS_COV2_BUCKET) => {
                BucketClass::PublicDataset
            }
            CloudProvider::Aws => BucketClass::RequesterPays,
            CloudProvider::Gcp => BucketClass::RequesterPays,
        }
    }

    pub fn is_anonymous(self) -> bool {
        matches!(self, BucketClass::OpenData | BucketClass::PublicDataset)
    }
}

/// Address usable by a vendor copy CLI, or the reason there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectAddress {
    Uri(String),
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectStoreLocation {
    pub provider: CloudProvider,
    pub bucket_or_path: ObjectAddress,
    /// Plain HTTPS link, when the locator supplied one.
    pub link: Option<String>,
    /// The locator's own `payRequired` flag.
    pub requires_payment: bool,
    pub class: BucketClass,
    pub checksum: Option<Md5Digest>,
}

impl ObjectStoreLocation {
    /// Guessed AWS Open Data location; no checksum is known for it.
    pub fn guessed_aws_odp(run: &RunId) -> Self {
        Self {
            provider: CloudProvider::Aws,
            bucket_or_path: ObjectAddress::Uri(format!("s3://{AWS_ODP_BUCKET}/sra/{run}/{run}")),
            link: Some(format!(
                "https://{AWS_ODP_BUCKET}.s3.amazonaws.com/sra/{run}/{run}"
            )),
            requires_payment: false,
            class: BucketClass::OpenData,
            checksum: None,
        }
    }

    /// Paid either by the locator's flag or by bucket classification.
    pub fn is_paid(&self) -> bool {
        self.requires_payment
            || (self.provider == CloudProvider::Aws && self.class == BucketClass::RequesterPays)
    }

    pub fn copy_uri(&self) -> Result<&str, FetchError> {
        match &self.bucket_or_path {
            ObjectAddress::Uri(uri) => Ok(uri),
            ObjectAddress::Unavailable(reason) => Err(FetchError::TransferFailed(reason.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFtpLocation {
    /// Host-qualified path as reported, e.g.
    /// `ftp.sra.ebi.ac.uk/vol1/fastq/SRR123/SRR12345_1.fastq.gz`.
    pub url: String,
    pub checksum: Option<Md5Digest>,
}

impl BulkFtpLocation {
    pub fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }

    pub fn ftp_url(&self) -> String {
        if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("ftp://{}", self.url)
        }
    }

    /// Path on the Aspera server, i.e. the URL without its FTP host.
    pub fn aspera_path(&self) -> String {
        let without_scheme = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        without_scheme.replacen(ENA_FTP_HOST, "", 1)
    }
}

/// Which variant of the SRA container a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerQuality {
    Full,
    NoQual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectQuery {
    pub provider: CloudProvider,
    pub quality: ContainerQuality,
    pub allow_paid: bool,
}

#[derive(Debug, Deserialize)]
struct SdlResponse {
    version: String,
    result: Vec<SdlResult>,
}

#[derive(Debug, Deserialize)]
struct SdlResult {
    #[serde(default)]
    files: Option<Vec<SdlFile>>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SdlFile {
    #[serde(rename = "type")]
    file_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    locations: Vec<SdlLocation>,
}

#[derive(Debug, Deserialize)]
struct SdlLocation {
    service: String,
    #[serde(default, rename = "payRequired")]
    pay_required: Option<bool>,
    #[serde(default, rename = "rehydrationRequired")]
    rehydration_required: Option<bool>,
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

/// Parse an SDL locator response into the object-store locations matching
/// `query`. A well-formed response without usable files yields an empty list.
pub fn parse_sdl_locations(
    body: &str,
    run: &RunId,
    query: &ObjectQuery,
) -> Result<Vec<Location>, FetchError> {
    let response: SdlResponse = serde_json::from_str(body)
        .map_err(|err| FetchError::Resolution(format!("location JSON for {run}: {err}")))?;
    if response.version != SDL_VERSION {
        return Err(FetchError::Resolution(format!(
            "location API version {} for {run}, expected {SDL_VERSION}",
            response.version
        )));
    }
    let result = response.result.first().ok_or_else(|| {
        FetchError::Resolution(format!("location JSON for {run} has an empty result list"))
    })?;
    let Some(files) = &result.files else {
        match &result.msg {
            Some(msg) => tracing::warn!("no results returned from NCBI location API for {run}: {msg}"),
            None => tracing::warn!("no results returned from NCBI location API for {run}"),
        }
        return Ok(Vec::new());
    };

    let service = match query.provider {
        CloudProvider::Aws => "s3",
        CloudProvider::Gcp => "gs",
    };

    let mut locations = Vec::new();
    for file in files {
        if file.file_type != SRA_FILE_TYPE {
            continue;
        }
        let quality = if file.name.ends_with(NOQUAL_SUFFIX) {
            ContainerQuality::NoQual
        } else {
            ContainerQuality::Full
        };
        if quality != query.quality {
            continue;
        }
        let checksum = file
            .md5
            .as_deref()
            .filter(|value| !value.is_empty())
            .map(str::parse::<Md5Digest>)
            .transpose()
            .map_err(|err| FetchError::Resolution(format!("location JSON for {run}: {err}")))?;

        for loc in &file.locations {
            tracing::debug!("assessing location {loc:?}");
            if loc.service != service {
                continue;
            }
            let location = object_location(query.provider, loc, run, checksum.clone())?;
            if location.is_paid() && !query.allow_paid {
                tracing::debug!("excluding paid location {:?}", location.link);
                continue;
            }
            locations.push(Location::ObjectStore(location));
        }
    }
    Ok(locations)
}

fn object_location(
    provider: CloudProvider,
    loc: &SdlLocation,
    run: &RunId,
    checksum: Option<Md5Digest>,
) -> Result<ObjectStoreLocation, FetchError> {
    let hint = loc
        .link
        .as_deref()
        .or(loc.bucket.as_deref())
        .unwrap_or_default();
    let class = BucketClass::classify(provider, hint);
    let bucket_or_path = match provider {
        CloudProvider::Aws => aws_address(class, loc, run),
        CloudProvider::Gcp => gcp_address(loc)?,
    };
    Ok(ObjectStoreLocation {
        provider,
        bucket_or_path,
        link: loc.link.clone(),
        requires_payment: loc.pay_required.unwrap_or(false),
        class,
        checksum,
    })
}

fn aws_address(class: BucketClass, loc: &SdlLocation, run: &RunId) -> ObjectAddress {
    match class {
        BucketClass::OpenData => ObjectAddress::Uri(format!("s3://{AWS_ODP_BUCKET}/sra/{run}/{run}")),
        BucketClass::PublicDataset => {
            ObjectAddress::Uri(format!("s3://{AWS_SARS_COV2_BUCKET}/run/{run}/{run}"))
        }
        BucketClass::RequesterPays => match (&loc.bucket, &loc.key) {
            (Some(bucket), Some(key)) => ObjectAddress::Uri(format!("s3://{bucket}/{key}")),
            _ => ObjectAddress::Unavailable(format!(
                "S3 location without bucket/key cannot be copied: {}",
                loc.link.as_deref().unwrap_or("<no link>")
            )),
        },
    }
}

fn gcp_address(loc: &SdlLocation) -> Result<ObjectAddress, FetchError> {
    if loc.rehydration_required == Some(true) {
        return Ok(ObjectAddress::Unavailable(
            "rehydration required from GCP".to_string(),
        ));
    }
    if let (Some(bucket), Some(key)) = (&loc.bucket, &loc.key) {
        return Ok(ObjectAddress::Uri(format!("gs://{bucket}/{key}")));
    }
    let Some(link) = &loc.link else {
        return Ok(ObjectAddress::Unavailable(
            "GCP location has neither bucket/key nor link".to_string(),
        ));
    };
    let re = Regex::new(r"^https://storage\.googleapis\.com/([^/]+)/(.+)$")
        .map_err(|err| FetchError::Resolution(err.to_string()))?;
    Ok(match re.captures(link) {
        Some(caps) => ObjectAddress::Uri(format!("gs://{}/{}", &caps[1], &caps[2])),
        None => ObjectAddress::Unavailable(format!("unexpected GCP link URL {link}")),
    })
}

/// A tab-separated report: header row plus data rows.
struct Tsv<'a> {
    header: Vec<&'a str>,
    rows: Vec<Vec<&'a str>>,
}

impl<'a> Tsv<'a> {
    fn parse(body: &'a str) -> Option<Self> {
        let mut lines = body.lines().filter(|line| !line.trim().is_empty());
        let header = lines.next()?.split('\t').map(str::trim).collect();
        let rows = lines
            .map(|line| line.split('\t').map(str::trim).collect())
            .collect();
        Some(Self { header, rows })
    }

    fn column(&self, name: &str) -> Result<usize, FetchError> {
        self.header
            .iter()
            .position(|field| *field == name)
            .ok_or_else(|| FetchError::Resolution(format!("file report lacks a {name} column")))
    }
}

/// Parse an ENA `filereport` response requested with
/// `fields=fastq_ftp,fastq_md5`.
pub fn parse_ena_filereport(body: &str, run: &RunId) -> Result<Vec<Location>, FetchError> {
    let Some(tsv) = Tsv::parse(body) else {
        tracing::warn!("no ENA file report rows for {run}");
        return Ok(Vec::new());
    };
    let url_col = tsv.column("fastq_ftp")?;
    let md5_col = tsv.column("fastq_md5")?;

    let row = match tsv.rows.as_slice() {
        [] => {
            tracing::warn!("no FTP download URLs found for run {run}");
            return Ok(Vec::new());
        }
        [row] => row,
        rows => {
            return Err(FetchError::Resolution(format!(
                "expected 1 row from ENA for {run}, got {}",
                rows.len()
            )));
        }
    };

    let urls = split_list(row.get(url_col).copied().unwrap_or_default());
    if urls.is_empty() {
        tracing::warn!("no ENA FTP download URLs found for run {run}");
        return Ok(Vec::new());
    }
    let md5s = split_list(row.get(md5_col).copied().unwrap_or_default());
    if !md5s.is_empty() && md5s.len() != urls.len() {
        return Err(FetchError::Resolution(format!(
            "ENA reported {} URLs but {} checksums for {run}",
            urls.len(),
            md5s.len()
        )));
    }

    let mut locations = Vec::with_capacity(urls.len());
    for (i, url) in urls.iter().enumerate() {
        let checksum = md5s
            .get(i)
            .map(|value| value.parse::<Md5Digest>())
            .transpose()
            .map_err(|err| FetchError::Resolution(format!("ENA file report for {run}: {err}")))?;
        locations.push(Location::BulkFtp(BulkFtpLocation {
            url: url.to_string(),
            checksum,
        }));
    }
    tracing::debug!("found {} FTP URLs for {run}", locations.len());
    Ok(locations)
}

/// Parse an ENA `filereport` requested with `fields=run_accession`.
pub fn parse_run_accessions(body: &str) -> Result<Vec<RunId>, FetchError> {
    let Some(tsv) = Tsv::parse(body) else {
        return Ok(Vec::new());
    };
    let col = tsv.column("run_accession")?;
    tsv.rows
        .iter()
        .filter_map(|row| row.get(col).filter(|value| !value.is_empty()))
        .map(|value| value.parse())
        .collect()
}

fn split_list(field: &str) -> Vec<&str> {
    field
        .split(';')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_classification_uses_name() {
        assert_eq!(
            BucketClass::classify(
                CloudProvider::Aws,
                "https://sra-pub-run-odp.s3.amazonaws.com/sra/SRR1/SRR1"
            ),
            BucketClass::OpenData
        );
        assert_eq!(
            BucketClass::classify(
                CloudProvider::Aws,
                "https://sra-pub-sars-cov2.s3.amazonaws.com/run/SRR1/SRR1"
            ),
            BucketClass::PublicDataset
        );
        assert_eq!(
            BucketClass::classify(CloudProvider::Aws, "s3://sra-pub-run-3/ERR1/ERR1.2"),
            BucketClass::RequesterPays
        );
    }

    #[test]
    fn aspera_path_strips_host() {
        let loc = BulkFtpLocation {
            url: "ftp.sra.ebi.ac.uk/vol1/fastq/SRR123/SRR12345_1.fastq.gz".to_string(),
            checksum: None,
        };
        assert_eq!(loc.aspera_path(), "/vol1/fastq/SRR123/SRR12345_1.fastq.gz");
        assert_eq!(loc.file_name(), "SRR12345_1.fastq.gz");
        assert_eq!(
            loc.ftp_url(),
            "ftp://ftp.sra.ebi.ac.uk/vol1/fastq/SRR123/SRR12345_1.fastq.gz"
        );
    }

    #[test]
    fn guessed_location_has_no_checksum() {
        let run: RunId = "SRR12118866".parse().unwrap();
        let loc = ObjectStoreLocation::guessed_aws_odp(&run);
        assert_eq!(
            loc.link.as_deref(),
            Some("https://sra-pub-run-odp.s3.amazonaws.com/sra/SRR12118866/SRR12118866")
        );
        assert!(loc.checksum.is_none());
        assert!(!loc.is_paid());
    }
}
