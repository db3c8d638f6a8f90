use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::domain::RunId;
use crate::error::FetchError;
use crate::location::{self, Location, ObjectQuery};

pub const NCBI_LOCATE_URL: &str = "https://locate.ncbi.nlm.nih.gov/sdl/2/retrieve";
pub const ENA_FILEREPORT_URL: &str = "https://www.ebi.ac.uk/ena/portal/api/filereport";

/// Resolves run accessions into candidate locations. Every call performs a
/// fresh lookup; nothing is cached between calls.
pub trait LocationResolver: Send + Sync {
    fn ncbi_locations(&self, run: &RunId, query: &ObjectQuery) -> Result<Vec<Location>, FetchError>;
    fn ena_locations(&self, run: &RunId) -> Result<Vec<Location>, FetchError>;
    fn bioproject_runs(&self, accession: &str) -> Result<Vec<RunId>, FetchError>;
}

#[derive(Clone)]
pub struct HttpLocationResolver {
    client: Client,
    ncbi_url: String,
    ena_url: String,
}

impl HttpLocationResolver {
    pub fn new() -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-rf/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| FetchError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| FetchError::Http(err.to_string()))?;

        Ok(Self {
            client,
            ncbi_url: NCBI_LOCATE_URL.to_string(),
            ena_url: ENA_FILEREPORT_URL.to_string(),
        })
    }

    fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let response = self.send_with_retries(|| self.client.get(url).query(query))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "location request failed".to_string());
            return Err(FetchError::HttpStatus { status, message });
        }
        let text = response
            .text()
            .map_err(|err| FetchError::Http(err.to_string()))?;
        tracing::debug!("response from {url}: {text}");
        Ok(text)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, FetchError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Http(err.to_string()));
                }
            }
        }
    }
}

impl LocationResolver for HttpLocationResolver {
    fn ncbi_locations(&self, run: &RunId, query: &ObjectQuery) -> Result<Vec<Location>, FetchError> {
        tracing::debug!("querying NCBI locator for {run}");
        let body = self.get_text(
            &self.ncbi_url,
            &[("acc", run.as_str()), ("accept-alternate-locations", "yes")],
        )?;
        location::parse_sdl_locations(&body, run, query)
    }

    fn ena_locations(&self, run: &RunId) -> Result<Vec<Location>, FetchError> {
        tracing::info!("querying ENA for FTP paths for {run}");
        let body = self.get_text(
            &self.ena_url,
            &[
                ("accession", run.as_str()),
                ("result", "read_run"),
                ("fields", "fastq_ftp,fastq_md5"),
            ],
        )?;
        location::parse_ena_filereport(&body, run)
    }

    fn bioproject_runs(&self, accession: &str) -> Result<Vec<RunId>, FetchError> {
        tracing::info!("querying ENA for runs of {accession}");
        let body = self.get_text(
            &self.ena_url,
            &[
                ("accession", accession),
                ("result", "read_run"),
                ("fields", "run_accession"),
            ],
        )?;
        location::parse_run_accessions(&body)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
