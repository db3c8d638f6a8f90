use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FetchError {
    #[error("invalid run identifier: {0}")]
    InvalidRunId(String),

    #[error("invalid output format: {0}")]
    InvalidFormat(String),

    #[error("invalid download method: {0}")]
    InvalidMethod(String),

    #[error("invalid md5 checksum: {0}")]
    InvalidChecksum(String),

    #[error("configuration error: {0}")]
    #[diagnostic(help("fix the conflicting or missing options and run again"))]
    Configuration(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("unexpected response from location service: {0}")]
    Resolution(String),

    #[error("no location found: {0}")]
    NoLocationFound(String),

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("md5 verification failed: {0}")]
    VerificationFailed(String),

    #[error("extraction failed: {0}")]
    ConversionFailed(String),

    #[error("request failed: {0}")]
    Http(String),

    #[error("server returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("no download method succeeded for run {0}")]
    NoDownloadMethodSucceeded(String),

    #[error("no output files were produced for run {0}")]
    NoOutputProduced(String),
}

impl FetchError {
    /// Whether the fallback engine may absorb this error and move on to the
    /// next location or method.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FetchError::NoLocationFound(_)
                | FetchError::TransferFailed(_)
                | FetchError::VerificationFailed(_)
                | FetchError::Http(_)
                | FetchError::HttpStatus { .. }
        )
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            FetchError::InvalidRunId(_)
            | FetchError::InvalidFormat(_)
            | FetchError::InvalidMethod(_)
            | FetchError::Configuration(_)
            | FetchError::ConfigRead(_)
            | FetchError::ConfigParse(_) => 2,
            FetchError::NoDownloadMethodSucceeded(_) => 3,
            FetchError::NoOutputProduced(_) => 4,
            FetchError::Resolution(_) | FetchError::InvalidChecksum(_) => 5,
            FetchError::ConversionFailed(_) => 6,
            _ => 1,
        }
    }

    pub(crate) fn fs(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        FetchError::Filesystem(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(FetchError::NoLocationFound("x".to_string()).is_recoverable());
        assert!(FetchError::VerificationFailed("x".to_string()).is_recoverable());
        assert!(!FetchError::Resolution("x".to_string()).is_recoverable());
        assert!(!FetchError::ConversionFailed("x".to_string()).is_recoverable());
        assert!(!FetchError::Configuration("x".to_string()).is_recoverable());
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            FetchError::NoDownloadMethodSucceeded("SRR1".to_string()).exit_code(),
            FetchError::NoOutputProduced("SRR1".to_string()).exit_code(),
            FetchError::Resolution("bad".to_string()).exit_code(),
            FetchError::Configuration("bad".to_string()).exit_code(),
        ];
        assert_eq!(codes, [3, 4, 5, 2]);
    }
}
