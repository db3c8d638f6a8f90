//! Post-download integrity checks: streaming MD5 digests and container
//! signatures.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;

use crate::error::FetchError;

const READ_BUFFER: usize = 64 * 1024;

/// A 32 character lowercase hex MD5 digest as published by the archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Md5Digest(String);

impl Md5Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Md5Digest {
    type Err = FetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let is_valid = value.len() == 32
            && value
                .chars()
                .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch));
        if !is_valid {
            return Err(FetchError::InvalidChecksum(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }
}

/// Digest a file in fixed-size chunks so memory use does not grow with the
/// file.
pub fn md5_file(path: &Path) -> io::Result<Md5Digest> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(Md5Digest(format!("{:x}", context.compute())))
}

pub fn verify(path: &Path, expected: &Md5Digest) -> Result<bool, FetchError> {
    tracing::debug!("checking md5sum of {}", path.display());
    let actual = md5_file(path).map_err(|err| FetchError::fs(path.display(), err))?;
    Ok(actual == *expected)
}

/// True when the file starts with `magic`. Short files never match.
pub fn has_magic(path: &Path, magic: &[u8]) -> Result<bool, FetchError> {
    let mut file = File::open(path).map_err(|err| FetchError::fs(path.display(), err))?;
    let mut head = vec![0u8; magic.len()];
    let mut filled = 0;
    while filled < head.len() {
        let n = file
            .read(&mut head[filled..])
            .map_err(|err| FetchError::fs(path.display(), err))?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(head == magic)
}
