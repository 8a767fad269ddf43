//! The artifact checksum manifest and streaming sha256 digests.
//!
//! The manifest is a plain text member of the container: one
//! `<sha256-hex>  <member-path>` line per checksummed entry. The raw bytes
//! of this member are also what a detached signature covers.

use std::{
    collections::BTreeMap,
    io::{self, Read},
};

use sha2::{Digest as _, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed manifest line `{line}`; expected `<sha256-hex>  <path>`")]
    MalformedLine { line: String },
    #[error("failed decoding recorded checksum for `{path}` as hex")]
    InvalidHex {
        path: String,
        #[source]
        source: hex::FromHexError,
    },
    #[error("recorded checksum for `{path}` is {len} bytes long, expected 32")]
    InvalidLength { path: String, len: usize },
    #[error("manifest lists `{path}` more than once")]
    DuplicateEntry { path: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("mismatch between recorded and actual checksums of `{path}`; recorded `{expected}`, calculated `{actual}`")]
pub struct MismatchError {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("manifest has no checksum entry for `{0}`")]
    Missing(String),
    #[error(transparent)]
    Mismatch(#[from] MismatchError),
}

/// The parsed set of checksums recorded in an artifact's manifest member.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChecksumSet {
    entries: BTreeMap<String, [u8; 32]>,
}

impl ChecksumSet {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((sum, path)) = line.split_once(char::is_whitespace) else {
                return Err(ParseError::MalformedLine {
                    line: line.to_string(),
                });
            };
            let path = path.trim();
            if path.is_empty() {
                return Err(ParseError::MalformedLine {
                    line: line.to_string(),
                });
            }
            let decoded =
                hex::decode(sum).map_err(|source| ParseError::InvalidHex {
                    path: path.to_string(),
                    source,
                })?;
            let decoded: [u8; 32] =
                decoded
                    .as_slice()
                    .try_into()
                    .map_err(|_| ParseError::InvalidLength {
                        path: path.to_string(),
                        len: decoded.len(),
                    })?;
            if entries.insert(path.to_string(), decoded).is_some() {
                return Err(ParseError::DuplicateEntry {
                    path: path.to_string(),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (path, sum) in &self.entries {
            out.push_str(&hex::encode(sum));
            out.push_str("  ");
            out.push_str(path);
            out.push('\n');
        }
        out
    }

    pub fn insert(&mut self, path: impl Into<String>, sum: [u8; 32]) {
        self.entries.insert(path.into(), sum);
    }

    pub fn expected(&self, path: &str) -> Option<&[u8; 32]> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compares `actual` against the recorded checksum for `path`.
    pub fn check(&self, path: &str, actual: &[u8; 32]) -> Result<(), CheckError> {
        let expected = self
            .expected(path)
            .ok_or_else(|| CheckError::Missing(path.to_string()))?;
        if expected != actual {
            return Err(MismatchError {
                path: path.to_string(),
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            }
            .into());
        }
        Ok(())
    }
}

/// Streams `reader` to completion and returns its sha256 digest.
pub fn digest_reader<R: Read + ?Sized>(reader: &mut R) -> io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    io::copy(reader, &mut hasher)?;
    Ok(hasher.finalize().into())
}
