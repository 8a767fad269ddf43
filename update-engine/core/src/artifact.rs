//! Reading and validating the artifact container.
//!
//! The container is a tar archive with members in fixed order: `version`,
//! `manifest`, an optional `manifest.sig`, `header.tar.gz`, and one
//! `data/<nnnn>.tar.gz` per payload. Members are read sequentially and
//! validation short-circuits in a fixed order: container structure, header
//! checksum, signature policy, payload checksums. Payload files are
//! extracted into a caller-provided working directory; nothing outside that
//! directory is touched until validation has passed.

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::debug;

use crate::{
    checksum::{self, ChecksumSet},
    header::{self, ArtifactHeader, HeaderInfo, PayloadInfo},
    signatures::{SignatureError, VerifyPolicy},
};

/// Format identifier recorded in the `version` member.
pub const FORMAT: &str = "ab-update";
/// Container format version this reader understands.
pub const FORMAT_VERSION: u32 = 3;

pub(crate) const VERSION_MEMBER: &str = "version";
pub(crate) const MANIFEST_MEMBER: &str = "manifest";
pub(crate) const SIGNATURE_MEMBER: &str = "manifest.sig";
pub(crate) const HEADER_MEMBER: &str = "header.tar.gz";
pub(crate) const HEADER_INFO_MEMBER: &str = "header-info";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed opening artifact at `{}`", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed reading artifact container")]
    Io(#[from] io::Error),
    #[error("container ended before member `{expected}`")]
    MissingMember { expected: String },
    #[error("expected container member `{expected}`, found `{found}`")]
    UnexpectedMember { expected: String, found: String },
    #[error("container continues past the last declared payload with `{0}`")]
    TrailingMember(String),
    #[error("failed parsing `version` member")]
    VersionParse(#[source] serde_json::Error),
    #[error("unsupported artifact format `{format}` version {version}")]
    UnsupportedFormat { format: String, version: u32 },
    #[error("failed parsing checksum manifest")]
    Manifest(#[from] checksum::ParseError),
    #[error("failed parsing header archive member `{member}`")]
    HeaderParse {
        member: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Header(#[from] header::Error),
    #[error("payload member `{member}` contains invalid entry path `{entry}`")]
    InvalidPayloadEntry { member: String, entry: String },
    #[error("header archive does not match its recorded checksum")]
    HeaderIntegrity(#[source] checksum::CheckError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("payload data does not match its recorded checksum")]
    PayloadIntegrity(#[source] checksum::CheckError),
    #[error(
        "device type `{device_type}` is not among the artifact's compatible types [{}]",
        .supported.join(", ")
    )]
    IncompatibleDevice {
        device_type: String,
        supported: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct FormatVersion {
    format: String,
    version: u32,
}

/// One payload of a validated artifact, extracted to disk.
#[derive(Debug)]
pub struct Payload {
    pub index: usize,
    pub info: PayloadInfo,
    /// Directory holding the extracted payload files.
    pub dir: PathBuf,
    pub files: Vec<PayloadFile>,
}

#[derive(Debug)]
pub struct PayloadFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// A fully validated artifact with its payloads extracted under the
/// working directory passed to [`Artifact::open`].
#[derive(Debug)]
pub struct Artifact {
    header: ArtifactHeader,
    payloads: Vec<Payload>,
    signed: bool,
}

impl Artifact {
    /// Opens the container at `path`, validates it under `policy`, and
    /// extracts every payload into `work_dir/payloads/<nnnn>/`.
    pub fn open(path: &Path, work_dir: &Path, policy: &VerifyPolicy) -> Result<Self, Error> {
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut archive = tar::Archive::new(file);
        let mut entries = archive.entries()?;

        let mut version_entry = expect_member(&mut entries, VERSION_MEMBER)?;
        check_format_version(&read_member(&mut version_entry)?)?;

        let mut manifest_entry = expect_member(&mut entries, MANIFEST_MEMBER)?;
        let manifest_bytes = read_member(&mut manifest_entry)?;

        // The signature member is optional, so the next entry is either it
        // or the header archive.
        let next = next_member(&mut entries, HEADER_MEMBER)?;
        let (signature, mut header_entry) = if next.1 == SIGNATURE_MEMBER {
            let mut entry = next.0;
            let sig = String::from_utf8_lossy(&read_member(&mut entry)?).into_owned();
            drop(entry);
            (Some(sig), expect_member(&mut entries, HEADER_MEMBER)?)
        } else if next.1 == HEADER_MEMBER {
            (None, next.0)
        } else {
            return Err(Error::UnexpectedMember {
                expected: HEADER_MEMBER.into(),
                found: next.1,
            });
        };
        let header_bytes = read_member(&mut header_entry)?;
        drop(header_entry);

        let manifest = ChecksumSet::parse(&String::from_utf8_lossy(&manifest_bytes))?;

        // Header checksum covers the gzip'd member bytes as stored.
        let header_digest = checksum::digest_reader(&mut &header_bytes[..])?;
        manifest
            .check(HEADER_MEMBER, &header_digest)
            .map_err(Error::HeaderIntegrity)?;

        policy.verify(&manifest_bytes, signature.as_deref())?;

        let header = parse_header_archive(&header_bytes)?;
        debug!(
            artifact = header.name(),
            payloads = header.payloads().len(),
            signed = signature.is_some(),
            "artifact header validated"
        );

        let mut payloads = Vec::with_capacity(header.payloads().len());
        for (index, info) in header.payloads().iter().enumerate() {
            let member = format!("data/{index:04}.tar.gz");
            let (entry, found) = next_member(&mut entries, &member)?;
            if found != member {
                return Err(Error::UnexpectedMember {
                    expected: member,
                    found,
                });
            }
            let dir = work_dir.join("payloads").join(format!("{index:04}"));
            let files = extract_payload(entry, &member, &dir)?;
            for file in &files {
                let mut reader = File::open(&file.path)?;
                let digest = checksum::digest_reader(&mut reader)?;
                manifest
                    .check(&format!("data/{index:04}/{}", file.name), &digest)
                    .map_err(Error::PayloadIntegrity)?;
            }
            payloads.push(Payload {
                index,
                info: info.clone(),
                dir,
                files,
            });
        }

        if let Some(entry) = entries.next() {
            let entry = entry?;
            return Err(Error::TrailingMember(
                entry.path()?.display().to_string(),
            ));
        }

        Ok(Self {
            header,
            payloads,
            signed: signature.is_some(),
        })
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn ensure_compatible(&self, device_type: &str) -> Result<(), Error> {
        if self.header.is_compatible_with(device_type) {
            return Ok(());
        }
        Err(Error::IncompatibleDevice {
            device_type: device_type.to_string(),
            supported: self.header.device_types().to_vec(),
        })
    }
}

fn check_format_version(bytes: &[u8]) -> Result<(), Error> {
    let parsed: FormatVersion =
        serde_json::from_slice(bytes).map_err(Error::VersionParse)?;
    if parsed.format != FORMAT || parsed.version != FORMAT_VERSION {
        return Err(Error::UnsupportedFormat {
            format: parsed.format,
            version: parsed.version,
        });
    }
    Ok(())
}

type TarEntry<'a, R> = tar::Entry<'a, R>;

fn next_member<'a, R: Read>(
    entries: &mut tar::Entries<'a, R>,
    expected: &str,
) -> Result<(TarEntry<'a, R>, String), Error> {
    let entry = entries.next().ok_or_else(|| Error::MissingMember {
        expected: expected.to_string(),
    })??;
    let name = entry.path()?.display().to_string();
    Ok((entry, name))
}

fn expect_member<'a, R: Read>(
    entries: &mut tar::Entries<'a, R>,
    expected: &str,
) -> Result<TarEntry<'a, R>, Error> {
    let (entry, found) = next_member(entries, expected)?;
    if found != expected {
        return Err(Error::UnexpectedMember {
            expected: expected.to_string(),
            found,
        });
    }
    Ok(entry)
}

fn read_member<R: Read>(entry: &mut TarEntry<'_, R>) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn parse_header_archive(gz_bytes: &[u8]) -> Result<ArtifactHeader, Error> {
    let mut archive = tar::Archive::new(GzDecoder::new(gz_bytes));
    let mut entries = archive.entries()?;

    let mut info_entry = expect_member(&mut entries, HEADER_INFO_MEMBER)?;
    let info: HeaderInfo = serde_json::from_slice(&read_member(&mut info_entry)?)
        .map_err(|source| Error::HeaderParse {
            member: HEADER_INFO_MEMBER.into(),
            source,
        })?;
    drop(info_entry);

    let mut type_infos = Vec::with_capacity(info.payloads.len());
    for index in 0..info.payloads.len() {
        let member = format!("headers/{index:04}/type-info");
        let mut entry = expect_member(&mut entries, &member)?;
        let type_info: PayloadInfo = serde_json::from_slice(&read_member(&mut entry)?)
            .map_err(|source| Error::HeaderParse { member, source })?;
        type_infos.push(type_info);
    }
    if let Some(entry) = entries.next() {
        let entry = entry?;
        return Err(Error::TrailingMember(entry.path()?.display().to_string()));
    }

    Ok(ArtifactHeader::assemble(info, type_infos)?)
}

/// Unpacks one `data/<nnnn>.tar.gz` member into `dir`. Payload archives are
/// flat; entries with directory components are rejected.
fn extract_payload<R: Read>(
    entry: TarEntry<'_, R>,
    member: &str,
    dir: &Path,
) -> Result<Vec<PayloadFile>, Error> {
    // A previous attempt may have left files from another artifact here.
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    let mut archive = tar::Archive::new(GzDecoder::new(entry));
    let mut files = Vec::new();
    for inner in archive.entries()? {
        let mut inner = inner?;
        let entry_path = inner.path()?.display().to_string();
        let name = match valid_payload_file_name(&entry_path) {
            Some(name) => name.to_string(),
            None => {
                return Err(Error::InvalidPayloadEntry {
                    member: member.to_string(),
                    entry: entry_path,
                })
            }
        };
        let path = dir.join(&name);
        let mut out = File::create(&path)?;
        let size = io::copy(&mut inner, &mut out)?;
        files.push(PayloadFile { name, path, size });
    }
    Ok(files)
}

fn valid_payload_file_name(entry_path: &str) -> Option<&str> {
    let name = entry_path.strip_prefix("./").unwrap_or(entry_path);
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
        return None;
    }
    Some(name)
}
