//! Helpers for building real artifact containers in tests.
//!
//! Used by this crate's own tests and by the engine's integration tests to
//! produce valid, signed, and deliberately tampered containers without a
//! packaging toolchain.

use std::{
    fs::File,
    io::{self, Write as _},
    path::Path,
};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::{Signer as _, SigningKey};
use flate2::{write::GzEncoder, Compression};

use crate::{
    artifact::{FORMAT, FORMAT_VERSION, HEADER_MEMBER, MANIFEST_MEMBER, SIGNATURE_MEMBER, VERSION_MEMBER},
    checksum::{digest_reader, ChecksumSet},
    header::{ArtifactHeader, PayloadInfo},
};

/// Ways a builder can deliberately corrupt the container it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tamper {
    /// Flip a gzip header byte of `header.tar.gz` after the manifest was
    /// computed. Decompression still succeeds, the checksum does not.
    Header,
    /// Flip a content byte of every file in the given payload after its
    /// checksum was recorded.
    Payload { index: usize },
    /// Swap one character of the base64 signature.
    Signature,
}

pub struct ArtifactBuilder {
    name: String,
    group: Option<String>,
    device_types: Vec<String>,
    payloads: Vec<(PayloadInfo, Vec<(String, Vec<u8>)>)>,
    signing_key: Option<SigningKey>,
    tamper: Option<Tamper>,
}

impl ArtifactBuilder {
    pub fn new(name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            device_types: vec![device_type.into()],
            payloads: Vec::new(),
            signing_key: None,
            tamper: None,
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn payload(self, type_name: &str, files: Vec<(&str, Vec<u8>)>) -> Self {
        self.payload_with_info(PayloadInfo::new(type_name), files)
    }

    pub fn payload_with_info(
        mut self,
        info: PayloadInfo,
        files: Vec<(&str, Vec<u8>)>,
    ) -> Self {
        let files = files
            .into_iter()
            .map(|(name, bytes)| (name.to_string(), bytes))
            .collect();
        self.payloads.push((info, files));
        self
    }

    pub fn sign(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn tamper(mut self, tamper: Tamper) -> Self {
        self.tamper = Some(tamper);
        self
    }

    pub fn write_to(self, path: &Path) -> io::Result<()> {
        let mut header_builder = ArtifactHeader::builder()
            .name(&self.name)
            .device_types(self.device_types.clone())
            .payloads(self.payloads.iter().map(|(info, _)| info.clone()).collect());
        if let Some(group) = &self.group {
            header_builder = header_builder.group(group);
        }
        let header = header_builder
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let mut header_gz = gzip(&header_archive(&header)?)?;

        let mut manifest = ChecksumSet::default();
        manifest.insert(HEADER_MEMBER, digest(&header_gz)?);
        for (index, (_, files)) in self.payloads.iter().enumerate() {
            for (name, bytes) in files {
                manifest.insert(format!("data/{index:04}/{name}"), digest(bytes)?);
            }
        }
        let manifest_bytes = manifest.to_text().into_bytes();

        let mut signature = self
            .signing_key
            .as_ref()
            .map(|key| BASE64_STANDARD.encode(key.sign(&manifest_bytes).to_bytes()));

        let mut payloads = self.payloads;
        match self.tamper {
            Some(Tamper::Header) => header_gz[4] ^= 0x01,
            Some(Tamper::Payload { index }) => {
                for (_, bytes) in &mut payloads[index].1 {
                    let mid = bytes.len() / 2;
                    bytes[mid] ^= 0x01;
                }
            }
            Some(Tamper::Signature) => {
                let sig = signature
                    .as_mut()
                    .expect("signature tamper requires a signing key");
                let mid = sig.len() / 2;
                let flipped = if &sig[mid..=mid] == "A" { "B" } else { "A" };
                sig.replace_range(mid..=mid, flipped);
            }
            None => {}
        }

        let file = File::create(path)?;
        let mut outer = tar::Builder::new(file);
        let version = serde_json::json!({ "format": FORMAT, "version": FORMAT_VERSION })
            .to_string()
            .into_bytes();
        append(&mut outer, VERSION_MEMBER, &version)?;
        append(&mut outer, MANIFEST_MEMBER, &manifest_bytes)?;
        if let Some(sig) = &signature {
            append(&mut outer, SIGNATURE_MEMBER, sig.as_bytes())?;
        }
        append(&mut outer, HEADER_MEMBER, &header_gz)?;
        for (index, (_, files)) in payloads.iter().enumerate() {
            let mut inner = tar::Builder::new(Vec::new());
            for (name, bytes) in files {
                append(&mut inner, name, bytes)?;
            }
            let data_gz = gzip(&inner.into_inner()?)?;
            append(&mut outer, &format!("data/{index:04}.tar.gz"), &data_gz)?;
        }
        outer.into_inner()?.sync_all()?;
        Ok(())
    }
}

fn header_archive(header: &ArtifactHeader) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let info = serde_json::to_vec(&header.to_header_info())?;
    append(&mut builder, "header-info", &info)?;
    for (index, payload) in header.payloads().iter().enumerate() {
        let type_info = serde_json::to_vec(payload)?;
        append(&mut builder, &format!("headers/{index:04}/type-info"), &type_info)?;
    }
    builder.into_inner()
}

fn append<W: io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    bytes: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)
}

fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn digest(bytes: &[u8]) -> io::Result<[u8; 32]> {
    digest_reader(&mut &bytes[..])
}
