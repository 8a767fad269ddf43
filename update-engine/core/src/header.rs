//! The artifact header: name, device compatibility, and per-payload metadata.
//!
//! Inside the container the header travels as `header.tar.gz`, holding one
//! `header-info` member and one `headers/<nnnn>/type-info` member per
//! payload. [`ArtifactHeader`] is the assembled, validated view of those.

use std::collections::BTreeMap;

use serde::{de, Deserialize, Serialize};
use tap::TapOptional as _;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("required header fields not set: [{}]", .0.join(", "))]
    FieldsNotSet(Vec<&'static str>),
    #[error("header declares no payloads")]
    NoPayloads,
    #[error("header declares no compatible device types")]
    NoDeviceTypes,
    #[error("artifact name must not be empty")]
    EmptyName,
    #[error("header-info declares {declared} payloads but {found} type-info entries were found")]
    PayloadCountMismatch { declared: usize, found: usize },
    #[error(
        "payload {index} declared as type `{declared}` in header-info but its type-info says `{found}`"
    )]
    PayloadTypeMismatch {
        index: usize,
        declared: String,
        found: String,
    },
}

/// Metadata of one payload: its type and the provides declarations it
/// carries. The type string is an opaque identifier resolved to an update
/// module at install time.
#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct PayloadInfo {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clears_provides: Vec<String>,
}

impl PayloadInfo {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            provides: BTreeMap::new(),
            clears_provides: Vec::new(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ArtifactHeader {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    device_types: Vec<String>,
    payloads: Vec<PayloadInfo>,
}

impl ArtifactHeader {
    pub fn builder() -> ArtifactHeaderBuilder {
        ArtifactHeaderBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn device_types(&self) -> &[String] {
        &self.device_types
    }

    pub fn payloads(&self) -> &[PayloadInfo] {
        &self.payloads
    }

    pub fn is_compatible_with(&self, device_type: &str) -> bool {
        self.device_types.iter().any(|t| t == device_type)
    }

    /// Assembles a header from the `header-info` member and the ordered
    /// `type-info` members of the header archive.
    pub(crate) fn assemble(
        info: HeaderInfo,
        type_infos: Vec<PayloadInfo>,
    ) -> Result<Self, Error> {
        if info.payloads.len() != type_infos.len() {
            return Err(Error::PayloadCountMismatch {
                declared: info.payloads.len(),
                found: type_infos.len(),
            });
        }
        for (index, (declared, found)) in
            info.payloads.iter().zip(type_infos.iter()).enumerate()
        {
            if declared.type_name != found.type_name {
                return Err(Error::PayloadTypeMismatch {
                    index,
                    declared: declared.type_name.clone(),
                    found: found.type_name.clone(),
                });
            }
        }
        Self::validated(info.artifact.name, info.artifact.group, info.device_types, type_infos)
    }

    fn validated(
        name: String,
        group: Option<String>,
        device_types: Vec<String>,
        payloads: Vec<PayloadInfo>,
    ) -> Result<Self, Error> {
        if name.is_empty() {
            return Err(Error::EmptyName);
        }
        if device_types.is_empty() {
            return Err(Error::NoDeviceTypes);
        }
        if payloads.is_empty() {
            return Err(Error::NoPayloads);
        }
        Ok(Self {
            name,
            group,
            device_types,
            payloads,
        })
    }

    pub(crate) fn to_header_info(&self) -> HeaderInfo {
        HeaderInfo {
            artifact: ArtifactInfo {
                name: self.name.clone(),
                group: self.group.clone(),
            },
            device_types: self.device_types.clone(),
            payloads: self
                .payloads
                .iter()
                .map(|p| DeclaredPayload {
                    type_name: p.type_name.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Default)]
pub struct ArtifactHeaderBuilder {
    pub name: Option<String>,
    pub group: Option<String>,
    pub device_types: Vec<String>,
    pub payloads: Vec<PayloadInfo>,
}

impl ArtifactHeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn group(self, group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..self
        }
    }

    pub fn device_types<I, T>(self, device_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            device_types: device_types.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn payloads(self, payloads: Vec<PayloadInfo>) -> Self {
        Self { payloads, ..self }
    }

    pub fn build(self) -> Result<ArtifactHeader, Error> {
        let mut missing_fields = Vec::new();
        let name = self.name.tap_none(|| missing_fields.push("name"));
        if !missing_fields.is_empty() {
            return Err(Error::FieldsNotSet(missing_fields));
        }
        let name = name.expect("`name` was verified to contain a value");
        ArtifactHeader::validated(name, self.group, self.device_types, self.payloads)
    }
}

/// Serialized form of the `header-info` member.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct HeaderInfo {
    pub(crate) artifact: ArtifactInfo,
    pub(crate) device_types: Vec<String>,
    pub(crate) payloads: Vec<DeclaredPayload>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ArtifactInfo {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) group: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct DeclaredPayload {
    #[serde(rename = "type")]
    pub(crate) type_name: String,
}

/// `UncheckedHeader` is a shadow of `ArtifactHeader`. It is used as an
/// interim deserialization target inside `ArtifactHeader`'s deserialization
/// implementation, which checks that the invariants hold before returning
/// the real type.
#[derive(Clone, Debug, Deserialize)]
struct UncheckedHeader {
    name: String,
    #[serde(default)]
    group: Option<String>,
    device_types: Vec<String>,
    payloads: Vec<PayloadInfo>,
}

impl<'de> Deserialize<'de> for ArtifactHeader {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let unchecked = UncheckedHeader::deserialize(deserializer)?;
        ArtifactHeader::validated(
            unchecked.name,
            unchecked.group,
            unchecked.device_types,
            unchecked.payloads,
        )
        // Serde throws away the backtraces of the underlying errors, so we
        // must manually create a debug log of the error to save it.
        .map_err(|e| de::Error::custom(format!("{e:?}")))
    }
}
