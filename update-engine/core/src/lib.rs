#![forbid(unsafe_code)]
#![warn(unreachable_pub)]

pub mod artifact;
pub mod checksum;
pub mod header;
pub mod signatures;
mod slot;
pub mod test_support;

pub use artifact::Artifact;
pub use header::{ArtifactHeader, PayloadInfo};
pub use signatures::VerifyPolicy;
pub use slot::Slot;

/// Crates reexported for use
pub mod reexports {
    pub use ed25519_dalek;
}
