use std::path::{Path, PathBuf};

use figment::providers::Format as _;
use serde::{Deserialize, Serialize};

use crate::partition::BankConfig;

mod args;
pub use args::Args;


/// `Settings` are the configurable options for running the update engine.
///
/// The only entry point to construct `Settings` is `Settings::get`.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    /// Device type matched against the compatibility list of every
    /// artifact before installation.
    pub device_type: String,
    /// Scratch directory for extracted payloads and module working trees.
    pub workspace: PathBuf,
    /// Path of the persistent state store file.
    pub store: PathBuf,
    /// Root directory of the redundant bootloader environment.
    pub boot_env: PathBuf,
    /// Directory holding external update module executables.
    pub modules: PathBuf,
    /// Ed25519 public key file (hex or base64). When set, every artifact
    /// must carry a valid signature; when absent, unsigned artifacts are
    /// accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_key: Option<PathBuf>,
    pub bank_a: BankConfig,
    pub bank_b: BankConfig,
}

impl Settings {
    /// Constructs `Settings` from a config file, environment variables, and command line
    /// arguments. Command line arguments always take precedence over environment variables, which
    /// in turn take precedence over the config file.
    pub fn get<P: AsRef<Path>>(
        args: &Args,
        config: P,
        env_prefix: &str,
    ) -> figment::error::Result<Settings> {
        figment::Figment::new()
            .merge(figment::providers::Toml::file(config))
            .merge(figment::providers::Env::prefixed(env_prefix))
            .merge(figment::providers::Serialized::defaults(args))
            .extract()
    }
}
