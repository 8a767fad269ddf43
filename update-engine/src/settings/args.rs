use clap::Parser;
use serde::Serialize;

/// Command line overrides for the engine settings. Bank configuration is
/// file-only; everything here shadows a top-level settings key.
#[derive(Debug, Default, Parser, Serialize)]
pub struct Args {
    /// The path to the config file.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Device type matched against artifact compatibility.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// The workspace destination.
    #[arg(long, alias = "wd")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    /// Path of the persistent state store file.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    /// Root directory of the bootloader environment.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_env: Option<String>,
    /// Directory holding external update module executables.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modules: Option<String>,
    /// Ed25519 public key file for artifact signatures.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_key: Option<String>,
}
