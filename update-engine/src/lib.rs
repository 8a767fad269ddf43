//! On-device orchestration of A/B firmware updates: artifact validation,
//! bank writes, bootloader environment marking, and persistent state
//! carried across the reboot boundary.

pub mod engine;
pub mod modules;
pub mod partition;
pub mod settings;
pub mod store;

pub use engine::{CommitOutcome, Engine, InstallOutcome};
pub use settings::{Args, Settings};
