//! Bridge to the bootloader environment shared with the boot firmware.
//!
//! The environment decides which bank the firmware boots and whether an
//! update attempt is in flight. It is stored in two redundant copies so
//! that a crash mid-write never loses the whole environment; reads prefer
//! the valid copy with the highest generation, writes refresh both copies.
//! When neither copy is valid this crate fails loudly instead of assuming
//! defaults, because guessing here can brick the device.

use std::{
    collections::BTreeMap,
    io,
    path::PathBuf,
};

use tracing::{debug, warn};

mod copy;

pub use copy::CopyError;
use copy::{read_copy, write_copy, CopyContents};

/// Partition the firmware will load on the next boot.
pub const BOOT_PART: &str = "mender_boot_part";
/// `1` while an update attempt is in flight and not yet committed.
pub const UPGRADE_AVAILABLE: &str = "upgrade_available";
/// Incremented by the firmware on every boot attempt of an uncommitted
/// update; lets the firmware fall back on its own after repeated failures.
pub const BOOTCOUNT: &str = "bootcount";
/// Planted by the firmware's environment save path; checked before any
/// update marking as evidence that saves actually reach the firmware.
pub const SAVEENV_CANARY: &str = "mender_saveenv_canary";
/// The only value the canary is ever set to.
pub const CANARY_VALUE: &str = "1";

const FIRST_COPY: &str = "env1";
const SECOND_COPY: &str = "env2";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed writing bootloader environment at `{}`", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "no valid bootloader environment copy under `{}`; \
         copy 1: {first}; copy 2: {second}",
        root.display()
    )]
    NoValidCopy {
        root: PathBuf,
        first: CopyError,
        second: CopyError,
    },
    #[error("bootloader environment variable `{0}` is not set")]
    Missing(String),
    #[error("environment save mechanism unconfirmed; canary `{SAVEENV_CANARY}` did not read back")]
    CanaryAbsent,
}

/// Handle to the redundant environment stored under one root directory.
#[derive(Debug, Clone)]
pub struct BootEnv {
    root: PathBuf,
}

impl BootEnv {
    /// Opens the environment under `root`. No I/O happens until the first
    /// read or write.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates both copies with the given initial variables. Normally the
    /// firmware ships the environment; this exists for provisioning and
    /// tests.
    pub fn init(
        root: impl Into<PathBuf>,
        vars: &[(&str, &str)],
    ) -> Result<Self, Error> {
        let env = Self::open(root);
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.write_both(&vars, 0)?;
        Ok(env)
    }

    /// Reads every variable from the preferred copy.
    pub fn read_all(&self) -> Result<BTreeMap<String, String>, Error> {
        Ok(self.best_copy()?.vars)
    }

    pub fn get(&self, name: &str) -> Result<String, Error> {
        self.get_opt(name)?
            .ok_or_else(|| Error::Missing(name.to_string()))
    }

    pub fn get_opt(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(self.best_copy()?.vars.get(name).cloned())
    }

    /// Sets the given variables, refreshing both copies with a bumped
    /// generation. Unmentioned variables are preserved.
    pub fn set(&self, vars: &[(&str, &str)]) -> Result<(), Error> {
        let current = self.best_copy()?;
        let mut merged = current.vars;
        for (key, value) in vars {
            merged.insert(key.to_string(), value.to_string());
        }
        self.write_both(&merged, current.generation + 1)
    }

    /// Removes the given variables from both copies.
    pub fn unset(&self, names: &[&str]) -> Result<(), Error> {
        let current = self.best_copy()?;
        let mut merged = current.vars;
        for name in names {
            merged.remove(*name);
        }
        self.write_both(&merged, current.generation + 1)
    }

    /// Writes the canary variable. The firmware's environment save path
    /// normally plants this; the method exists for provisioning and tests.
    pub fn write_canary(&self) -> Result<(), Error> {
        self.set(&[(SAVEENV_CANARY, CANARY_VALUE)])
    }

    /// Fails with [`Error::CanaryAbsent`] unless the canary is present.
    /// The canary is only ever written by a working save mechanism, so its
    /// absence means environment writes may silently not reach the
    /// firmware.
    pub fn verify_canary(&self) -> Result<(), Error> {
        match self.get_opt(SAVEENV_CANARY)? {
            Some(value) if value == CANARY_VALUE => Ok(()),
            _ => Err(Error::CanaryAbsent),
        }
    }

    fn best_copy(&self) -> Result<CopyContents, Error> {
        let first = read_copy(&self.root.join(FIRST_COPY));
        let second = read_copy(&self.root.join(SECOND_COPY));
        match (first, second) {
            (Ok(a), Ok(b)) => {
                if a.generation >= b.generation {
                    Ok(a)
                } else {
                    Ok(b)
                }
            }
            (Ok(a), Err(e)) => {
                warn!(copy = SECOND_COPY, error = %e, "environment copy invalid, using the other");
                Ok(a)
            }
            (Err(e), Ok(b)) => {
                warn!(copy = FIRST_COPY, error = %e, "environment copy invalid, using the other");
                Ok(b)
            }
            (Err(first), Err(second)) => Err(Error::NoValidCopy {
                root: self.root.clone(),
                first,
                second,
            }),
        }
    }

    fn write_both(
        &self,
        vars: &BTreeMap<String, String>,
        generation: u64,
    ) -> Result<(), Error> {
        debug!(generation, root = %self.root.display(), "writing bootloader environment");
        for copy in [FIRST_COPY, SECOND_COPY] {
            let dir = self.root.join(copy);
            write_copy(&dir, vars, generation).map_err(|source| Error::Write {
                path: dir,
                source,
            })?;
        }
        Ok(())
    }
}
