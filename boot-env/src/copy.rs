//! One redundant environment copy on disk.
//!
//! A copy is a directory holding two files. `env` carries the variables as
//! sorted `key=value` lines, a `generation=<n>` line, and a final
//! `crc=<n>` trailer computed over every preceding byte. `lock` carries the
//! commit marker `editing=0|1` and is written last; a copy caught with
//! `editing=1` was interrupted mid-write and does not count as valid.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, Write as _},
    path::Path,
};

const ENV_FILE: &str = "env";
const LOCK_FILE: &str = "lock";
const GENERATION_KEY: &str = "generation";
const CRC_KEY: &str = "crc";

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("failed reading environment copy")]
    Io(#[from] io::Error),
    #[error("copy was interrupted mid-write (lock marker `{found}`)")]
    Uncommitted { found: String },
    #[error("crc mismatch; recorded {recorded}, calculated {calculated}")]
    CrcMismatch { recorded: u32, calculated: u32 },
    #[error("malformed environment line `{0}`")]
    MalformedLine(String),
    #[error("environment blob is missing its `{0}` line")]
    MissingField(&'static str),
}

#[derive(Debug, Clone)]
pub(crate) struct CopyContents {
    pub(crate) vars: BTreeMap<String, String>,
    pub(crate) generation: u64,
}

pub(crate) fn read_copy(dir: &Path) -> Result<CopyContents, CopyError> {
    let lock = fs::read_to_string(dir.join(LOCK_FILE))?;
    let lock = lock.trim();
    if lock != "editing=0" {
        return Err(CopyError::Uncommitted {
            found: lock.to_string(),
        });
    }

    let blob = fs::read_to_string(dir.join(ENV_FILE))?;
    let (body, crc_line) = match blob.trim_end_matches('\n').rsplit_once('\n') {
        Some((body, crc_line)) => (format!("{body}\n"), crc_line),
        None => return Err(CopyError::MissingField(CRC_KEY)),
    };
    let recorded = crc_line
        .strip_prefix("crc=")
        .ok_or(CopyError::MissingField(CRC_KEY))?
        .parse::<u32>()
        .map_err(|_| CopyError::MalformedLine(crc_line.to_string()))?;
    let calculated = crc32fast::hash(body.as_bytes());
    if recorded != calculated {
        return Err(CopyError::CrcMismatch {
            recorded,
            calculated,
        });
    }

    let mut vars = BTreeMap::new();
    let mut generation = None;
    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else {
            return Err(CopyError::MalformedLine(line.to_string()));
        };
        if key == GENERATION_KEY {
            generation = Some(
                value
                    .parse::<u64>()
                    .map_err(|_| CopyError::MalformedLine(line.to_string()))?,
            );
        } else {
            vars.insert(key.to_string(), value.to_string());
        }
    }
    let generation = generation.ok_or(CopyError::MissingField(GENERATION_KEY))?;
    Ok(CopyContents { vars, generation })
}

/// Writes a copy in the commit-safe order: invalidate the lock, replace the
/// env blob, then commit the lock.
pub(crate) fn write_copy(
    dir: &Path,
    vars: &BTreeMap<String, String>,
    generation: u64,
) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    write_sync(&dir.join(LOCK_FILE), b"editing=1\n")?;

    let mut body = String::new();
    for (key, value) in vars {
        body.push_str(key);
        body.push('=');
        body.push_str(value);
        body.push('\n');
    }
    body.push_str(GENERATION_KEY);
    body.push('=');
    body.push_str(&generation.to_string());
    body.push('\n');
    let crc = crc32fast::hash(body.as_bytes());
    body.push_str(CRC_KEY);
    body.push('=');
    body.push_str(&crc.to_string());
    body.push('\n');
    write_sync(&dir.join(ENV_FILE), body.as_bytes())?;

    write_sync(&dir.join(LOCK_FILE), b"editing=0\n")
}

fn write_sync(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
