//! The update module protocol.
//!
//! Each payload type is handled by a module. External modules are
//! executables at `<modules_dir>/<type>` invoked as
//! `<program> <verb> <work_dir> <payload_index>`; exit code 0 means
//! success, [`NEEDS_REBOOT_EXIT_CODE`] means the step succeeded and a
//! reboot is required, anything else is a failure. The `SupportsRollback`
//! verb answers `Yes` or `No` on stdout. The `rootfs-image` type is
//! built in and writes its image through the partition manager.

use std::{
    fmt::{self, Display},
    fs::File,
    io,
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
};

use ab_update_engine_core::Slot;
use tracing::{debug, warn};

use crate::partition::{self, PartitionManager};

/// Exit code by which a module signals that its step succeeded and the
/// device must reboot before the update can be committed.
pub const NEEDS_REBOOT_EXIT_CODE: i32 = 10;

/// Payload type handled by the built-in module.
pub const ROOTFS_TYPE: &str = "rootfs-image";

const SUPPORTS_ROLLBACK_VERB: &str = "SupportsRollback";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no update module for payload type `{type_name}` under `{}`", modules_dir.display())]
    UnknownPayloadType {
        type_name: String,
        modules_dir: PathBuf,
    },
    #[error("failed spawning update module `{}`", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("module `{type_name}` failed at `{point}` (exit code {code:?})")]
    HookFailed {
        type_name: String,
        point: String,
        code: Option<i32>,
    },
    #[error("module `{type_name}` answered `{answer}` to {SUPPORTS_ROLLBACK_VERB}, expected `Yes` or `No`")]
    RollbackQuery { type_name: String, answer: String },
    #[error("payload for `{type_name}` carries {found} files, expected exactly one image")]
    NotExactlyOneImage { type_name: String, found: usize },
    #[error("failed reading payload image for `{type_name}`")]
    ReadImage {
        type_name: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Partition(#[from] partition::Error),
}

/// Lifecycle states whose hook points modules are invoked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Download,
    ArtifactInstall,
    ArtifactReboot,
    ArtifactCommit,
    ArtifactRollback,
}

impl Hook {
    pub fn as_str(self) -> &'static str {
        match self {
            Hook::Download => "Download",
            Hook::ArtifactInstall => "ArtifactInstall",
            Hook::ArtifactReboot => "ArtifactReboot",
            Hook::ArtifactCommit => "ArtifactCommit",
            Hook::ArtifactRollback => "ArtifactRollback",
        }
    }

    const ALL: [Hook; 5] = [
        Hook::Download,
        Hook::ArtifactInstall,
        Hook::ArtifactReboot,
        Hook::ArtifactCommit,
        Hook::ArtifactRollback,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Enter,
    Run,
    Leave,
}

/// One hook point, e.g. `ArtifactCommit_Enter` or the bare state verb
/// `ArtifactCommit` for the action itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookPoint {
    pub hook: Hook,
    pub phase: Phase,
}

impl HookPoint {
    pub const fn new(hook: Hook, phase: Phase) -> Self {
        Self { hook, phase }
    }
}

impl Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Phase::Enter => write!(f, "{}_Enter", self.hook.as_str()),
            Phase::Run => f.write_str(self.hook.as_str()),
            Phase::Leave => write!(f, "{}_Leave", self.hook.as_str()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("`{0}` is not a hook point; expected e.g. `ArtifactCommit_Enter`")]
pub struct HookPointParseError(String);

impl FromStr for HookPoint {
    type Err = HookPointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, phase) = if let Some(name) = s.strip_suffix("_Enter") {
            (name, Phase::Enter)
        } else if let Some(name) = s.strip_suffix("_Leave") {
            (name, Phase::Leave)
        } else {
            (s, Phase::Run)
        };
        Hook::ALL
            .into_iter()
            .find(|hook| hook.as_str() == name)
            .map(|hook| HookPoint::new(hook, phase))
            .ok_or_else(|| HookPointParseError(s.to_string()))
    }
}

/// Result of a successful module invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    NeedsReboot,
}

/// Per-payload invocation context: the private working tree and the
/// payload's position in the artifact.
#[derive(Debug, Clone)]
pub struct Context {
    pub work_dir: PathBuf,
    pub payload_index: usize,
}

pub trait UpdateModule {
    fn type_name(&self) -> &str;
    fn supports_rollback(&self, ctx: &Context) -> Result<bool, Error>;
    fn run(&self, point: HookPoint, ctx: &Context) -> Result<Outcome, Error>;
}

impl fmt::Debug for dyn UpdateModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UpdateModule").field(&self.type_name()).finish()
    }
}

/// Resolves the module handling `type_name`, without invoking it. Called
/// for every payload before any write so an unknown type rejects the whole
/// artifact up front.
pub fn resolve(
    type_name: &str,
    modules_dir: &Path,
    partition: &PartitionManager,
    target: Slot,
) -> Result<Box<dyn UpdateModule>, Error> {
    if type_name == ROOTFS_TYPE {
        return Ok(Box::new(RootfsModule {
            partition: partition.clone(),
            target,
        }));
    }
    let program = modules_dir.join(type_name);
    if program.is_file() {
        return Ok(Box::new(ProcessModule {
            type_name: type_name.to_string(),
            program,
        }));
    }
    Err(Error::UnknownPayloadType {
        type_name: type_name.to_string(),
        modules_dir: modules_dir.to_path_buf(),
    })
}

/// An external module executable.
pub struct ProcessModule {
    type_name: String,
    program: PathBuf,
}

impl ProcessModule {
    fn output(&self, verb: &str, ctx: &Context) -> Result<std::process::Output, Error> {
        debug!(module = %self.type_name, verb, index = ctx.payload_index, "invoking update module");
        Command::new(&self.program)
            .arg(verb)
            .arg(&ctx.work_dir)
            .arg(ctx.payload_index.to_string())
            .output()
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

impl UpdateModule for ProcessModule {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn supports_rollback(&self, ctx: &Context) -> Result<bool, Error> {
        let output = self.output(SUPPORTS_ROLLBACK_VERB, ctx)?;
        if !output.status.success() {
            return Err(Error::HookFailed {
                type_name: self.type_name.clone(),
                point: SUPPORTS_ROLLBACK_VERB.to_string(),
                code: output.status.code(),
            });
        }
        match String::from_utf8_lossy(&output.stdout).trim() {
            "Yes" => Ok(true),
            "No" => Ok(false),
            answer => Err(Error::RollbackQuery {
                type_name: self.type_name.clone(),
                answer: answer.to_string(),
            }),
        }
    }

    fn run(&self, point: HookPoint, ctx: &Context) -> Result<Outcome, Error> {
        let output = self.output(&point.to_string(), ctx)?;
        if !output.stderr.is_empty() {
            warn!(
                module = %self.type_name,
                point = %point,
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "update module wrote to stderr"
            );
        }
        match output.status.code() {
            Some(0) => Ok(Outcome::Done),
            Some(NEEDS_REBOOT_EXIT_CODE) => Ok(Outcome::NeedsReboot),
            code => Err(Error::HookFailed {
                type_name: self.type_name.clone(),
                point: point.to_string(),
                code,
            }),
        }
    }
}

/// Built-in module writing a rootfs image to the passive bank.
pub struct RootfsModule {
    partition: PartitionManager,
    target: Slot,
}

impl UpdateModule for RootfsModule {
    fn type_name(&self) -> &str {
        ROOTFS_TYPE
    }

    fn supports_rollback(&self, _ctx: &Context) -> Result<bool, Error> {
        // Rolling back is flipping the boot environment to the untouched
        // bank; nothing to undo here.
        Ok(true)
    }

    fn run(&self, point: HookPoint, ctx: &Context) -> Result<Outcome, Error> {
        if point != HookPoint::new(Hook::ArtifactInstall, Phase::Run) {
            return Ok(Outcome::Done);
        }
        let image = single_image(&ctx.work_dir)?;
        let len = image
            .metadata()
            .map_err(|source| Error::ReadImage {
                type_name: ROOTFS_TYPE.to_string(),
                source,
            })?
            .len();
        let mut file = File::open(&image).map_err(|source| Error::ReadImage {
            type_name: ROOTFS_TYPE.to_string(),
            source,
        })?;
        self.partition.write(self.target, &mut file, len)?;
        Ok(Outcome::NeedsReboot)
    }
}

fn single_image(work_dir: &Path) -> Result<PathBuf, Error> {
    let read_err = |source| Error::ReadImage {
        type_name: ROOTFS_TYPE.to_string(),
        source,
    };
    let mut files = Vec::new();
    for entry in work_dir.read_dir().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        if entry.file_type().map_err(read_err)?.is_file() {
            files.push(entry.path());
        }
    }
    match files.len() {
        1 => Ok(files.remove(0)),
        found => Err(Error::NotExactlyOneImage {
            type_name: ROOTFS_TYPE.to_string(),
            found,
        }),
    }
}
