//! The update state machine.
//!
//! An update attempt moves through `Downloading`, `ArtifactInstall`,
//! `ArtifactReboot`, and `ArtifactCommit` (or `ArtifactRollback`), with
//! `Enter`/`Leave` hook points around each state delegated to the update
//! modules. The point of no return is the boot environment flip at the end
//! of `install`; before it an attempt is reversed on failure, after it the
//! attempt moves forward to `commit` or is undone by `rollback`. Every
//! transition is persisted to the state store first, so a crash or reboot
//! at any point resumes deterministically.

use std::{collections::BTreeMap, io, path::Path};

use ab_boot_env::{BootEnv, BOOTCOUNT, BOOT_PART, UPGRADE_AVAILABLE};
use ab_update_engine_core::{
    artifact,
    signatures::{self, KeyLoadError, VerifyPolicy},
    Artifact, Slot,
};
use tracing::{info, warn};

use crate::{
    modules::{self, Context, Hook, HookPoint, Outcome, Phase, UpdateModule},
    partition::PartitionManager,
    settings::Settings,
    store::{
        self, StateStore, StoreData, UpdateRecord, UpdateState, ARTIFACT_GROUP_KEY,
        ARTIFACT_NAME_KEY, PAYLOAD_TYPES_KEY,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("artifact rejected")]
    Artifact(#[from] artifact::Error),
    #[error("failed loading artifact verification key")]
    KeyLoad(#[from] KeyLoadError),
    #[error("bootloader environment failure")]
    Environment(#[from] ab_boot_env::Error),
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error(transparent)]
    Module(#[from] modules::Error),
    #[error(
        "an update to `{artifact_name}` is already in progress; commit or roll it back first"
    )]
    InstallInProgress { artifact_name: String },
    #[error("nothing to do")]
    NothingToDo,
    #[error("installing `{artifact_name}` failed; the attempt was rolled back")]
    InstallFailed {
        artifact_name: String,
        #[source]
        source: modules::Error,
    },
    #[error(
        "installation of `{artifact_name}` was interrupted before the reboot point; \
         the attempt was rolled back"
    )]
    InstallInterrupted { artifact_name: String },
    #[error(
        "firmware fell back to the original bank; `{artifact_name}` was rolled back"
    )]
    BootFellBack { artifact_name: String },
    #[error("payload type `{type_name}` does not support rollback")]
    RollbackNotSupported { type_name: String },
    #[error("boot environment points at unknown boot partition `{boot_part}`")]
    UnknownBootPart { boot_part: String },
    #[error(
        "the in-flight update record predates slot tracking; the original bank is unknown"
    )]
    UnknownOriginalSlot,
    #[error("failed writing output")]
    Output(#[source] io::Error),
}

/// What `install` left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub artifact_name: String,
    /// At least one module asked for a reboot before commit.
    pub needs_reboot: bool,
}

/// What `commit` left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { artifact_name: String },
    /// Commit stopped in front of the requested hook point; the in-flight
    /// record is preserved for a later resume.
    Stopped { before: HookPoint },
}

pub struct Engine {
    settings: Settings,
    store: StateStore,
    env: BootEnv,
    partition: PartitionManager,
}

impl Engine {
    pub fn new(settings: Settings) -> Self {
        let store = StateStore::new(&settings.store);
        let env = BootEnv::open(&settings.boot_env);
        let partition =
            PartitionManager::new(settings.bank_a.clone(), settings.bank_b.clone());
        Self {
            settings,
            store,
            env,
            partition,
        }
    }

    /// Validates the artifact at `path` and installs it onto the passive
    /// bank. Ends with the boot environment pointing at the new bank and
    /// an in-flight record awaiting `commit`.
    pub fn install(&self, path: &Path) -> Result<InstallOutcome, Error> {
        let mut data = self.store.load()?;
        if let Some(record) = &data.in_progress {
            return Err(Error::InstallInProgress {
                artifact_name: record.artifact_name.clone(),
            });
        }

        let policy = self.verify_policy()?;
        let artifact = Artifact::open(path, &self.settings.workspace, &policy)?;
        artifact.ensure_compatible(&self.settings.device_type)?;

        let active = self.active_slot()?;
        let passive = active.opposite();
        // Resolving all modules up front rejects unknown payload types
        // before anything is written.
        let payload_types: Vec<String> = artifact
            .payloads()
            .iter()
            .map(|p| p.info.type_name.clone())
            .collect();
        let modules = self.resolve_modules(&payload_types, passive)?;

        // The canary is planted by the firmware's own environment save
        // path. If it is absent here, saves may not reach the firmware
        // and marking an update is unsafe.
        self.env.verify_canary()?;

        let mut supports_rollback = true;
        for (index, module) in modules.iter().enumerate() {
            supports_rollback &= module.supports_rollback(&self.context(index))?;
        }

        let mut provides = BTreeMap::new();
        let mut clears_provides = Vec::new();
        for payload in artifact.payloads() {
            provides.extend(payload.info.provides.clone());
            clears_provides.extend(payload.info.clears_provides.iter().cloned());
        }
        let header = artifact.header();
        let mut record = UpdateRecord {
            state: UpdateState::Downloading,
            artifact_name: header.name().to_string(),
            artifact_group: header.group().map(Into::into),
            payload_types,
            provides,
            clears_provides,
            original_active: Some(active),
            supports_rollback,
            needs_reboot: false,
            reached: None,
        };
        data.in_progress = Some(record.clone());
        self.store.save(&data)?;
        info!(
            artifact = %record.artifact_name,
            active = %active,
            passive = %passive,
            "installing update"
        );

        let needs_reboot =
            match self.run_install_states(&modules, &mut record, &mut data) {
                Ok(needs_reboot) => needs_reboot,
                Err(Error::Module(source)) => {
                    warn!(error = %source, "install hook failed, reversing the attempt");
                    if record.supports_rollback {
                        self.run_rollback_hooks(&modules);
                    }
                    data.in_progress = None;
                    self.store.save(&data)?;
                    return Err(Error::InstallFailed {
                        artifact_name: record.artifact_name,
                        source,
                    });
                }
                Err(other) => return Err(other),
            };

        // Point of no return: after this flip the attempt only moves
        // forward to commit or is undone by an explicit rollback.
        let passive_part = self.partition.bank(passive).boot_part.clone();
        self.env.set(&[
            (BOOT_PART, passive_part.as_str()),
            (UPGRADE_AVAILABLE, "1"),
            (BOOTCOUNT, "0"),
        ])?;
        record.state = UpdateState::ArtifactReboot;
        record.needs_reboot = needs_reboot;
        data.in_progress = Some(record.clone());
        self.store.save(&data)?;
        info!(
            artifact = %record.artifact_name,
            needs_reboot, "installed, awaiting commit"
        );
        Ok(InstallOutcome {
            artifact_name: record.artifact_name,
            needs_reboot,
        })
    }

    /// Finishes the in-flight update: confirms the new bank, merges its
    /// provides into the committed set, and clears the record. Detects a
    /// firmware fallback to the original bank and rolls back instead.
    ///
    /// `stop_before` stops in front of the named hook point, leaving the
    /// record resumable; it exists to exercise interrupted commits.
    pub fn commit(
        &self,
        stop_before: Option<HookPoint>,
    ) -> Result<CommitOutcome, Error> {
        let mut data = self.store.load()?;
        let Some(mut record) = data.in_progress.clone() else {
            return Err(Error::NothingToDo);
        };

        match record.state {
            UpdateState::Downloading
            | UpdateState::ArtifactInstall
            | UpdateState::ArtifactRollback => {
                // The attempt never reached the reboot point (or was
                // already rolling back): reverse it.
                let original =
                    record.original_active.ok_or(Error::UnknownOriginalSlot)?;
                if record.supports_rollback {
                    let modules = self
                        .resolve_modules(&record.payload_types, original.opposite())?;
                    self.run_rollback_hooks(&modules);
                }
                data.in_progress = None;
                self.store.save(&data)?;
                return Err(Error::InstallInterrupted {
                    artifact_name: record.artifact_name,
                });
            }
            UpdateState::ArtifactReboot | UpdateState::ArtifactCommit => {}
        }

        let original = record.original_active.ok_or(Error::UnknownOriginalSlot)?;
        let target = original.opposite();
        let active = self.active_slot()?;
        if active == original {
            warn!(
                artifact = %record.artifact_name,
                "firmware fell back to the original bank, rolling back"
            );
            self.env
                .set(&[(UPGRADE_AVAILABLE, "0"), (BOOTCOUNT, "0")])?;
            if record.supports_rollback {
                let modules = self.resolve_modules(&record.payload_types, target)?;
                self.run_rollback_hooks(&modules);
            }
            data.in_progress = None;
            self.store.save(&data)?;
            return Err(Error::BootFellBack {
                artifact_name: record.artifact_name,
            });
        }

        let modules = self.resolve_modules(&record.payload_types, target)?;
        record.state = UpdateState::ArtifactCommit;
        data.in_progress = Some(record.clone());
        self.store.save(&data)?;

        let enter = HookPoint::new(Hook::ArtifactCommit, Phase::Enter);
        let marking = HookPoint::new(Hook::ArtifactCommit, Phase::Run);
        let leave = HookPoint::new(Hook::ArtifactCommit, Phase::Leave);
        // `reached` marks the last completed step so a rerun after a crash
        // or a failed hook resumes without repeating it.
        let reached_enter = record.reached.as_deref() == Some("ArtifactCommit_Enter");
        let reached_marking = record.reached.as_deref() == Some("ArtifactCommit");

        if !reached_enter && !reached_marking {
            if stop_before == Some(enter) {
                info!(point = %enter, "stopping commit before hook point");
                return Ok(CommitOutcome::Stopped { before: enter });
            }
            self.run_point(&modules, enter)?;
            record.reached = Some(enter.to_string());
            data.in_progress = Some(record.clone());
            self.store.save(&data)?;
        }

        if !reached_marking {
            if stop_before == Some(marking) {
                info!(point = %marking, "stopping commit before hook point");
                return Ok(CommitOutcome::Stopped { before: marking });
            }
            self.env
                .set(&[(UPGRADE_AVAILABLE, "0"), (BOOTCOUNT, "0")])?;
            merge_provides(&mut data, &record);
            record.reached = Some(marking.to_string());
            data.in_progress = Some(record.clone());
            self.store.save(&data)?;
            info!(artifact = %record.artifact_name, "update committed");
        }

        if stop_before == Some(leave) {
            info!(point = %leave, "stopping commit before hook point");
            return Ok(CommitOutcome::Stopped { before: leave });
        }
        self.run_point(&modules, leave)?;
        data.in_progress = None;
        self.store.save(&data)?;

        Ok(CommitOutcome::Committed {
            artifact_name: record.artifact_name,
        })
    }

    /// Undoes the in-flight update: restores the boot environment to the
    /// original bank and runs the rollback hooks. Fails with
    /// [`Error::RollbackNotSupported`] when any payload type cannot roll
    /// back, rather than silently skipping it.
    pub fn rollback(&self) -> Result<(), Error> {
        let mut data = self.store.load()?;
        let Some(mut record) = data.in_progress.clone() else {
            return Err(Error::NothingToDo);
        };
        let original = record.original_active.ok_or(Error::UnknownOriginalSlot)?;
        let modules =
            self.resolve_modules(&record.payload_types, original.opposite())?;
        for (index, module) in modules.iter().enumerate() {
            if !module.supports_rollback(&self.context(index))? {
                return Err(Error::RollbackNotSupported {
                    type_name: module.type_name().to_string(),
                });
            }
        }

        record.state = UpdateState::ArtifactRollback;
        data.in_progress = Some(record.clone());
        self.store.save(&data)?;

        let original_part = self.partition.bank(original).boot_part.clone();
        self.env.set(&[
            (BOOT_PART, original_part.as_str()),
            (UPGRADE_AVAILABLE, "0"),
            (BOOTCOUNT, "0"),
        ])?;
        self.run_rollback_hooks(&modules);
        data.in_progress = None;
        self.store.save(&data)?;
        info!(artifact = %record.artifact_name, "update rolled back");
        Ok(())
    }

    /// Writes the committed provides map as sorted `key=value` lines.
    /// Reading state only; calling it never changes the store.
    pub fn show_provides(&self, out: &mut impl io::Write) -> Result<(), Error> {
        let data = self.store.load()?;
        for (key, value) in &data.provides {
            writeln!(out, "{key}={value}").map_err(Error::Output)?;
        }
        Ok(())
    }

    fn active_slot(&self) -> Result<Slot, Error> {
        let boot_part = self.env.get(BOOT_PART)?;
        self.partition
            .slot_for_boot_part(&boot_part)
            .ok_or(Error::UnknownBootPart { boot_part })
    }

    fn verify_policy(&self) -> Result<VerifyPolicy, Error> {
        match &self.settings.verify_key {
            Some(path) => Ok(VerifyPolicy::Require(signatures::load_verifying_key(
                path,
            )?)),
            None => Ok(VerifyPolicy::AcceptUnsigned),
        }
    }

    fn resolve_modules(
        &self,
        payload_types: &[String],
        target: Slot,
    ) -> Result<Vec<Box<dyn UpdateModule>>, Error> {
        payload_types
            .iter()
            .map(|type_name| {
                modules::resolve(
                    type_name,
                    &self.settings.modules,
                    &self.partition,
                    target,
                )
                .map_err(Error::Module)
            })
            .collect()
    }

    fn context(&self, payload_index: usize) -> Context {
        Context {
            work_dir: self
                .settings
                .workspace
                .join("payloads")
                .join(format!("{payload_index:04}")),
            payload_index,
        }
    }

    /// Runs one hook point for every payload, in payload order.
    fn run_point(
        &self,
        modules: &[Box<dyn UpdateModule>],
        point: HookPoint,
    ) -> Result<bool, modules::Error> {
        let mut needs_reboot = false;
        for (index, module) in modules.iter().enumerate() {
            let outcome = module.run(point, &self.context(index))?;
            needs_reboot |= outcome == Outcome::NeedsReboot;
        }
        Ok(needs_reboot)
    }

    fn run_install_states(
        &self,
        modules: &[Box<dyn UpdateModule>],
        record: &mut UpdateRecord,
        data: &mut StoreData,
    ) -> Result<bool, Error> {
        let mut needs_reboot = false;
        for (hook, state) in [
            (Hook::Download, UpdateState::Downloading),
            (Hook::ArtifactInstall, UpdateState::ArtifactInstall),
        ] {
            // The store is the crash-recovery anchor; a transition that
            // cannot be persisted must fail the attempt, not proceed.
            record.state = state;
            data.in_progress = Some(record.clone());
            self.store.save(data)?;
            for phase in [Phase::Enter, Phase::Run, Phase::Leave] {
                needs_reboot |= self.run_point(modules, HookPoint::new(hook, phase))?;
            }
        }
        Ok(needs_reboot)
    }

    /// Single-attempt rollback hooks; failures are logged, not retried.
    fn run_rollback_hooks(&self, modules: &[Box<dyn UpdateModule>]) {
        for phase in [Phase::Enter, Phase::Run, Phase::Leave] {
            let point = HookPoint::new(Hook::ArtifactRollback, phase);
            for (index, module) in modules.iter().enumerate() {
                if let Err(e) = module.run(point, &self.context(index)) {
                    warn!(
                        module = module.type_name(),
                        point = %point,
                        error = %e,
                        "rollback hook failed, continuing"
                    );
                }
            }
        }
    }
}

/// Folds a committed update's provides into the device's map: keys matched
/// by the artifact's clears patterns are dropped, then the new provides are
/// merged on top.
fn merge_provides(data: &mut StoreData, record: &UpdateRecord) {
    for pattern in &record.clears_provides {
        data.provides.retain(|key, _| !glob_match(pattern, key));
    }
    data.provides.extend(record.provides.clone());
    data.provides
        .insert(ARTIFACT_NAME_KEY.to_string(), record.artifact_name.clone());
    match &record.artifact_group {
        Some(group) => {
            data.provides
                .insert(ARTIFACT_GROUP_KEY.to_string(), group.clone());
        }
        None => {
            data.provides.remove(ARTIFACT_GROUP_KEY);
        }
    }
    data.provides.insert(
        PAYLOAD_TYPES_KEY.to_string(),
        record.payload_types.join(","),
    );
    data.clears_provides = record.clears_provides.clone();
}

/// `*` matches any (possibly empty) substring; everything else is literal.
fn glob_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((prefix, rest)) => {
            let Some(text) = text.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            (0..=text.len()).any(|i| glob_match(rest, &text[i..]))
        }
    }
}
