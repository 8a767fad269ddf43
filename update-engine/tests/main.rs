//! End-to-end flows against a fake device: file-backed banks, a real
//! redundant boot environment in a temp directory, and shell-script update
//! modules. Every operation constructs a fresh engine, which doubles as a
//! process restart (and, together with the environment, a reboot).

use std::{fs, os::unix::fs::PermissionsExt as _, path::PathBuf};

use ab_boot_env::{
    BootEnv, BOOTCOUNT, BOOT_PART, CANARY_VALUE, SAVEENV_CANARY, UPGRADE_AVAILABLE,
};
use ab_update_engine::{
    engine::{CommitOutcome, Error},
    modules::HookPoint,
    partition::{BankConfig, BankKind},
    store::{StateStore, StoreData, UpdateRecord, UpdateState},
    Engine, Settings,
};
use ab_update_engine_core::{
    artifact,
    test_support::{ArtifactBuilder, Tamper},
    PayloadInfo, Slot,
};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::SigningKey;
use tempfile::TempDir;

const BANK_SIZE: usize = 4096;
const DEVICE_TYPE: &str = "device-a";

struct Fixture {
    tmp: TempDir,
    verify_key: Option<PathBuf>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("workspace")).unwrap();
        fs::create_dir_all(tmp.path().join("modules")).unwrap();
        fs::write(tmp.path().join("bank_a"), vec![0u8; BANK_SIZE]).unwrap();
        fs::write(tmp.path().join("bank_b"), vec![0u8; BANK_SIZE]).unwrap();
        // The canary is normally planted by the firmware's save path.
        BootEnv::init(
            tmp.path().join("boot-env"),
            &[
                (BOOT_PART, "2"),
                (UPGRADE_AVAILABLE, "0"),
                (SAVEENV_CANARY, CANARY_VALUE),
            ],
        )
        .unwrap();
        Self {
            tmp,
            verify_key: None,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    fn settings(&self) -> Settings {
        let bank = |file: &str, part: &str| BankConfig {
            path: self.path(file),
            kind: BankKind::Raw,
            capacity: None,
            boot_part: part.to_string(),
        };
        Settings {
            device_type: DEVICE_TYPE.to_string(),
            workspace: self.path("workspace"),
            store: self.path("state.json"),
            boot_env: self.path("boot-env"),
            modules: self.path("modules"),
            verify_key: self.verify_key.clone(),
            bank_a: bank("bank_a", "2"),
            bank_b: bank("bank_b", "3"),
        }
    }

    fn engine(&self) -> Engine {
        Engine::new(self.settings())
    }

    fn env(&self) -> BootEnv {
        BootEnv::open(self.path("boot-env"))
    }

    fn store_data(&self) -> StoreData {
        StateStore::new(self.path("state.json")).load().unwrap()
    }

    fn write_artifact(&self, builder: ArtifactBuilder) -> PathBuf {
        let path = self.path("release.ab");
        builder.write_to(&path).unwrap();
        path
    }

    fn script(&self, type_name: &str, body: &str) {
        let path = self.path("modules").join(type_name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn rootfs_artifact(name: &str, image: &[u8]) -> ArtifactBuilder {
    let mut info = PayloadInfo::new("rootfs-image");
    info.provides
        .insert("rootfs-image.version".to_string(), name.to_string());
    info.clears_provides.push("rootfs-image.*".to_string());
    ArtifactBuilder::new(name, DEVICE_TYPE)
        .payload_with_info(info, vec![("image.dat", image.to_vec())])
}

#[test]
fn install_writes_the_passive_bank_and_flips_the_environment() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));

    let outcome = fx.engine().install(&artifact).unwrap();
    assert_eq!(outcome.artifact_name, "release-2");
    assert!(outcome.needs_reboot);

    let bank_b = fs::read(fx.path("bank_b")).unwrap();
    assert_eq!(&bank_b[..9], b"rootfs v2");
    // The active bank is untouched.
    assert_eq!(fs::read(fx.path("bank_a")).unwrap(), vec![0u8; BANK_SIZE]);

    let env = fx.env();
    assert_eq!(env.get(BOOT_PART).unwrap(), "3");
    assert_eq!(env.get(UPGRADE_AVAILABLE).unwrap(), "1");
    assert_eq!(env.get(BOOTCOUNT).unwrap(), "0");

    let record = fx.store_data().in_progress.unwrap();
    assert_eq!(record.state, UpdateState::ArtifactReboot);
    assert_eq!(record.original_active, Some(Slot::A));
    assert!(record.supports_rollback);
}

#[test]
fn commit_after_reboot_merges_provides_and_clears_the_record() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));
    fx.engine().install(&artifact).unwrap();

    // The environment now boots the new bank; a fresh engine plays the
    // post-reboot process.
    let outcome = fx.engine().commit(None).unwrap();
    assert_eq!(
        outcome,
        CommitOutcome::Committed {
            artifact_name: "release-2".to_string()
        }
    );

    let data = fx.store_data();
    assert!(data.in_progress.is_none());
    assert_eq!(data.provides["artifact_name"], "release-2");
    assert_eq!(data.provides["rootfs-image.version"], "release-2");
    assert_eq!(fx.env().get(UPGRADE_AVAILABLE).unwrap(), "0");

    // Nothing left to commit.
    assert!(matches!(
        fx.engine().commit(None).unwrap_err(),
        Error::NothingToDo
    ));
}

#[test]
fn show_provides_is_idempotent() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));
    fx.engine().install(&artifact).unwrap();
    fx.engine().commit(None).unwrap();

    let mut first = Vec::new();
    fx.engine().show_provides(&mut first).unwrap();
    let store_bytes = fs::read(fx.path("state.json")).unwrap();
    let mut second = Vec::new();
    fx.engine().show_provides(&mut second).unwrap();

    assert_eq!(first, second);
    assert!(String::from_utf8(first)
        .unwrap()
        .contains("artifact_name=release-2"));
    // Reading state never rewrites the store.
    assert_eq!(fs::read(fx.path("state.json")).unwrap(), store_bytes);
}

#[test]
fn rollback_restores_the_original_bank() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));
    fx.engine().install(&artifact).unwrap();

    fx.engine().rollback().unwrap();

    let env = fx.env();
    assert_eq!(env.get(BOOT_PART).unwrap(), "2");
    assert_eq!(env.get(UPGRADE_AVAILABLE).unwrap(), "0");
    let data = fx.store_data();
    assert!(data.in_progress.is_none());
    // Nothing was committed.
    assert!(!data.provides.contains_key("artifact_name"));

    assert!(matches!(
        fx.engine().rollback().unwrap_err(),
        Error::NothingToDo
    ));
}

#[test]
fn a_second_install_is_rejected_not_queued() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));
    fx.engine().install(&artifact).unwrap();

    let err = fx.engine().install(&artifact).unwrap_err();
    assert!(matches!(
        err,
        Error::InstallInProgress { artifact_name } if artifact_name == "release-2"
    ));
}

#[test]
fn oversized_image_fails_before_touching_the_bank() {
    let fx = Fixture::new();
    let image = vec![1u8; BANK_SIZE * 2];
    let artifact = fx.write_artifact(rootfs_artifact("release-2", &image));

    let err = fx.engine().install(&artifact).unwrap_err();
    assert!(matches!(err, Error::InstallFailed { .. }));
    assert!(err.to_string().contains("rolled back"));

    assert_eq!(fs::read(fx.path("bank_b")).unwrap(), vec![0u8; BANK_SIZE]);
    assert_eq!(fx.env().get(BOOT_PART).unwrap(), "2");
    assert!(fx.store_data().in_progress.is_none());
}

#[test]
fn tampered_payload_rejects_the_artifact_without_side_effects() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(
        rootfs_artifact("release-2", b"rootfs v2").tamper(Tamper::Payload { index: 0 }),
    );

    let err = fx.engine().install(&artifact).unwrap_err();
    assert!(matches!(
        err,
        Error::Artifact(artifact::Error::PayloadIntegrity(_))
    ));
    assert_eq!(fs::read(fx.path("bank_b")).unwrap(), vec![0u8; BANK_SIZE]);
    assert!(fx.store_data().in_progress.is_none());
}

#[test]
fn configured_key_makes_signatures_mandatory() {
    let mut fx = Fixture::new();
    let key = SigningKey::from_bytes(&[13u8; 32]);
    let key_path = fx.path("verify.key");
    fs::write(
        &key_path,
        BASE64_STANDARD.encode(key.verifying_key().to_bytes()),
    )
    .unwrap();
    fx.verify_key = Some(key_path);

    let unsigned = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));
    let err = fx.engine().install(&unsigned).unwrap_err();
    assert!(matches!(err, Error::Artifact(artifact::Error::Signature(_))));

    let signed =
        fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2").sign(key));
    fx.engine().install(&signed).unwrap();
}

#[test]
fn incompatible_device_type_is_rejected() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(
        ArtifactBuilder::new("release-2", "other-device")
            .payload("rootfs-image", vec![("image.dat", b"x".to_vec())]),
    );
    let err = fx.engine().install(&artifact).unwrap_err();
    assert!(matches!(
        err,
        Error::Artifact(artifact::Error::IncompatibleDevice { .. })
    ));
}

#[test]
fn unknown_payload_type_is_rejected_before_any_write() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(
        ArtifactBuilder::new("release-2", DEVICE_TYPE)
            .payload("mystery", vec![("blob", b"?".to_vec())]),
    );
    let err = fx.engine().install(&artifact).unwrap_err();
    assert!(matches!(err, Error::Module(_)));
    assert!(fx.store_data().in_progress.is_none());
    assert_eq!(fx.env().get(BOOT_PART).unwrap(), "2");
}

#[test]
fn missing_boot_environment_aborts_before_touching_the_bank() {
    let fx = Fixture::new();
    fs::remove_dir_all(fx.path("boot-env")).unwrap();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));

    let err = fx.engine().install(&artifact).unwrap_err();
    assert!(matches!(err, Error::Environment(_)));
    assert_eq!(fs::read(fx.path("bank_b")).unwrap(), vec![0u8; BANK_SIZE]);
}

#[test]
fn absent_canary_refuses_install_without_marking_anything() {
    let fx = Fixture::new();
    // The firmware never planted the canary, so environment saves are
    // unproven; the engine must not plant it on the firmware's behalf.
    fx.env().unset(&[SAVEENV_CANARY]).unwrap();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));

    let err = fx.engine().install(&artifact).unwrap_err();
    assert!(matches!(
        err,
        Error::Environment(ab_boot_env::Error::CanaryAbsent)
    ));
    let env = fx.env();
    assert_eq!(env.get(UPGRADE_AVAILABLE).unwrap(), "0");
    assert_eq!(env.get(BOOT_PART).unwrap(), "2");
    assert_eq!(env.get_opt(SAVEENV_CANARY).unwrap(), None);
    assert_eq!(fs::read(fx.path("bank_b")).unwrap(), vec![0u8; BANK_SIZE]);
    assert!(fx.store_data().in_progress.is_none());
}

#[test]
fn a_renamed_payload_installs_cleanly_after_a_previous_release() {
    let fx = Fixture::new();
    fx.engine()
        .install(&fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2")))
        .unwrap();
    fx.engine().commit(None).unwrap();

    // The next release ships its image under a different file name; the
    // workspace from the previous install must not leak into it.
    let next = ArtifactBuilder::new("release-3", DEVICE_TYPE)
        .payload("rootfs-image", vec![("rootfs-v3.img", b"rootfs v3".to_vec())]);
    let outcome = fx.engine().install(&fx.write_artifact(next)).unwrap();
    assert_eq!(outcome.artifact_name, "release-3");

    // Bank B is active now, so the new image lands in bank A.
    let bank_a = fs::read(fx.path("bank_a")).unwrap();
    assert_eq!(&bank_a[..9], b"rootfs v3");
    assert_eq!(fx.env().get(BOOT_PART).unwrap(), "2");
}

#[test]
fn a_failed_state_persist_fails_the_attempt_before_the_flip() {
    let fx = Fixture::new();
    // The module wrecks the store mid-install; the next state transition
    // cannot be persisted and the attempt must stop short of the flip.
    let store = fx.path("state.json");
    fx.script(
        "single-file",
        &format!(
            r#"case "$1" in
Download) rm -rf {store}; mkdir {store} ;;
SupportsRollback) echo Yes ;;
esac
exit 0"#,
            store = store.display(),
        ),
    );
    let artifact = fx.write_artifact(
        ArtifactBuilder::new("release-2", DEVICE_TYPE)
            .payload("single-file", vec![("tool.sh", b"x".to_vec())]),
    );

    let err = fx.engine().install(&artifact).unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    assert_eq!(fx.env().get(BOOT_PART).unwrap(), "2");
    assert_eq!(fx.env().get(UPGRADE_AVAILABLE).unwrap(), "0");
}

#[test]
fn commit_detects_firmware_fallback_and_rolls_back() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));
    fx.engine().install(&artifact).unwrap();

    // The firmware gave up on the new bank and reverted boot_part.
    fx.env().set(&[(BOOT_PART, "2")]).unwrap();

    let err = fx.engine().commit(None).unwrap_err();
    assert!(matches!(
        err,
        Error::BootFellBack { artifact_name } if artifact_name == "release-2"
    ));
    let data = fx.store_data();
    assert!(data.in_progress.is_none());
    assert!(!data.provides.contains_key("artifact_name"));
    assert_eq!(fx.env().get(UPGRADE_AVAILABLE).unwrap(), "0");
}

#[test]
fn interrupted_commit_resumes_from_the_reached_point() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));
    fx.engine().install(&artifact).unwrap();

    let stop: HookPoint = "ArtifactCommit".parse().unwrap();
    let outcome = fx.engine().commit(Some(stop)).unwrap();
    assert_eq!(outcome, CommitOutcome::Stopped { before: stop });

    // The record survived with its progress marker.
    let record = fx.store_data().in_progress.unwrap();
    assert_eq!(record.state, UpdateState::ArtifactCommit);
    assert_eq!(record.reached.as_deref(), Some("ArtifactCommit_Enter"));
    assert_eq!(fx.env().get(UPGRADE_AVAILABLE).unwrap(), "1");

    // Rerunning finishes the commit.
    let outcome = fx.engine().commit(None).unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed { .. }));
    assert!(fx.store_data().in_progress.is_none());
    assert_eq!(fx.env().get(UPGRADE_AVAILABLE).unwrap(), "0");
}

#[test]
fn failed_leave_hook_keeps_the_commit_resumable() {
    let fx = Fixture::new();
    let obstruction = fx.path("obstruction");
    let log = fx.path("hooks.log");
    fx.script(
        "single-file",
        &format!(
            r#"echo "$1" >> {log}
case "$1" in
ArtifactCommit_Leave) [ -e {obst} ] && exit 1 ;;
SupportsRollback) echo Yes ;;
esac
exit 0"#,
            log = log.display(),
            obst = obstruction.display(),
        ),
    );
    let artifact = fx.write_artifact(
        ArtifactBuilder::new("release-2", DEVICE_TYPE)
            .payload("single-file", vec![("tool.sh", b"x".to_vec())]),
    );
    fx.engine().install(&artifact).unwrap();

    fs::write(&obstruction, b"").unwrap();
    let err = fx.engine().commit(None).unwrap_err();
    assert!(matches!(err, Error::Module(_)));

    // Marking already happened; the record survives with its progress so
    // a rerun picks up at the leave hooks.
    let data = fx.store_data();
    let record = data.in_progress.as_ref().unwrap();
    assert_eq!(record.reached.as_deref(), Some("ArtifactCommit"));
    assert_eq!(data.provides["artifact_name"], "release-2");
    assert_eq!(fx.env().get(UPGRADE_AVAILABLE).unwrap(), "0");

    fs::remove_file(&obstruction).unwrap();
    let outcome = fx.engine().commit(None).unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed { .. }));
    assert!(fx.store_data().in_progress.is_none());
    // The enter hook ran exactly once across both attempts.
    let hooks = fs::read_to_string(&log).unwrap();
    assert_eq!(hooks.matches("ArtifactCommit_Enter").count(), 1);
}

#[test]
fn rollback_after_an_interrupted_commit_restores_the_original_bank() {
    let fx = Fixture::new();
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));
    fx.engine().install(&artifact).unwrap();

    // Commit got as far as its enter hooks, then the operator changed
    // their mind before the marking step.
    let stop: HookPoint = "ArtifactCommit".parse().unwrap();
    fx.engine().commit(Some(stop)).unwrap();

    fx.engine().rollback().unwrap();

    let env = fx.env();
    assert_eq!(env.get(BOOT_PART).unwrap(), "2");
    assert_eq!(env.get(UPGRADE_AVAILABLE).unwrap(), "0");
    let data = fx.store_data();
    assert!(data.in_progress.is_none());
    assert!(!data.provides.contains_key("artifact_name"));
    // Both environment copies agree after the restore.
    assert_eq!(
        fs::read(fx.path("boot-env/env1/env")).unwrap(),
        fs::read(fx.path("boot-env/env2/env")).unwrap()
    );
}

#[test]
fn commit_reverses_an_install_interrupted_before_the_reboot_point() {
    let fx = Fixture::new();
    // A crash mid-install leaves a pre-reboot record behind.
    let store = StateStore::new(fx.path("state.json"));
    let mut data = StoreData::default();
    data.in_progress = Some(UpdateRecord {
        state: UpdateState::ArtifactInstall,
        artifact_name: "release-2".to_string(),
        artifact_group: None,
        payload_types: vec!["rootfs-image".to_string()],
        provides: Default::default(),
        clears_provides: vec![],
        original_active: Some(Slot::A),
        supports_rollback: true,
        needs_reboot: false,
        reached: None,
    });
    store.save(&data).unwrap();

    let err = fx.engine().commit(None).unwrap_err();
    assert!(matches!(err, Error::InstallInterrupted { .. }));
    assert!(fx.store_data().in_progress.is_none());
}

#[test]
fn script_module_failure_reverses_and_a_retry_succeeds() {
    let fx = Fixture::new();
    let obstruction = fx.path("obstruction");
    let dest = fx.path("installed.sh");
    fx.script(
        "single-file",
        &format!(
            r#"case "$1" in
ArtifactInstall)
    [ -e {obst} ] && exit 1
    cp "$2/tool.sh" {dest}
    ;;
SupportsRollback)
    echo Yes
    ;;
ArtifactRollback)
    rm -f {dest}
    ;;
esac
exit 0"#,
            obst = obstruction.display(),
            dest = dest.display(),
        ),
    );
    let artifact = fx.write_artifact(
        ArtifactBuilder::new("release-2", DEVICE_TYPE)
            .payload("single-file", vec![("tool.sh", b"#!/bin/sh\necho hi\n".to_vec())]),
    );

    fs::write(&obstruction, b"").unwrap();
    let err = fx.engine().install(&artifact).unwrap_err();
    assert!(matches!(err, Error::InstallFailed { .. }));
    assert!(fx.store_data().in_progress.is_none());
    assert!(!dest.exists());
    assert_eq!(fx.env().get(BOOT_PART).unwrap(), "2");

    // Removing the obstruction and retrying reproduces the original
    // result.
    fs::remove_file(&obstruction).unwrap();
    let outcome = fx.engine().install(&artifact).unwrap();
    assert!(!outcome.needs_reboot);
    assert_eq!(
        fs::read(&dest).unwrap(),
        b"#!/bin/sh\necho hi\n".to_vec()
    );
}

#[test]
fn module_exit_ten_marks_the_update_as_needing_reboot() {
    let fx = Fixture::new();
    fx.script(
        "single-file",
        r#"case "$1" in
ArtifactInstall) exit 10 ;;
SupportsRollback) echo Yes ;;
esac
exit 0"#,
    );
    let artifact = fx.write_artifact(
        ArtifactBuilder::new("release-2", DEVICE_TYPE)
            .payload("single-file", vec![("tool.sh", b"x".to_vec())]),
    );
    let outcome = fx.engine().install(&artifact).unwrap();
    assert!(outcome.needs_reboot);
    assert!(fx.store_data().in_progress.unwrap().needs_reboot);
}

#[test]
fn rollback_is_refused_when_a_module_does_not_support_it() {
    let fx = Fixture::new();
    fx.script(
        "single-file",
        r#"[ "$1" = SupportsRollback ] && echo No
exit 0"#,
    );
    let artifact = fx.write_artifact(
        ArtifactBuilder::new("release-2", DEVICE_TYPE)
            .payload("single-file", vec![("tool.sh", b"x".to_vec())]),
    );
    fx.engine().install(&artifact).unwrap();

    let err = fx.engine().rollback().unwrap_err();
    assert!(matches!(
        err,
        Error::RollbackNotSupported { type_name } if type_name == "single-file"
    ));
    // The record is untouched; the operator must commit instead.
    assert!(fx.store_data().in_progress.is_some());
}

#[test]
fn legacy_store_files_migrate_transparently() {
    let fx = Fixture::new();
    fs::write(
        fx.path("state.json"),
        "ArtifactName=release-0\nProvides.rootfs-image.version=v0\n",
    )
    .unwrap();

    let mut out = Vec::new();
    fx.engine().show_provides(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("artifact_name=release-0"));
    assert!(out.contains("rootfs-image.version=v0"));

    // A full cycle on top of the migrated state works and upgrades the
    // file to the current schema.
    let artifact = fx.write_artifact(rootfs_artifact("release-2", b"rootfs v2"));
    fx.engine().install(&artifact).unwrap();
    fx.engine().commit(None).unwrap();
    let data = fx.store_data();
    assert_eq!(data.provides["artifact_name"], "release-2");
}
