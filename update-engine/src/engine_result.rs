use std::process::{ExitCode, Termination};

use ab_update_engine::engine::Error;
use ab_update_engine_core::artifact;

/// Exit codes returned by the update engine. Custom exit codes are taken in accordance with the
/// Linux Standard Base Core Specification and are in the range 150-199.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EngineResult {
    Success = 0,
    Failure = 1,
    NothingToDo = 2,
    VerificationFailed = 150,
    EnvironmentFailed = 151,
}

impl Termination for EngineResult {
    fn report(self) -> ExitCode {
        ExitCode::from(self as u8)
    }
}

impl From<eyre::Report> for EngineResult {
    fn from(err: eyre::Report) -> Self {
        use EngineResult::{EnvironmentFailed, Failure, NothingToDo, VerificationFailed};
        match err.downcast::<Error>() {
            // An unreadable artifact file is an I/O problem, not failed
            // verification; only content rejections map to 150.
            Ok(Error::Artifact(
                artifact::Error::Open { .. } | artifact::Error::Io(_),
            )) => Failure,
            Ok(Error::Artifact(_) | Error::KeyLoad(_)) => VerificationFailed,
            Ok(Error::Environment(_)) => EnvironmentFailed,
            Ok(Error::NothingToDo) => NothingToDo,
            _ => Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use ab_update_engine_core::checksum::CheckError;

    use super::*;

    fn result_of(err: Error) -> EngineResult {
        eyre::Report::new(err).into()
    }

    #[test]
    fn integrity_rejections_exit_with_the_verification_code() {
        let err = Error::Artifact(artifact::Error::HeaderIntegrity(
            CheckError::Missing("header.tar.gz".to_string()),
        ));
        assert_eq!(result_of(err), EngineResult::VerificationFailed);
    }

    #[test]
    fn unreadable_artifact_files_exit_as_plain_failures() {
        let err = Error::Artifact(artifact::Error::Open {
            path: "/no/such/release.ab".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        });
        assert_eq!(result_of(err), EngineResult::Failure);
    }

    #[test]
    fn nothing_to_do_keeps_its_own_exit_code() {
        assert_eq!(result_of(Error::NothingToDo), EngineResult::NothingToDo);
    }
}
