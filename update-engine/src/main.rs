//! CLI entry point: thin dispatch over the engine's operations.
//!
//! `install <path>` validates an artifact and writes it to the passive
//! bank; `commit` confirms the new bank after reboot; `rollback` undoes an
//! uncommitted update; `show-provides` prints the committed provides map.

use std::{borrow::Cow, path::Path, path::PathBuf};

use clap::{Parser, Subcommand};
use eyre::WrapErr as _;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ab_update_engine::{
    modules::HookPoint, Args, CommitOutcome, Engine, InstallOutcome, Settings,
};

mod engine_result;
use engine_result::EngineResult;

const CFG_DEFAULT_PATH: &str = "/etc/ab-update-engine.conf";
const ENV_VAR_PREFIX: &str = "AB_UPDATE_";
const CFG_ENV_VAR: &str = "AB_UPDATE_CONFIG";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    args: Args,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate an artifact and install it onto the passive bank.
    Install {
        /// Path of the artifact container.
        path: PathBuf,
    },
    /// Confirm the in-flight update and merge its provides.
    Commit {
        /// Stop in front of the named hook point (e.g.
        /// `ArtifactCommit_Enter`), leaving the update resumable.
        #[arg(long)]
        stop_before: Option<HookPoint>,
    },
    /// Undo the in-flight update and boot the original bank again.
    Rollback,
    /// Print the committed provides map as `key=value` lines.
    ShowProvides,
}

fn main() -> EngineResult {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => EngineResult::Success,
        Err(err) => {
            error!("{err:?}");
            err.into()
        }
    }
}

fn get_config_source(args: &Args) -> Cow<'_, Path> {
    if let Some(config) = &args.config {
        info!("using config provided by command line argument: `{config}`");
        Cow::Borrowed(config.as_ref())
    } else if let Some(config) = figment::providers::Env::var(CFG_ENV_VAR) {
        info!("using config set in environment variable `{CFG_ENV_VAR}={config}`");
        Cow::Owned(PathBuf::from(config))
    } else {
        info!("using default config at `{CFG_DEFAULT_PATH}`");
        Cow::Borrowed(CFG_DEFAULT_PATH.as_ref())
    }
}

fn run(cli: &Cli) -> eyre::Result<()> {
    let config = get_config_source(&cli.args);
    let settings = Settings::get(&cli.args, &config, ENV_VAR_PREFIX)
        .wrap_err("failed reading settings")?;
    let engine = Engine::new(settings);

    match &cli.command {
        Command::Install { path } => {
            let InstallOutcome {
                artifact_name,
                needs_reboot,
            } = engine.install(path).wrap_err("install failed")?;
            if needs_reboot {
                println!("installed `{artifact_name}`; reboot, then run `commit`");
            } else {
                println!("installed `{artifact_name}`; run `commit` to finish");
            }
        }
        Command::Commit { stop_before } => {
            match engine.commit(*stop_before).wrap_err("commit failed")? {
                CommitOutcome::Committed { artifact_name } => {
                    println!("committed `{artifact_name}`");
                }
                CommitOutcome::Stopped { before } => {
                    println!("stopped before `{before}`; rerun `commit` to resume");
                }
            }
        }
        Command::Rollback => {
            engine.rollback().wrap_err("rollback failed")?;
            println!("rolled back");
        }
        Command::ShowProvides => {
            let mut stdout = std::io::stdout().lock();
            engine
                .show_provides(&mut stdout)
                .wrap_err("failed reading provides")?;
        }
    }
    Ok(())
}
