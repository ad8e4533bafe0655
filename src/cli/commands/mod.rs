//! CLI command implementations

pub mod build;
pub mod cache;
pub mod config;
pub mod deps;
pub mod repo;
pub mod resolve;
pub mod targets;
pub mod validate;

pub use build::execute as build;
pub use cache::execute as cache;
pub use config::execute as config;
pub use deps::execute as deps;
pub use repo::execute as repo;
pub use resolve::execute as resolve;
pub use targets::execute as targets;
pub use validate::execute as validate;

use crate::cli::args::SessionArgs;
use crate::cli::progress::BuildProgress;
use crate::config::Config;
use crate::engine::{create_engine, Engine};
use crate::error::{DalecError, DalecResult};
use crate::llb::State;
use crate::session::{BuildSession, SecretSource};
use crate::spec::{GomodGitAuth, Spec};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the context used when `--context` does not provide one
const DEFAULT_CONTEXT: &str = "context";

/// Load a spec, substitute build args, fill defaults and validate
pub(crate) async fn load_spec(path: &Path, build_args: &[(String, String)]) -> DalecResult<Spec> {
    let mut spec = Spec::load(path).await?;
    spec.substitute_args(build_args)?;
    spec.fill_defaults();
    spec.validate()?;
    Ok(spec)
}

/// Secret ids and SSH ids referenced by gomod auth
fn auth_requirements(spec: &Spec) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut secrets = BTreeSet::new();
    let mut ssh = BTreeSet::new();
    for src in spec.sources.values() {
        for auth in src.gomod_generators().flat_map(|g| g.auth.values()) {
            match auth {
                GomodGitAuth::Header { secret, .. } | GomodGitAuth::Token { secret } => {
                    secrets.insert(secret.clone());
                }
                GomodGitAuth::Ssh(s) => {
                    ssh.insert(s.id.clone());
                }
                GomodGitAuth::Unset => {}
            }
        }
    }
    (secrets, ssh)
}

/// Create the build session from command line inputs
///
/// Secrets the spec references but the command line does not provide fall
/// back to the environment variable of the same name, SSH ids to
/// `$SSH_AUTH_SOCK`, when those are set.
pub(crate) async fn build_session(args: SessionArgs, spec: &Spec) -> DalecResult<BuildSession> {
    let agent = std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from);
    let (needed_secrets, needed_ssh) = auth_requirements(spec);
    let mut builder = BuildSession::builder();

    let given: BTreeSet<String> = args.secrets.iter().map(|(id, _)| id.clone()).collect();
    for (id, source) in args.secrets {
        builder = builder.secret(id, source);
    }
    for id in needed_secrets.difference(&given) {
        if std::env::var_os(id).is_some() {
            debug!("Using environment variable {} for secret {}", id, id);
            builder = builder.secret(id.clone(), SecretSource::Env(id.clone()));
        }
    }

    let given: BTreeSet<String> = args.ssh.iter().map(|(id, _)| id.clone()).collect();
    for (id, socket) in args.ssh {
        let socket = socket
            .or_else(|| agent.clone())
            .ok_or_else(|| DalecError::SshSocketNotFound(id.clone()))?;
        builder = builder.ssh(id, socket);
    }
    if let Some(agent) = &agent {
        for id in needed_ssh.difference(&given) {
            debug!("Using $SSH_AUTH_SOCK for ssh id {}", id);
            builder = builder.ssh(id.clone(), agent.clone());
        }
    }

    let has_default = args.contexts.iter().any(|(name, _)| name == DEFAULT_CONTEXT);
    for (name, dir) in args.contexts {
        builder = builder.context(name, dir);
    }
    if !has_default {
        let cwd = std::env::current_dir().map_err(|e| DalecError::io("getting current directory", e))?;
        builder = builder.context(DEFAULT_CONTEXT, cwd);
    }

    builder.build().await
}

/// Solve `state` and copy the result into `dest`, stopping on Ctrl-C
pub(crate) async fn solve_and_export(
    engine: &dyn Engine,
    state: &State,
    session: &BuildSession,
    dest: &Path,
) -> DalecResult<()> {
    engine.ensure_ready().await?;

    let result = async {
        let solve = engine.solve(state, session);
        tokio::pin!(solve);
        let snapshot = tokio::select! {
            res = &mut solve => res?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping build");
                session.cancel();
                solve.await?
            }
        };
        engine.export(&snapshot, dest).await
    }
    .await;

    if let Err(e) = engine.end_session(session).await {
        warn!("Failed to clean up session {}: {}", session.id(), e);
    }
    result
}

/// Run a solve behind a spinner on the configured engine
pub(crate) async fn run_with_progress(
    config: &Config,
    label: &str,
    state: &State,
    session: &BuildSession,
    dest: &Path,
) -> DalecResult<()> {
    let progress = BuildProgress::new(label);
    let engine = create_engine(config, Some(progress.progress_fn()))?;
    debug!("Using {} engine", engine.name());

    match solve_and_export(&*engine, state, session, dest).await {
        Ok(()) => {
            progress.finish(&format!("Exported to {}", dest.display()));
            Ok(())
        }
        Err(e) => {
            progress.fail();
            Err(e)
        }
    }
}
