//! Repo command - index (and optionally sign) a directory of packages

use crate::cli::args::RepoArgs;
use crate::cli::commands::run_with_progress;
use crate::config::Config;
use crate::error::{DalecError, DalecResult};
use crate::llb::State;
use crate::repo::{create_repo, distro, install_tools, prepare_worker, sign_repo, Distro, DistroFamily};
use crate::session::BuildSession;
use std::path::Path;

const PACKAGES_CONTEXT: &str = "packages";
const SIGNING_KEY_CONTEXT: &str = "signing-key";

/// Key file location split into its directory and file name
fn key_location(path: &Path) -> DalecResult<(&Path, String)> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| DalecError::User(format!("signing key {} is not a file", path.display())))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    Ok((dir, name))
}

/// Graph producing the repository tree
fn repo_state(
    distro: &'static Distro,
    worker: &State,
    key_file: Option<&str>,
    repo_path: &str,
) -> State {
    let pkgs = State::local(PACKAGES_CONTEXT, Vec::new(), Vec::new());
    let mut st = create_repo(distro, pkgs, repo_path)(worker.clone());

    if let Some(file) = key_file {
        let key = State::scratch().copy_from(
            &State::local(SIGNING_KEY_CONTEXT, vec![file.to_string()], Vec::new()),
            format!("/{}", file),
            "/private.key",
        );
        if distro.family == DistroFamily::Rpm {
            st = st.run(install_tools(distro, &["gnupg2"])).root();
        }
        st = sign_repo(distro, key, repo_path)(st);
    }

    State::scratch().copy_from(&st, repo_path, "/")
}

pub async fn execute(args: RepoArgs, config: &Config) -> DalecResult<()> {
    let distro = distro::lookup(&args.target)?;
    if !args.packages.is_dir() {
        return Err(DalecError::PathNotFound(args.packages));
    }

    let worker = prepare_worker(distro, &distro.worker(config.worker_image(distro.key)));
    let mut session = BuildSession::builder().context(PACKAGES_CONTEXT, &args.packages);

    let key_file = match &args.sign_key {
        Some(path) => {
            let (dir, name) = key_location(path)?;
            session = session.context(SIGNING_KEY_CONTEXT, dir);
            Some(name)
        }
        None => None,
    };
    let state = repo_state(distro, &worker, key_file.as_deref(), &args.repo_path);
    let session = session.build().await?;

    run_with_progress(
        config,
        &format!("Creating {} repository", distro.key),
        &state,
        &session,
        &args.output,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llb::{FileAction, Op};

    #[test]
    fn key_location_defaults_to_cwd() {
        let (dir, name) = key_location(Path::new("private.asc")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "private.asc");
        let (dir, _) = key_location(Path::new("/keys/repo.asc")).unwrap();
        assert_eq!(dir, Path::new("/keys"));
    }

    #[test]
    fn signed_repo_is_exported_from_repo_path() {
        let jammy = distro::lookup("jammy").unwrap();
        let out = repo_state(jammy, &State::image("w"), Some("key.asc"), "/opt/repo");
        match &out.node().unwrap().op {
            Op::File {
                action: FileAction::Copy { src, src_path, dest },
                ..
            } => {
                assert_eq!(src_path, "/opt/repo");
                assert_eq!(dest, "/");
                match &src.node().unwrap().op {
                    Op::Exec(exec) => assert_eq!(exec.label(), "sign repository /opt/repo"),
                    other => panic!("expected sign exec, got {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn packages_come_from_local_context() {
        let azl = distro::lookup("azlinux3").unwrap();
        let out = repo_state(azl, &State::image("w"), None, "/opt/repo");
        assert!(out.is_volatile());
    }
}
