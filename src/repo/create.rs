//! Local package repositories and their signatures
//!
//! Both operations return a [`StateTransform`] that is applied to a worker
//! state, so callers can chain them:
//!
//! ```ignore
//! let worker = sign_repo(distro, key, "/opt/repo")(create_repo(distro, pkgs, "/opt/repo")(worker));
//! ```

use crate::llb::{RunOption, State};
use crate::repo::distro::{Distro, DistroFamily, PackageManager};
use crate::repo::install::install_tools;
use sha2::{Digest, Sha256};

/// A function from one worker state to the next
pub type StateTransform = Box<dyn Fn(State) -> State + Send + Sync>;

const PKG_MOUNT: &str = "/tmp/dalec/repo-packages";
const GPG_MOUNT: &str = "/tmp/dalec/gpg";
const SIGN_SCRIPT_MOUNT: &str = "/tmp/dalec/sign-repo.sh";

/// Short stable suffix derived from the repository path
fn repo_suffix(repo_path: &str) -> String {
    hex::encode(Sha256::digest(repo_path.as_bytes()))[..8].to_string()
}

fn tools_installed(distro: &Distro, tools: &[&str], st: State) -> State {
    st.run(install_tools(distro, tools)).root()
}

fn rpm_repo_file(suffix: &str, repo_path: &str) -> String {
    format!(
        "[local-{suffix}]\nname=Local Repository\nbaseurl=file://{repo_path}\ngpgcheck=0\npriority=0\nenabled=1\nmetadata_expire=0\n"
    )
}

/// Install a tree of built packages as a repository inside the worker
///
/// rpm trees are expected to contain `RPMS/<arch>/*.rpm` and `SRPMS/*`;
/// deb trees are flat directories of `.deb` files.
pub fn create_repo(distro: &'static Distro, pkgs: State, repo_path: impl Into<String>) -> StateTransform {
    let repo_path = repo_path.into();
    let suffix = repo_suffix(&repo_path);

    match distro.family {
        DistroFamily::Rpm => Box::new(move |st: State| {
            let st = tools_installed(distro, &["createrepo"], st)
                .mkdir(format!("{}/RPMS", repo_path), 0o755)
                .mkdir(format!("{}/SRPMS", repo_path), 0o755)
                .mkfile(
                    format!("/etc/yum.repos.d/local-{}.repo", suffix),
                    0o644,
                    rpm_repo_file(&suffix, &repo_path),
                );
            st.run([
                RunOption::shell(format!(
                    "set -e; cp {pkg}/RPMS/$(uname -m)/* {repo}/RPMS/; if [ -d {pkg}/SRPMS ]; then cp {pkg}/SRPMS/* {repo}/SRPMS/; fi; createrepo --compatibility {repo}",
                    pkg = PKG_MOUNT,
                    repo = repo_path
                )),
                RunOption::readonly_mount(PKG_MOUNT, pkgs.clone()),
                RunOption::description(format!("create local repository {}", repo_path)),
            ])
            .root()
        }),
        DistroFamily::Deb => Box::new(move |st: State| {
            let st = tools_installed(distro, &["apt-utils", "gnupg2"], st)
                .copy_from(&pkgs, "/", repo_path.clone());
            st.run([
                RunOption::shell("set -e; apt-ftparchive packages . > Packages; apt-ftparchive release . > Release"),
                RunOption::dir(repo_path.clone()),
                RunOption::description(format!("create local repository {}", repo_path)),
            ])
            .root()
            .mkfile(
                format!("/etc/apt/sources.list.d/dalec-local-{}.list", suffix),
                0o644,
                format!("deb [trusted=yes] copy:{}/ /\n", repo_path.trim_end_matches('/')),
            )
        }),
    }
}

const GPG_KEY_ID: &str =
    "ID=$(gpg --list-secret-keys --with-colons | awk -F: '/^sec/ { print $5; exit }')";

fn sign_script(distro: &Distro, repo_path: &str) -> String {
    let import = format!("set -eux\ngpg --batch --import < {}/private.key\n{}\n", GPG_MOUNT, GPG_KEY_ID);
    match (distro.family, distro.package_manager) {
        (DistroFamily::Deb, _) => format!(
            "{import}gpg --batch --yes --default-key \"$ID\" -abs -o {repo}/Release.gpg {repo}/Release\n\
             gpg --batch --yes --default-key \"$ID\" --clearsign -o {repo}/InRelease {repo}/Release\n",
            repo = repo_path
        ),
        // dnf verifies package signatures too, tdnf only the metadata
        (DistroFamily::Rpm, pm) => {
            let packages = if pm == PackageManager::Dnf {
                format!(
                    "command -v rpmsign >/dev/null || dnf install -y rpm-sign\n\
                     echo \"%_gpg_name $ID\" > ~/.rpmmacros\n\
                     find {repo}/RPMS -name '*.rpm' -exec rpmsign --addsign {{}} \\;\n",
                    repo = repo_path
                )
            } else {
                String::new()
            };
            format!(
                "{import}{packages}rm -rf {repo}/repodata\ncreaterepo --compatibility {repo}\n\
                 gpg --batch --detach-sign --default-key \"$ID\" --armor --yes {repo}/repodata/repomd.xml\n",
                repo = repo_path
            )
        }
    }
}

/// Sign the repository at `repo_path` with the key in `key`
///
/// `key` must hold the armored secret key at `/private.key`.
pub fn sign_repo(distro: &'static Distro, key: State, repo_path: impl Into<String>) -> StateTransform {
    let repo_path = repo_path.into();
    let script = State::scratch().mkfile("/sign-repo.sh", 0o755, sign_script(distro, &repo_path));

    Box::new(move |st: State| {
        st.run([
            RunOption::Args(vec!["/bin/sh".into(), SIGN_SCRIPT_MOUNT.into()]),
            RunOption::readonly_selected(SIGN_SCRIPT_MOUNT, script.clone(), "/sign-repo.sh"),
            RunOption::readonly_mount(GPG_MOUNT, key.clone()),
            RunOption::description(format!("sign repository {}", repo_path)),
        ])
        .root()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llb::{ExecOp, FileAction, Op};
    use crate::repo::distro::lookup;
    use std::sync::Arc;

    fn exec_of(state: &State) -> Arc<ExecOp> {
        match &state.node().unwrap().op {
            Op::Exec(e) => e.clone(),
            other => panic!("expected exec, got {:?}", other),
        }
    }

    fn script_of(exec: &ExecOp) -> String {
        let input = exec
            .mounts
            .iter()
            .find(|m| m.dest == SIGN_SCRIPT_MOUNT)
            .map(|m| match &m.kind {
                crate::llb::MountKind::Snapshot { input, .. } => input.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .unwrap();
        match &input.node().unwrap().op {
            Op::File {
                action: FileAction::Mkfile { data, .. },
                ..
            } => data.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rpm_repo_indexes_and_registers() {
        let azl = lookup("azlinux3").unwrap();
        let out = create_repo(azl, State::image("pkgs"), "/opt/repo")(State::image("w"));
        let exec = exec_of(&out);
        assert!(exec.args[2].ends_with("createrepo --compatibility /opt/repo"));

        // The repo file sits below the copy exec
        let suffix = repo_suffix("/opt/repo");
        match &exec.root.node().unwrap().op {
            Op::File {
                action: FileAction::Mkfile { path, data, .. },
                ..
            } => {
                assert_eq!(path, &format!("/etc/yum.repos.d/local-{}.repo", suffix));
                assert!(data.contains("baseurl=file:///opt/repo"));
                assert!(data.contains("gpgcheck=0"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn deb_repo_writes_sources_list() {
        let jammy = lookup("jammy").unwrap();
        let out = create_repo(jammy, State::image("pkgs"), "/opt/repo/")(State::image("w"));
        match &out.node().unwrap().op {
            Op::File {
                input,
                action: FileAction::Mkfile { path, data, .. },
            } => {
                assert!(path.starts_with("/etc/apt/sources.list.d/dalec-local-"));
                assert_eq!(data, "deb [trusted=yes] copy:/opt/repo/ /\n");
                let exec = exec_of(input);
                assert!(exec.args[2].contains("apt-ftparchive packages . > Packages"));
                assert_eq!(exec.cwd, "/opt/repo/");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn suffix_depends_on_path() {
        assert_eq!(repo_suffix("/opt/repo").len(), 8);
        assert_ne!(repo_suffix("/opt/repo"), repo_suffix("/opt/other"));
    }

    #[test]
    fn tdnf_signs_metadata_only() {
        let azl = lookup("azlinux3").unwrap();
        let exec = exec_of(&sign_repo(azl, State::image("key"), "/opt/repo")(State::image("w")));
        let script = script_of(&exec);
        assert!(script.contains("--detach-sign"));
        assert!(script.contains("/opt/repo/repodata/repomd.xml"));
        assert!(!script.contains("rpmsign"));
        assert!(exec.mounts.iter().any(|m| m.dest == GPG_MOUNT));
    }

    #[test]
    fn dnf_also_signs_packages() {
        let alma = lookup("almalinux9").unwrap();
        let exec = exec_of(&sign_repo(alma, State::image("key"), "/opt/repo")(State::image("w")));
        let script = script_of(&exec);
        assert!(script.contains("rpmsign --addsign"));
        assert!(script.contains("repomd.xml"));
    }

    #[test]
    fn deb_signs_release() {
        let noble = lookup("noble").unwrap();
        let exec = exec_of(&sign_repo(noble, State::image("key"), "/opt/repo")(State::image("w")));
        let script = script_of(&exec);
        assert!(script.contains("-o /opt/repo/Release.gpg /opt/repo/Release"));
        assert!(script.contains("--clearsign -o /opt/repo/InRelease"));
    }
}
