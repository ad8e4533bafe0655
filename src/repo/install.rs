//! Package installation inside worker images

use crate::error::DalecResult;
use crate::llb::{RunOption, State};
use crate::repo::constraint::format_dependency;
use crate::repo::distro::{Distro, DistroFamily, PackageManager};
use crate::source::{mount_source, source_state};
use crate::spec::{PackageConstraints, PackageRepositoryConfig, RepoEnv, Spec};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::debug;

const IMPORT_KEYS_MOUNT: &str = "/tmp/dalec/import-keys.sh";

/// Packages every worker needs to patch and fetch sources
const WORKER_TOOLS: &[&str] = &["patch", "git", "ca-certificates"];

/// Shell command installing the packages passed as positional arguments
fn install_command(distro: &Distro) -> String {
    match distro.package_manager {
        PackageManager::Tdnf | PackageManager::Dnf => {
            let exe = distro.package_manager.binary();
            format!(
                "set -ex; {exe} makecache -y; exec {exe} install -y --refresh --releasever={} --setopt=tsflags=nodocs \"$@\"",
                distro.release_ver
            )
        }
        // `satisfy` understands full relation strings with version ranges
        PackageManager::Apt => "set -ex; apt-get update; exec apt-get satisfy -y --no-install-recommends \"$@\"".to_string(),
    }
}

/// gpg import script for rpm repo keys mounted under the key root
fn import_keys_script(key_root: &str, names: &[&str]) -> String {
    let mut script = String::from("set -eux\n");
    for name in names {
        let _ = writeln!(script, "gpg --import {}/{}", key_root, name);
    }
    script
}

/// Mounts and a key import prefix for the extra repositories
fn repo_options(distro: &Distro, repos: &[&PackageRepositoryConfig]) -> DalecResult<(Vec<RunOption>, Option<String>)> {
    let platform = distro.repo_platform();
    let mut opts = Vec::new();
    let mut key_names = Vec::new();

    for repo in repos {
        for (name, src) in &repo.keys {
            let st = source_state(name, src)?;
            opts.push(mount_source(format!("{}/{}", platform.key_root, name), name, src, st));
            key_names.push(name.as_str());
        }
        for (name, src) in &repo.config {
            let file = if name.ends_with(platform.config_ext) {
                name.clone()
            } else {
                format!("{}{}", name, platform.config_ext)
            };
            let st = source_state(name, src)?;
            opts.push(mount_source(format!("{}/{}", platform.config_root, file), name, src, st));
        }
        for (i, data) in repo.data.iter().enumerate() {
            let name = format!("repo-data-{}", i);
            let st = source_state(&name, &data.spec)?;
            opts.push(mount_source(data.dest.clone(), &name, &data.spec, st));
        }
    }

    // apt reads keys through signed-by; rpm tools need them imported
    if key_names.is_empty() || distro.family == DistroFamily::Deb {
        return Ok((opts, None));
    }
    let script = State::scratch().mkfile("/import-keys.sh", 0o755, import_keys_script(platform.key_root, &key_names));
    opts.push(RunOption::readonly_selected(IMPORT_KEYS_MOUNT, script, "/import-keys.sh"));
    Ok((opts, Some(format!("{}; ", IMPORT_KEYS_MOUNT))))
}

fn install_args(distro: &Distro, prefix: Option<String>, packages: Vec<String>) -> Vec<RunOption> {
    let script = format!("{}{}", prefix.unwrap_or_default(), install_command(distro));
    let mut args = vec!["/bin/sh".to_string(), "-c".to_string(), script, "-".to_string()];
    args.extend(packages);

    let mut opts = vec![RunOption::Args(args), distro.package_cache()];
    if distro.family == DistroFamily::Deb {
        opts.push(RunOption::env("DEBIAN_FRONTEND", "noninteractive"));
    }
    opts
}

/// Run options installing `deps` with the distro's package manager
///
/// Constraints are rendered in the family's native syntax. Extra
/// repositories are mounted for the duration of the install only.
pub fn install_packages(
    distro: &Distro,
    deps: &BTreeMap<String, PackageConstraints>,
    repos: &[&PackageRepositoryConfig],
) -> DalecResult<Vec<RunOption>> {
    let mut packages = Vec::new();
    for (name, constraints) in deps {
        packages.extend(format_dependency(distro.family, name, constraints)?);
    }
    debug!("Installing on {}: {:?}", distro.key, packages);

    let (mut opts, prefix) = repo_options(distro, repos)?;
    opts.extend(install_args(distro, prefix, packages));
    Ok(opts)
}

/// Run options installing unconstrained tool packages
pub fn install_tools(distro: &Distro, tools: &[&str]) -> Vec<RunOption> {
    let mut opts = install_args(distro, None, tools.iter().map(|t| t.to_string()).collect());
    opts.push(RunOption::description(format!("install {}", tools.join(" "))));
    opts
}

/// Install the tools needed to patch and fetch sources
pub fn prepare_worker(distro: &Distro, worker: &State) -> State {
    let ssh = match distro.family {
        DistroFamily::Rpm => "openssh-clients",
        DistroFamily::Deb => "openssh-client",
    };
    let mut tools = WORKER_TOOLS.to_vec();
    tools.push(ssh);

    let mut opts = install_tools(distro, &tools);
    opts.push(RunOption::description(format!("prepare {} worker", distro.key)));
    worker.run(opts).root()
}

/// Install the spec's build dependencies for `distro` into `worker`
pub fn install_build_deps(spec: &Spec, distro: &Distro, worker: &State) -> DalecResult<State> {
    let deps = spec.build_deps(distro.key);
    if deps.is_empty() {
        return Ok(worker.clone());
    }
    let repos = spec.extra_repos(distro.key, RepoEnv::Build);
    let mut opts = install_packages(distro, &deps, &repos)?;
    opts.push(RunOption::description(format!("install build dependencies for {}", distro.key)));
    Ok(worker.run(opts).root())
}
