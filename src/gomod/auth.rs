//! Git authentication for private go module hosts
//!
//! Produces a shell script that configures git for every host of a gomod
//! generator's `auth` map, plus the run options that make the referenced
//! secrets and SSH agents available. The script only ever names
//! environment variables; secret values are injected by the engine when the
//! download runs and never become part of the graph.

use crate::llb::{RunOption, SecretEnv, SshForward, State};
use crate::spec::GomodGitAuth;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Where the generated script is mounted
pub const SCRIPT_MOUNT: &str = "/tmp/dalec/internal/gomod";
pub const SCRIPT_NAME: &str = "git_auth.sh";
/// Directory holding forwarded agent sockets
pub const SSH_SOCKET_DIR: &str = "/run/dalec/ssh";
pub const GIT_SSH_COMMAND: &str = "ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no";

/// Environment variable a secret is exposed as
///
/// Ids that are already valid variable names keep their spelling under a
/// fixed prefix; anything else is sanitized and suffixed with a digest of
/// the id so distinct ids never share a variable.
pub fn secret_env_name(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    let clean = id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if clean {
        format!("DALEC_SECRET_{}", sanitized)
    } else {
        let digest = hex::encode(Sha256::digest(id.as_bytes()));
        format!("DALEC_SECRET_{}_{}", sanitized, &digest[..8])
    }
}

/// Host without its port, as used in module paths
fn module_host(host: &str) -> &str {
    host.split_once(':').map_or(host, |(h, _)| h)
}

/// Generated git configuration for one auth map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitAuthConfig {
    pub script: String,
    pub secrets: Vec<SecretEnv>,
    pub ssh: Vec<SshForward>,
    /// Hosts exported as `GOPRIVATE`
    pub private_hosts: Vec<String>,
}

/// Render the git configuration script for `auth`, hosts in sorted order
pub fn gitconfig_script(auth: &BTreeMap<String, GomodGitAuth>) -> GitAuthConfig {
    let mut cfg = GitAuthConfig::default();
    if auth.is_empty() {
        return cfg;
    }

    let mut script = String::from("set -eu\n");
    let mut private = BTreeSet::new();
    let mut ssh_ids = BTreeSet::new();

    for (host, method) in auth {
        let gp_host = module_host(host);
        private.insert(gp_host.to_string());
        script.push('\n');

        match method {
            GomodGitAuth::Header { secret, .. } => {
                let var = secret_env_name(secret);
                let _ = writeln!(
                    script,
                    "git config --global http.\"https://{}\".extraheader \"Authorization: ${{{}}}\"",
                    host, var
                );
                cfg.secrets.push(SecretEnv {
                    id: secret.clone(),
                    name: var,
                });
            }
            GomodGitAuth::Token { secret } => {
                let var = secret_env_name(secret);
                let _ = writeln!(
                    script,
                    "tkn=\"$(printf '%s' \"x-access-token:${{{}}}\" | base64 | tr -d '\\n')\"",
                    var
                );
                let _ = writeln!(
                    script,
                    "git config --global http.\"https://{}\".extraheader \"Authorization: basic ${{tkn}}\"",
                    host
                );
                cfg.secrets.push(SecretEnv {
                    id: secret.clone(),
                    name: var,
                });
            }
            GomodGitAuth::Ssh(ssh) => {
                let ssh = ssh.clone().with_defaults();
                let socket = format!("{}/{}.sock", SSH_SOCKET_DIR, ssh.id);
                let _ = writeln!(
                    script,
                    "git config --global url.\"ssh://{}@{}/\".insteadOf https://{}/",
                    ssh.username, host, gp_host
                );
                let _ = writeln!(script, "mkdir -p \"${{HOME}}/.ssh\"");
                let _ = writeln!(
                    script,
                    "printf 'Host %s\\n  IdentityAgent %s\\n' '{}' '{}' >> \"${{HOME}}/.ssh/config\"",
                    gp_host, socket
                );
                if ssh_ids.insert(ssh.id.clone()) {
                    cfg.ssh.push(SshForward {
                        id: ssh.id.clone(),
                        target: socket,
                        optional: false,
                    });
                }
            }
            // Rejected by validation; nothing to configure
            GomodGitAuth::Unset => {}
        }
    }

    cfg.private_hosts = private.into_iter().collect();
    let _ = writeln!(script, "\nexport GOPRIVATE=\"{}\"", cfg.private_hosts.join(","));
    cfg.script = script;
    cfg
}

/// A worker plus the options that authenticate git inside it
#[derive(Debug, Clone)]
pub struct PreparedWorker {
    pub worker: State,
    /// Mount, secret and agent options for the downloading exec
    pub auth_opts: Vec<RunOption>,
    has_auth: bool,
}

impl PreparedWorker {
    /// Prefix `command` with sourcing the auth script when one exists
    pub fn wrap_command(&self, command: &str) -> String {
        if self.has_auth {
            format!(". {}/{}; {}", SCRIPT_MOUNT, SCRIPT_NAME, command)
        } else {
            command.to_string()
        }
    }
}

/// Prepare `worker` to authenticate to every host in `auth`
///
/// An empty map returns the worker untouched with no extra options.
pub fn prepare_auth(worker: &State, auth: &BTreeMap<String, GomodGitAuth>) -> PreparedWorker {
    let cfg = gitconfig_script(auth);
    if cfg.script.is_empty() {
        return PreparedWorker {
            worker: worker.clone(),
            auth_opts: Vec::new(),
            has_auth: false,
        };
    }

    let script_st = State::scratch().mkfile(format!("/{}", SCRIPT_NAME), 0o755, cfg.script);
    let mut opts = vec![
        RunOption::readonly_mount(SCRIPT_MOUNT, script_st),
        RunOption::env("GIT_SSH_COMMAND", GIT_SSH_COMMAND),
    ];
    opts.extend(cfg.secrets.into_iter().map(RunOption::Secret));
    opts.extend(cfg.ssh.into_iter().map(RunOption::Ssh));

    PreparedWorker {
        worker: worker.clone(),
        auth_opts: opts,
        has_auth: true,
    }
}
