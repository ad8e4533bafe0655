//! Command execution nodes and their run options

use crate::llb::state::{Op, Output, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// How a persistent cache mount is shared between concurrent users
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSharing {
    /// Concurrent writers may use the directory at the same time
    #[default]
    Shared,
    /// Writers are serialized
    Locked,
    /// Each concurrent user gets its own copy
    Private,
}

impl fmt::Display for CacheSharing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Locked => write!(f, "locked"),
            Self::Private => write!(f, "private"),
        }
    }
}

/// Network access for an exec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Default,
    None,
    Host,
}

/// A mount attached to an exec
#[derive(Debug, Clone, Serialize)]
pub struct Mount {
    pub dest: String,
    pub kind: MountKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MountKind {
    /// Another state, optionally narrowed to a subpath
    Snapshot {
        input: State,
        selector: Option<String>,
        readonly: bool,
    },
    /// A persistent directory owned by the engine
    Cache { key: String, sharing: CacheSharing },
    Tmpfs,
}

/// A secret exposed to the command as an environment variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretEnv {
    /// Secret identifier in the build session
    pub id: String,
    /// Variable name inside the command
    pub name: String,
}

/// An SSH agent socket forwarded into the command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshForward {
    pub id: String,
    pub target: String,
    pub optional: bool,
}

/// A command to run against a root filesystem
#[derive(Debug, Clone, Serialize)]
pub struct ExecOp {
    pub root: State,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub secret_env: Vec<SecretEnv>,
    pub ssh: Vec<SshForward>,
    pub network: NetworkMode,
    pub ignore_cache: bool,
    #[serde(skip)]
    pub description: Option<String>,
}

impl ExecOp {
    /// All states this exec reads from
    pub fn inputs(&self) -> impl Iterator<Item = &State> {
        std::iter::once(&self.root).chain(self.mounts.iter().filter_map(|m| match &m.kind {
            MountKind::Snapshot { input, .. } => Some(input),
            _ => None,
        }))
    }

    /// Human readable label used in logs and errors
    pub fn label(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| self.args.join(" "))
    }
}

/// Composable options for [`State::run`]
#[derive(Debug, Clone)]
pub enum RunOption {
    Args(Vec<String>),
    Dir(String),
    Env(String, String),
    Mount(Mount),
    Secret(SecretEnv),
    Ssh(SshForward),
    Network(NetworkMode),
    IgnoreCache,
    Description(String),
}

impl RunOption {
    /// Run `script` with `/bin/sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::Args(vec!["/bin/sh".into(), "-c".into(), script.into()])
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self::Dir(path.into())
    }

    pub fn env(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Env(key.into(), value.into())
    }

    pub fn readonly_mount(dest: impl Into<String>, input: State) -> Self {
        Self::Mount(Mount {
            dest: dest.into(),
            kind: MountKind::Snapshot {
                input,
                selector: None,
                readonly: true,
            },
        })
    }

    /// Writable copy of `input` whose changes are discarded
    pub fn writable_copy(dest: impl Into<String>, input: State) -> Self {
        Self::Mount(Mount {
            dest: dest.into(),
            kind: MountKind::Snapshot {
                input,
                selector: None,
                readonly: false,
            },
        })
    }

    /// Read-only mount of a single path inside `input`
    pub fn readonly_selected(dest: impl Into<String>, input: State, selector: impl Into<String>) -> Self {
        Self::Mount(Mount {
            dest: dest.into(),
            kind: MountKind::Snapshot {
                input,
                selector: Some(selector.into()),
                readonly: true,
            },
        })
    }

    pub fn cache_mount(dest: impl Into<String>, key: impl Into<String>, sharing: CacheSharing) -> Self {
        Self::Mount(Mount {
            dest: dest.into(),
            kind: MountKind::Cache {
                key: key.into(),
                sharing,
            },
        })
    }

    pub fn tmpfs(dest: impl Into<String>) -> Self {
        Self::Mount(Mount {
            dest: dest.into(),
            kind: MountKind::Tmpfs,
        })
    }

    pub fn secret_env(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Secret(SecretEnv {
            id: id.into(),
            name: name.into(),
        })
    }

    pub fn ssh(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Ssh(SshForward {
            id: id.into(),
            target: target.into(),
            optional: false,
        })
    }

    pub fn description(text: impl Into<String>) -> Self {
        Self::Description(text.into())
    }
}

/// An exec under construction
#[derive(Debug, Clone)]
pub struct ExecState {
    exec: ExecOp,
}

impl ExecState {
    pub(crate) fn new(root: State, opts: impl IntoIterator<Item = RunOption>) -> Self {
        let mut exec = ExecOp {
            root,
            args: Vec::new(),
            cwd: "/".to_string(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            secret_env: Vec::new(),
            ssh: Vec::new(),
            network: NetworkMode::Default,
            ignore_cache: false,
            description: None,
        };
        for opt in opts {
            match opt {
                RunOption::Args(args) => exec.args = args,
                RunOption::Dir(dir) => exec.cwd = dir,
                RunOption::Env(k, v) => {
                    exec.env.insert(k, v);
                }
                RunOption::Mount(m) => exec.mounts.push(m),
                RunOption::Secret(s) => exec.secret_env.push(s),
                RunOption::Ssh(s) => exec.ssh.push(s),
                RunOption::Network(n) => exec.network = n,
                RunOption::IgnoreCache => exec.ignore_cache = true,
                RunOption::Description(d) => exec.description = Some(d),
            }
        }
        Self { exec }
    }

    /// The root filesystem after the command ran
    pub fn root(self) -> State {
        State::from_op(Op::Exec(Arc::new(self.exec)), Output::Root)
    }

    /// Mount `input` writable at `dest` and select it as the output
    pub fn add_mount(mut self, dest: impl Into<String>, input: State) -> State {
        let index = self.exec.mounts.len();
        self.exec.mounts.push(Mount {
            dest: dest.into(),
            kind: MountKind::Snapshot {
                input,
                selector: None,
                readonly: false,
            },
        });
        State::from_op(Op::Exec(Arc::new(self.exec)), Output::Mount(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llb::Op;

    fn exec_of(state: &State) -> Arc<ExecOp> {
        match &state.node().unwrap().op {
            Op::Exec(e) => e.clone(),
            other => panic!("expected exec, got {:?}", other),
        }
    }

    #[test]
    fn options_accumulate_in_order() {
        let st = State::image("alpine")
            .run([
                RunOption::shell("echo hi"),
                RunOption::dir("/work"),
                RunOption::env("B", "2"),
                RunOption::env("A", "1"),
                RunOption::cache_mount("/cache", "k", CacheSharing::Locked),
                RunOption::secret_env("tok", "TOKEN"),
                RunOption::Network(NetworkMode::None),
            ])
            .root();
        let exec = exec_of(&st);
        assert_eq!(exec.args, vec!["/bin/sh", "-c", "echo hi"]);
        assert_eq!(exec.cwd, "/work");
        assert_eq!(exec.env.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(exec.mounts.len(), 1);
        assert_eq!(exec.secret_env[0].name, "TOKEN");
        assert_eq!(exec.network, NetworkMode::None);
    }

    #[test]
    fn secret_env_records_only_names() {
        let st = State::image("alpine")
            .run([RunOption::shell("true"), RunOption::secret_env("tok", "TOKEN")])
            .root();
        let json = serde_json::to_string(&st).unwrap();
        assert!(json.contains("\"tok\""));
        assert!(json.contains("\"TOKEN\""));
    }

    #[test]
    fn description_does_not_affect_digest() {
        let a = State::image("alpine").run([RunOption::shell("true")]).root();
        let b = State::image("alpine")
            .run([RunOption::shell("true"), RunOption::description("noop")])
            .root();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }
}
