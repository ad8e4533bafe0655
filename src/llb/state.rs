//! Filesystem states and graph nodes

use crate::error::DalecResult;
use crate::llb::exec::{ExecOp, ExecState, MountKind, RunOption};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A filesystem state: either empty (scratch) or the output of a node
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct State {
    node: Option<Arc<Node>>,
}

/// A graph node and which of its outputs the state refers to
#[derive(Debug, Serialize)]
pub struct Node {
    pub op: Op,
    pub output: Output,
}

/// Which filesystem of a node is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    /// The root filesystem
    Root,
    /// The writable mount at this index of an exec
    Mount(usize),
}

/// Operations that produce a filesystem
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    Image {
        reference: String,
    },
    Local {
        name: String,
        includes: Vec<String>,
        excludes: Vec<String>,
    },
    Http {
        url: String,
        digest: Option<String>,
        filename: String,
    },
    Git {
        url: String,
        commit: String,
        keep_git_dir: bool,
    },
    File {
        input: State,
        action: FileAction,
    },
    Exec(Arc<ExecOp>),
    Merge {
        inputs: Vec<State>,
    },
}

/// File operations applied on top of an input state
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileAction {
    Mkfile {
        path: String,
        mode: u32,
        data: String,
    },
    Mkdir {
        path: String,
        mode: u32,
    },
    Copy {
        src: State,
        src_path: String,
        dest: String,
    },
}

impl State {
    /// The empty filesystem
    pub fn scratch() -> Self {
        Self { node: None }
    }

    pub(crate) fn from_op(op: Op, output: Output) -> Self {
        Self {
            node: Some(Arc::new(Node { op, output })),
        }
    }

    /// A container image root filesystem
    pub fn image(reference: impl Into<String>) -> Self {
        Self::from_op(
            Op::Image {
                reference: reference.into(),
            },
            Output::Root,
        )
    }

    /// A named local build context
    pub fn local(name: impl Into<String>, includes: Vec<String>, excludes: Vec<String>) -> Self {
        Self::from_op(
            Op::Local {
                name: name.into(),
                includes,
                excludes,
            },
            Output::Root,
        )
    }

    /// A single file downloaded over HTTP(S)
    pub fn http(url: impl Into<String>, digest: Option<String>, filename: impl Into<String>) -> Self {
        Self::from_op(
            Op::Http {
                url: url.into(),
                digest,
                filename: filename.into(),
            },
            Output::Root,
        )
    }

    /// A git checkout at a fixed commit
    pub fn git(url: impl Into<String>, commit: impl Into<String>, keep_git_dir: bool) -> Self {
        Self::from_op(
            Op::Git {
                url: url.into(),
                commit: commit.into(),
                keep_git_dir,
            },
            Output::Root,
        )
    }

    /// Layer several states on top of each other, later ones winning
    pub fn merge(states: Vec<State>) -> Self {
        let mut inputs: Vec<State> = states.into_iter().filter(|s| !s.is_scratch()).collect();
        match inputs.len() {
            0 => Self::scratch(),
            1 => inputs.remove(0),
            _ => Self::from_op(Op::Merge { inputs }, Output::Root),
        }
    }

    pub fn is_scratch(&self) -> bool {
        self.node.is_none()
    }

    pub fn node(&self) -> Option<&Node> {
        self.node.as_deref()
    }

    fn file(&self, action: FileAction) -> Self {
        Self::from_op(
            Op::File {
                input: self.clone(),
                action,
            },
            Output::Root,
        )
    }

    /// Write a file with the given contents
    pub fn mkfile(&self, path: impl Into<String>, mode: u32, data: impl Into<String>) -> Self {
        self.file(FileAction::Mkfile {
            path: path.into(),
            mode,
            data: data.into(),
        })
    }

    /// Create a directory, including parents
    pub fn mkdir(&self, path: impl Into<String>, mode: u32) -> Self {
        self.file(FileAction::Mkdir {
            path: path.into(),
            mode,
        })
    }

    /// Copy `src_path` out of `src` to `dest` in this state
    pub fn copy_from(&self, src: &State, src_path: impl Into<String>, dest: impl Into<String>) -> Self {
        self.file(FileAction::Copy {
            src: src.clone(),
            src_path: src_path.into(),
            dest: dest.into(),
        })
    }

    /// Start describing a command executed with this state as root
    pub fn run(&self, opts: impl IntoIterator<Item = RunOption>) -> ExecState {
        ExecState::new(self.clone(), opts)
    }

    /// Content fingerprint of the whole subgraph
    pub fn digest(&self) -> DalecResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
    }

    /// Image the root filesystem of this state descends from, if any
    pub fn base_image(&self) -> Option<&str> {
        let node = self.node()?;
        match &node.op {
            Op::Image { reference } => Some(reference),
            Op::File { input, .. } => input.base_image(),
            Op::Exec(exec) => match node.output {
                Output::Root => exec.root.base_image(),
                Output::Mount(index) => match &exec.mounts.get(index)?.kind {
                    MountKind::Snapshot { input, .. } => input.base_image(),
                    _ => None,
                },
            },
            Op::Merge { inputs } => inputs.first().and_then(State::base_image),
            Op::Local { .. } | Op::Http { .. } | Op::Git { .. } => None,
        }
    }

    /// Whether this state, or anything it depends on, must re-execute every build
    pub fn is_volatile(&self) -> bool {
        let Some(node) = self.node() else {
            return false;
        };
        match &node.op {
            // Local contexts are re-read every session
            Op::Local { .. } => true,
            Op::Image { .. } | Op::Http { .. } | Op::Git { .. } => false,
            Op::File { input, action } => {
                input.is_volatile()
                    || matches!(action, FileAction::Copy { src, .. } if src.is_volatile())
            }
            Op::Exec(exec) => exec.ignore_cache || exec.inputs().any(State::is_volatile),
            Op::Merge { inputs } => inputs.iter().any(State::is_volatile),
        }
    }
}
