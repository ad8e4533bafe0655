//! Low-level build graph
//!
//! An immutable, `Arc`-shared description of filesystem states and the
//! commands that produce them. Nothing here executes anything: a `State`
//! is handed to an [`Engine`](crate::engine::Engine) which solves it into a
//! snapshot directory.
//!
//! Every "mutation" returns a new `State`, so graphs can be shared freely
//! between threads and fingerprinted with [`State::digest`].

mod exec;
mod state;

pub use exec::{
    CacheSharing, ExecOp, ExecState, Mount, MountKind, NetworkMode, RunOption, SecretEnv,
    SshForward,
};
pub use state::{FileAction, Node, Op, Output, State};
