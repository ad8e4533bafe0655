//! Build graph execution
//!
//! An [`Engine`] turns a [`State`] into a directory on the host. The only
//! backend is rootless Podman on Linux.

mod podman;
mod snapshot;

pub use podman::PodmanEngine;
pub use snapshot::{Snapshot, SnapshotStore};

use crate::cache::CacheVolume;
use crate::config::Config;
use crate::error::{DalecError, DalecResult};
use crate::llb::State;
use crate::session::BuildSession;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Callback receiving command output lines as they are produced
pub type ProgressFn = Arc<dyn Fn(String) + Send + Sync>;

/// Executes build graphs
#[async_trait]
pub trait Engine: Send + Sync {
    /// Check that the backend can run builds
    async fn ensure_ready(&self) -> DalecResult<()>;

    /// Solve `state` and return its snapshot
    async fn solve(&self, state: &State, session: &BuildSession) -> DalecResult<Snapshot>;

    /// Copy a snapshot's contents into `dest` on the host
    async fn export(&self, snapshot: &Snapshot, dest: &Path) -> DalecResult<()>;

    /// Persistent cache volumes owned by dalec
    async fn cache_volumes(&self) -> DalecResult<Vec<CacheVolume>>;

    async fn remove_cache_volume(&self, name: &str) -> DalecResult<()>;

    /// Drop everything solved only for `session`
    async fn end_session(&self, session: &BuildSession) -> DalecResult<()>;

    /// Human-readable backend name
    fn name(&self) -> &'static str;
}

/// Create the engine for the current platform
pub fn create_engine(config: &Config, progress: Option<ProgressFn>) -> DalecResult<Box<dyn Engine>> {
    match std::env::consts::OS {
        "linux" => {
            let engine = PodmanEngine::from_config(config);
            Ok(Box::new(match progress {
                Some(progress) => engine.with_progress(progress),
                None => engine,
            }))
        }
        other => Err(DalecError::UnsupportedPlatform(other.to_string())),
    }
}

/// Max number of output lines included in exec errors
const ERROR_TAIL_LINES: usize = 50;

/// Last lines of a command's output for error messages
pub(crate) fn error_tail(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(ERROR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Stream stdout and stderr of a child, calling `on_output` for each line
///
/// Returns all lines for error reporting.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> Vec<String> {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Vec::new();
    };

    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_reader = BufReader::new(stdout).lines();

    let mut all_output = Vec::new();
    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    _ => stderr_done = true,
                }
            }
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        on_output(line.clone());
                        all_output.push(line);
                    }
                    _ => stdout_done = true,
                }
            }
        }
    }

    all_output
}
