//! Build session
//!
//! Everything a single build invocation needs from its environment:
//! secret values, SSH agent sockets, local build contexts and a cancel
//! signal. A session is built once per invocation and passed by reference
//! to the engine; nothing is memoized process-wide.

use crate::error::{DalecError, DalecResult};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// A secret value; never printed
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for handing to a child process environment only
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

/// Where a secret value is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    Env(String),
    File(PathBuf),
}

/// State shared by every node solved for one build
pub struct BuildSession {
    id: Uuid,
    secrets: HashMap<String, Secret>,
    ssh: HashMap<String, PathBuf>,
    contexts: HashMap<String, PathBuf>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl fmt::Debug for BuildSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secrets: Vec<_> = self.secrets.keys().collect();
        secrets.sort();
        f.debug_struct("BuildSession")
            .field("id", &self.id)
            .field("secrets", &secrets)
            .field("ssh", &self.ssh)
            .field("contexts", &self.contexts)
            .finish()
    }
}

impl BuildSession {
    pub fn builder() -> BuildSessionBuilder {
        BuildSessionBuilder::default()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn secret(&self, id: &str) -> DalecResult<&Secret> {
        self.secrets
            .get(id)
            .ok_or_else(|| DalecError::SecretNotFound(id.to_string()))
    }

    pub fn ssh_socket(&self, id: &str) -> DalecResult<&Path> {
        self.ssh
            .get(id)
            .map(PathBuf::as_path)
            .ok_or_else(|| DalecError::SshSocketNotFound(id.to_string()))
    }

    pub fn context(&self, name: &str) -> DalecResult<&Path> {
        self.contexts
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| DalecError::ContextNotFound(name.to_string()))
    }

    /// Ask every in-flight operation to stop
    pub fn cancel(&self) {
        debug!("Cancelling session {}", self.id);
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Fail with `Cancelled` if the session was cancelled
    pub fn check_cancelled(&self) -> DalecResult<()> {
        if self.is_cancelled() {
            Err(DalecError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the session is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // An error means the sender is gone, which only happens on drop
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Default)]
pub struct BuildSessionBuilder {
    secrets: HashMap<String, SecretSource>,
    values: HashMap<String, Secret>,
    ssh: HashMap<String, PathBuf>,
    contexts: HashMap<String, PathBuf>,
}

impl BuildSessionBuilder {
    /// Add a secret read from `source` at build time
    pub fn secret(mut self, id: impl Into<String>, source: SecretSource) -> Self {
        self.secrets.insert(id.into(), source);
        self
    }

    /// Add a secret with a known value
    pub fn secret_value(mut self, id: impl Into<String>, value: Secret) -> Self {
        self.values.insert(id.into(), value);
        self
    }

    pub fn ssh(mut self, id: impl Into<String>, socket: impl Into<PathBuf>) -> Self {
        self.ssh.insert(id.into(), socket.into());
        self
    }

    pub fn context(mut self, name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.contexts.insert(name.into(), dir.into());
        self
    }

    /// Resolve all secret sources and create the session
    pub async fn build(self) -> DalecResult<BuildSession> {
        let mut secrets = self.values;
        for (id, source) in self.secrets {
            let value = match &source {
                SecretSource::Env(var) => std::env::var(var)
                    .map_err(|_| DalecError::SecretNotFound(format!("{} (env {})", id, var)))?,
                SecretSource::File(path) => tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| DalecError::io(format!("reading secret {} from {}", id, path.display()), e))?,
            };
            secrets.insert(id, Secret::new(value));
        }

        for (id, socket) in &self.ssh {
            if !socket.exists() {
                return Err(DalecError::SshSocketNotFound(format!(
                    "{} ({})",
                    id,
                    socket.display()
                )));
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let session = BuildSession {
            id: Uuid::new_v4(),
            secrets,
            ssh: self.ssh,
            contexts: self.contexts,
            cancel_tx,
            cancel_rx,
        };
        debug!("Created build session {}", session.id);
        Ok(session)
    }
}
