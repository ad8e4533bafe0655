//! Error types for Dalec
//!
//! All modules use `DalecResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Dalec operations
pub type DalecResult<T> = Result<T, DalecError>;

/// All errors that can occur in Dalec
#[derive(Error, Debug)]
pub enum DalecError {
    // Environment errors
    #[error("Podman not found. Install podman to execute builds")]
    PodmanNotFound,

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Spec errors
    #[error("Failed to parse spec {path}: {reason}")]
    SpecParse { path: PathBuf, reason: String },

    #[error("Invalid spec:\n  - {}", errors.join("\n  - "))]
    SpecInvalid { errors: Vec<String> },

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Invalid version constraint: {0}")]
    InvalidConstraint(String),

    // Session errors
    #[error("Secret not provided: {0}")]
    SecretNotFound(String),

    #[error("SSH agent socket not available for id: {0}")]
    SshSocketNotFound(String),

    #[error("Build context not provided: {0}")]
    ContextNotFound(String),

    #[error("Build cancelled")]
    Cancelled,

    // Engine errors
    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("{description} failed with exit code {code}: {stderr}")]
    ExecFailed {
        description: String,
        code: i32,
        stderr: String,
    },

    #[error("Digest mismatch for {url}: expected {expected}, got {actual}")]
    DigestMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("HTTP fetch failed: {url}: {reason}")]
    HttpFetch { url: String, reason: String },

    #[error("Failed to create cache volume {name}: {reason}")]
    CacheVolumeCreate { name: String, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl DalecError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::PodmanNotFound => Some("Install podman (https://podman.io) and ensure it is on PATH"),
            Self::UnsupportedPlatform(_) => Some("Builds run on Linux with rootless podman"),
            Self::ConfigInvalid { .. } => Some("Fix the file or recreate it with 'dalec config init --force'"),
            Self::UnknownTarget(_) => Some("Run 'dalec targets' to list supported targets"),
            Self::SecretNotFound(_) => {
                Some("Pass the secret with --secret id=<name>[,env=<VAR>|,src=<file>]")
            }
            Self::SshSocketNotFound(_) => {
                Some("Start an ssh-agent or pass the socket with --ssh <id>=<path>")
            }
            Self::ContextNotFound(_) => Some("Pass the context with --context <name>=<dir>"),
            Self::DigestMismatch { .. } => {
                Some("The upstream file changed; verify it and update the digest in the spec")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_invalid_lists_every_error() {
        let err = DalecError::SpecInvalid {
            errors: vec!["first".to_string(), "second".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("- first"));
        assert!(msg.contains("- second"));
    }

    #[test]
    fn exec_failed_carries_code_and_stderr() {
        let err = DalecError::ExecFailed {
            description: "go mod download".to_string(),
            code: 1,
            stderr: "401 Unauthorized".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "go mod download failed with exit code 1: 401 Unauthorized"
        );
    }

    #[test]
    fn hints_for_session_errors() {
        assert!(DalecError::SecretNotFound("tok".into()).hint().is_some());
        assert!(DalecError::Internal("x".into()).hint().is_none());
    }
}
