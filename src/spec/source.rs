//! Sources, generators and patches

use crate::spec::BuildStep;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// A named origin of file content
#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    #[serde(flatten)]
    pub kind: SourceKind,

    /// Subpath of the fetched content to use as the source root
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub generate: Vec<Generator>,
}

/// Where the content of a source comes from
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Inline(SourceInline),
    Http(SourceHttp),
    Git(SourceGit),
    DockerImage(SourceDockerImage),
    Context(SourceContext),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceInline {
    File(InlineFile),
    Dir(InlineDir),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InlineFile {
    #[serde(default)]
    pub contents: String,
    #[serde(default = "default_file_mode")]
    pub permissions: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InlineDir {
    #[serde(default)]
    pub files: BTreeMap<String, InlineFile>,
    #[serde(default = "default_dir_mode")]
    pub permissions: u32,
}

fn default_file_mode() -> u32 {
    0o644
}

fn default_dir_mode() -> u32 {
    0o755
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceHttp {
    pub url: String,
    /// Expected content digest, `sha256:<hex>`
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceGit {
    pub url: String,
    pub commit: String,
    #[serde(default)]
    pub keep_git_dir: bool,
    /// Credentials for the repository host, inherited by gomod generators
    #[serde(default)]
    pub auth: GitAuth,
}

/// Secret or agent names for a git host; values never appear in the spec
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitAuth {
    pub header: String,
    pub token: String,
    /// SSH agent id
    pub ssh: String,
}

impl SourceGit {
    /// Host the repository lives on, `host[:port]`
    ///
    /// Handles URLs with a scheme and scp-like `user@host:path` remotes.
    /// Anything else is returned whole.
    pub fn host(&self) -> &str {
        let url = self.url.as_str();
        if let Some((_, rest)) = url.split_once("://") {
            let authority = rest.split('/').next().unwrap_or(rest);
            return authority.rsplit_once('@').map_or(authority, |(_, h)| h);
        }
        match url.split_once(':') {
            Some((user_host, _)) if !user_host.contains('/') => {
                user_host.rsplit_once('@').map_or(user_host, |(_, h)| h)
            }
            _ => url,
        }
    }
}

impl GitAuth {
    /// The equivalent gomod auth; token wins over header, header over ssh
    fn to_gomod(&self) -> Option<GomodGitAuth> {
        if !self.token.is_empty() {
            Some(GomodGitAuth::Token {
                secret: self.token.clone(),
            })
        } else if !self.header.is_empty() {
            Some(GomodGitAuth::Header {
                secret: self.header.clone(),
                shadowed_token: None,
            })
        } else if !self.ssh.is_empty() {
            Some(GomodGitAuth::Ssh(GitAuthSsh {
                id: self.ssh.clone(),
                username: default_ssh_username(),
            }))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceDockerImage {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub cmd: Option<ImageCommand>,
}

/// Commands run inside an image to produce source content
#[derive(Debug, Clone, Deserialize)]
pub struct ImageCommand {
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<BuildStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceContext {
    #[serde(default = "default_context_name")]
    pub name: String,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

fn default_context_name() -> String {
    "context".to_string()
}

/// Dependency generators attached to a source
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawGenerator")]
pub enum Generator {
    Gomod(GomodGenerator),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGenerator {
    #[serde(default)]
    gomod: Option<GomodGenerator>,
}

impl TryFrom<RawGenerator> for Generator {
    type Error = String;

    fn try_from(raw: RawGenerator) -> Result<Self, Self::Error> {
        raw.gomod
            .map(Self::Gomod)
            .ok_or_else(|| "generator must set gomod".to_string())
    }
}

/// Go module dependency fetching for one source
#[derive(Debug, Clone, Deserialize)]
pub struct GomodGenerator {
    /// Module directories relative to the source
    #[serde(default = "default_gomod_paths")]
    pub paths: Vec<String>,

    #[serde(default)]
    pub subpath: String,

    /// `host[:port]` to credentials
    #[serde(default)]
    pub auth: BTreeMap<String, GomodGitAuth>,

    /// `old:new` module replacements applied to go.mod
    #[serde(default)]
    pub replace: Vec<String>,

    /// `module:target@version` requirements applied to go.mod
    #[serde(default)]
    pub require: Vec<String>,
}

impl GomodGenerator {
    pub fn has_edits(&self) -> bool {
        !self.replace.is_empty() || !self.require.is_empty()
    }

    /// `go mod edit` flags for every replace and require entry, in order
    pub fn edit_flags(&self) -> Result<Vec<String>, String> {
        let mut flags = Vec::with_capacity(self.replace.len() + self.require.len());
        for (i, entry) in self.replace.iter().enumerate() {
            let (old, new) = parse_replace(entry)
                .map_err(|e| format!("invalid gomod replace[{}]: {}", i, e))?;
            flags.push(format!("-replace={}={}", old, new));
        }
        for (i, entry) in self.require.iter().enumerate() {
            let target = parse_require(entry)
                .map_err(|e| format!("invalid gomod require[{}]: {}", i, e))?;
            flags.push(format!("-require={}", target));
        }
        Ok(flags)
    }

    /// Add the credentials of the source's own git host unless `host` is
    /// already configured
    fn inherit_auth(&mut self, host: &str, auth: &GitAuth) {
        if self.auth.contains_key(host) {
            return;
        }
        if let Some(gomod) = auth.to_gomod() {
            self.auth.insert(host.to_string(), gomod);
        }
    }
}

/// Split `old:new` on the first colon
fn parse_replace(entry: &str) -> Result<(&str, &str), String> {
    let (old, new) = entry
        .split_once(':')
        .ok_or_else(|| format!("{:?}: expected format old:new", entry))?;
    let (old, new) = (old.trim(), new.trim());
    if old.is_empty() || new.is_empty() {
        return Err(format!("{:?}: entries must be non-empty", entry));
    }
    Ok((old, new))
}

/// Target of `module:target@version`
fn parse_require(entry: &str) -> Result<&str, String> {
    let (module, target) = entry
        .split_once(':')
        .ok_or_else(|| format!("{:?}: expected format module:target@version", entry))?;
    let (module, target) = (module.trim(), target.trim());
    if module.is_empty() || target.is_empty() {
        return Err(format!("{:?}: entries must be non-empty", entry));
    }
    match target.split_once('@') {
        Some((path, version)) if !path.is_empty() && !version.is_empty() => Ok(target),
        _ => Err(format!("{:?}: target must include @version", entry)),
    }
}

fn default_gomod_paths() -> Vec<String> {
    vec![".".to_string()]
}

/// Credentials for one private git host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawGitAuth")]
pub enum GomodGitAuth {
    /// Secret holding a complete `Authorization` header value
    Header {
        secret: String,
        /// A token that was also configured and is ignored
        shadowed_token: Option<String>,
    },
    /// Secret holding a bare access token
    Token { secret: String },
    /// Rewrite https URLs to ssh and use a forwarded agent
    Ssh(GitAuthSsh),
    /// Nothing configured; rejected by validation
    Unset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitAuthSsh {
    /// SSH agent socket identifier in the build session
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_ssh_username")]
    pub username: String,
}

fn default_ssh_username() -> String {
    "git".to_string()
}

/// Agent id used when none is given
pub const DEFAULT_SSH_ID: &str = "default";

impl GitAuthSsh {
    /// Fill an empty id or username with the defaults
    pub fn with_defaults(mut self) -> Self {
        if self.id.is_empty() {
            self.id = DEFAULT_SSH_ID.to_string();
        }
        if self.username.is_empty() {
            self.username = default_ssh_username();
        }
        self
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGitAuth {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    header: Option<String>,
    #[serde(default)]
    ssh: Option<GitAuthSsh>,
}

impl TryFrom<RawGitAuth> for GomodGitAuth {
    type Error = String;

    fn try_from(raw: RawGitAuth) -> Result<Self, Self::Error> {
        let token = raw.token.filter(|t| !t.is_empty());
        let header = raw.header.filter(|h| !h.is_empty());

        if raw.ssh.is_some() && (token.is_some() || header.is_some()) {
            return Err("ssh auth cannot be combined with token or header".to_string());
        }

        Ok(match (header, token, raw.ssh) {
            (Some(secret), shadowed_token, _) => Self::Header {
                secret,
                shadowed_token,
            },
            (None, Some(secret), _) => Self::Token { secret },
            (None, None, Some(ssh)) => Self::Ssh(ssh.with_defaults()),
            (None, None, None) => Self::Unset,
        })
    }
}

impl GomodGitAuth {
    /// Log configurations that parse but are ambiguous
    pub(crate) fn warn_ambiguous(&self, source: &str, host: &str) {
        if let Self::Header {
            shadowed_token: Some(token),
            ..
        } = self
        {
            warn!(
                "source {}: auth for {} sets both header and token; using header, ignoring token secret {}",
                source, host, token
            );
        }
    }
}

/// A patch applied to a source before generators run
#[derive(Debug, Clone, Deserialize)]
pub struct PatchSpec {
    /// Source containing the patch
    pub source: String,
    /// File inside the patch source, required when it is a directory
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub strip: Option<u32>,
}

impl PatchSpec {
    pub fn strip(&self) -> u32 {
        self.strip.unwrap_or(1)
    }
}

impl Source {
    /// Whether the source produces a directory rather than a single file
    pub fn is_dir(&self) -> bool {
        match &self.kind {
            SourceKind::Inline(SourceInline::File(_)) | SourceKind::Http(_) => false,
            SourceKind::Inline(SourceInline::Dir(_))
            | SourceKind::Git(_)
            | SourceKind::DockerImage(_)
            | SourceKind::Context(_) => true,
        }
    }

    pub fn gomod_generators(&self) -> impl Iterator<Item = &GomodGenerator> {
        self.generate.iter().map(|g| match g {
            Generator::Gomod(gomod) => gomod,
        })
    }

    pub fn has_gomod(&self) -> bool {
        self.gomod_generators().next().is_some()
    }

    pub fn gomod_generators_mut(&mut self) -> impl Iterator<Item = &mut GomodGenerator> {
        self.generate.iter_mut().map(|g| match g {
            Generator::Gomod(gomod) => gomod,
        })
    }

    /// Hand a git source's credentials to its gomod generators
    pub(crate) fn fill_defaults(&mut self) {
        let SourceKind::Git(git) = &self.kind else {
            return;
        };
        let host = git.host().to_string();
        let auth = git.auth.clone();
        for gomod in self.gomod_generators_mut() {
            gomod.inherit_auth(&host, &auth);
        }
    }
}
