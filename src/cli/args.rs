//! CLI argument definitions using clap derive

use crate::session::SecretSource;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Dalec - declarative package builds
///
/// Builds packages from a YAML spec inside rootless containers, with
/// reproducible go module fetching and distro-namespaced build caches.
#[derive(Parser, Debug)]
#[command(name = "dalec")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "DALEC_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a spec and report every validation error
    Validate(ValidateArgs),

    /// Fetch the go modules of a spec and export the module tree
    Deps(DepsArgs),

    /// Build a spec for a target and export the build output
    Build(BuildArgs),

    /// Create a package repository from a directory of packages
    Repo(RepoArgs),

    /// Print dependencies in the target's native constraint syntax
    Resolve(ResolveArgs),

    /// List supported targets
    Targets {
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Inspect and manage build caches
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Spec file
    pub spec: PathBuf,

    /// Override a declared build arg: <name>=<value>
    #[arg(long = "build-arg", value_parser = parse_build_arg)]
    pub build_args: Vec<(String, String)>,
}

/// Build inputs supplied from the host
#[derive(Args, Debug, Default)]
pub struct SessionArgs {
    /// Secret for the build: id=<name>[,env=<VAR>|,src=<file>]
    #[arg(long = "secret", value_parser = parse_secret)]
    pub secrets: Vec<(String, SecretSource)>,

    /// SSH agent socket: <id>[=<socket>] (defaults to $SSH_AUTH_SOCK)
    #[arg(long = "ssh", value_parser = parse_ssh)]
    pub ssh: Vec<(String, Option<PathBuf>)>,

    /// Local build context: <name>=<dir>
    #[arg(long = "context", value_parser = parse_context)]
    pub contexts: Vec<(String, PathBuf)>,
}

#[derive(Args, Debug)]
pub struct DepsArgs {
    /// Spec file
    pub spec: PathBuf,

    /// Target distro whose worker runs the download
    #[arg(short, long)]
    pub target: String,

    /// Directory receiving the module cache tree
    #[arg(short, long)]
    pub output: PathBuf,

    /// Override a declared build arg: <name>=<value>
    #[arg(long = "build-arg", value_parser = parse_build_arg)]
    pub build_args: Vec<(String, String)>,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Spec file
    pub spec: PathBuf,

    #[arg(short, long)]
    pub target: String,

    /// Directory receiving the build output
    #[arg(short, long)]
    pub output: PathBuf,

    /// Override a declared build arg: <name>=<value>
    #[arg(long = "build-arg", value_parser = parse_build_arg)]
    pub build_args: Vec<(String, String)>,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug)]
pub struct RepoArgs {
    #[arg(short, long)]
    pub target: String,

    /// Directory of built packages (RPMS/SRPMS tree or .deb files)
    #[arg(short, long)]
    pub packages: PathBuf,

    /// Armored private key used to sign the repository
    #[arg(long)]
    pub sign_key: Option<PathBuf>,

    /// Repository location inside the worker
    #[arg(long, default_value = "/opt/dalec/repo")]
    pub repo_path: String,

    /// Directory receiving the repository
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Spec file
    pub spec: PathBuf,

    #[arg(short, long)]
    pub target: String,

    #[arg(short, long, default_value = "plain")]
    pub format: OutputFormat,

    /// Candidate versions of a package: <name>=<v1>,<v2>,...
    #[arg(long = "available", value_parser = parse_available)]
    pub available: Vec<(String, Vec<String>)>,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show the cache mounts a build of the spec would use
    Plan {
        /// Spec file
        spec: PathBuf,

        #[arg(short, long)]
        target: String,

        /// Platform used in cache keys (defaults to the host)
        #[arg(long)]
        platform: Option<String>,

        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// List persistent cache volumes
    List {
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove persistent cache volumes
    Clear {
        /// Only remove volumes whose cache key starts with this prefix
        #[arg(long)]
        key_prefix: Option<String>,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Parse `id=<name>[,env=<VAR>|,src=<file>]`
fn parse_secret(s: &str) -> Result<(String, SecretSource), String> {
    let mut id = None;
    let mut source = None;
    for field in s.split(',') {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| format!("invalid secret field '{field}': expected key=value"))?;
        if value.is_empty() {
            return Err(format!("secret field '{key}' has an empty value"));
        }
        match key {
            "id" => id = Some(value.to_string()),
            "env" if source.is_none() => source = Some(SecretSource::Env(value.to_string())),
            "src" | "source" if source.is_none() => {
                source = Some(SecretSource::File(PathBuf::from(value)))
            }
            "env" | "src" | "source" => return Err("secret takes only one of env or src".to_string()),
            other => return Err(format!("unknown secret field '{other}'")),
        }
    }

    let id = id.ok_or_else(|| "secret requires id=<name>".to_string())?;
    let source = source.unwrap_or_else(|| SecretSource::Env(id.clone()));
    Ok((id, source))
}

/// Parse `<id>[=<socket>]`
fn parse_ssh(s: &str) -> Result<(String, Option<PathBuf>), String> {
    let (id, socket) = match s.split_once('=') {
        Some((id, socket)) => (id, Some(PathBuf::from(socket))),
        None => (s, None),
    };
    if id.is_empty() {
        return Err("ssh requires an id".to_string());
    }
    Ok((id.to_string(), socket))
}

/// Parse `<name>=<dir>`
fn parse_context(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, dir)) if !name.is_empty() && !dir.is_empty() => {
            Ok((name.to_string(), PathBuf::from(dir)))
        }
        _ => Err(format!("invalid context '{s}': expected <name>=<dir>")),
    }
}

/// Parse `<name>=<value>`; the value may be empty
fn parse_build_arg(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("invalid build arg '{s}': expected <name>=<value>")),
    }
}

/// Parse `<name>=<v1>,<v2>,...`
fn parse_available(s: &str) -> Result<(String, Vec<String>), String> {
    let (name, versions) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid candidates '{s}': expected <name>=<v1>,<v2>"))?;
    let versions: Vec<String> = versions
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect();
    if name.is_empty() || versions.is_empty() {
        return Err(format!("invalid candidates '{s}': expected <name>=<v1>,<v2>"));
    }
    Ok((name.to_string(), versions))
}
