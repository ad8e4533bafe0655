//! Build spec model
//!
//! A spec is a YAML document describing sources, patches, build steps,
//! caches and package dependencies. Maps are `BTreeMap`s so that every
//! iteration over sources, hosts or packages is sorted.

mod args;
mod cache;
mod deps;
mod source;
mod validate;

pub use cache::{CacheConfig, CacheDir, ToolCache, ToolKind};
pub use deps::{
    PackageConstraints, PackageDependencies, PackageRepositoryConfig, RepoData, RepoEnv,
};
pub use source::{
    Generator, GitAuth, GitAuthSsh, GomodGenerator, GomodGitAuth, ImageCommand, InlineDir, InlineFile,
    PatchSpec, Source, SourceContext, SourceDockerImage, SourceGit, SourceHttp, SourceInline,
    SourceKind,
};

use crate::error::{DalecError, DalecResult};
use crate::llb::NetworkMode;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Root of a build spec
#[derive(Debug, Clone, Deserialize)]
pub struct Spec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub version: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub revision: String,

    /// Declared build args and their defaults
    #[serde(default, deserialize_with = "arg_defaults")]
    pub args: BTreeMap<String, String>,

    #[serde(default)]
    pub sources: BTreeMap<String, Source>,

    /// Patches per source, applied in list order
    #[serde(default)]
    pub patches: BTreeMap<String, Vec<PatchSpec>>,

    #[serde(default)]
    pub build: ArtifactBuild,

    #[serde(default)]
    pub dependencies: Option<PackageDependencies>,

    /// Per-target overrides
    #[serde(default)]
    pub targets: BTreeMap<String, TargetOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TargetOverride {
    pub dependencies: Option<PackageDependencies>,
}

/// How the package is built
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactBuild {
    pub env: BTreeMap<String, String>,
    pub steps: Vec<BuildStep>,
    pub caches: Vec<CacheConfig>,
    pub network_mode: BuildNetwork,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildStep {
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Network access granted to build steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildNetwork {
    #[default]
    None,
    Sandbox,
}

impl From<BuildNetwork> for NetworkMode {
    fn from(mode: BuildNetwork) -> Self {
        match mode {
            BuildNetwork::None => NetworkMode::None,
            BuildNetwork::Sandbox => NetworkMode::Default,
        }
    }
}

fn string_or_number<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(d)?;
    match value {
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {:?}",
            other
        ))),
    }
}

fn arg_defaults<'de, D>(d: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Value(#[serde(deserialize_with = "string_or_number")] String);

    let raw = BTreeMap::<String, Value>::deserialize(d)?;
    Ok(raw.into_iter().map(|(k, Value(v))| (k, v)).collect())
}

impl Spec {
    /// Read and parse a spec file
    pub async fn load(path: &Path) -> DalecResult<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| DalecError::io(format!("reading spec {}", path.display()), e))?;
        Self::parse(&content, path)
    }

    /// Parse spec YAML; `path` is only used in errors
    pub fn parse(content: &str, path: &Path) -> DalecResult<Self> {
        let spec: Spec = serde_yaml::from_str(content).map_err(|e| DalecError::SpecParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!(
            "Loaded spec {} with {} source(s)",
            spec.name,
            spec.sources.len()
        );
        Ok(spec)
    }

    /// Apply defaults that depend on other parts of the spec
    ///
    /// Gomod generators of git sources inherit the source's credentials
    /// for the repository host.
    pub fn fill_defaults(&mut self) {
        for src in self.sources.values_mut() {
            src.fill_defaults();
        }
    }

    /// Sources carrying a go module generator, sorted by name
    pub fn gomod_sources(&self) -> BTreeMap<&str, &Source> {
        self.sources
            .iter()
            .filter(|(_, src)| src.has_gomod())
            .map(|(name, src)| (name.as_str(), src))
            .collect()
    }

    pub fn has_gomods(&self) -> bool {
        self.sources.values().any(Source::has_gomod)
    }

    /// Dependencies for `target`, falling back to the top-level ones
    pub fn dependencies_for(&self, target: &str) -> Option<&PackageDependencies> {
        self.targets
            .get(target)
            .and_then(|t| t.dependencies.as_ref())
            .or(self.dependencies.as_ref())
    }

    pub fn build_deps(&self, target: &str) -> BTreeMap<String, PackageConstraints> {
        self.dependencies_for(target)
            .map(|d| d.build.clone())
            .unwrap_or_default()
    }

    pub fn runtime_deps(&self, target: &str) -> BTreeMap<String, PackageConstraints> {
        self.dependencies_for(target)
            .map(|d| d.runtime.clone())
            .unwrap_or_default()
    }

    pub fn test_deps(&self, target: &str) -> BTreeMap<String, PackageConstraints> {
        self.dependencies_for(target)
            .map(|d| d.test.clone())
            .unwrap_or_default()
    }

    /// Extra repositories for `target` that apply to `env`
    pub fn extra_repos(&self, target: &str, env: RepoEnv) -> Vec<&PackageRepositoryConfig> {
        self.dependencies_for(target)
            .map(|d| d.extra_repos.iter().filter(|r| r.applies_to(env)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const GOMOD_SPEC: &str = r#"
name: go-app
version: 1.0.0
revision: 1
sources:
  src:
    context: {}
    generate:
      - gomod:
          paths: [".", "tools"]
          auth:
            github.com:
              token: GITHUB_TOKEN
            git.internal:2222:
              ssh:
                id: default
  readme:
    inline:
      file:
        contents: "hello\n"
  fix:
    inline:
      file:
        contents: "--- a/go.mod\n+++ b/go.mod\n"
patches:
  src:
    - source: fix
      strip: 1
build:
  steps:
    - command: go build ./...
  caches:
    - gobuild:
        scope: app
dependencies:
  build:
    golang:
      version: [">= 1.21"]
targets:
  jammy:
    dependencies:
      build:
        golang-1.22-go:
"#;

    pub(crate) fn parse(yaml: &str) -> Spec {
        Spec::parse(yaml, Path::new("test.yml")).unwrap()
    }

    #[test]
    fn parses_full_spec() {
        let spec = parse(GOMOD_SPEC);
        assert_eq!(spec.revision, "1");
        assert_eq!(spec.version, "1.0.0");
        assert_eq!(spec.gomod_sources().keys().collect::<Vec<_>>(), vec![&"src"]);
        assert_eq!(spec.patches["src"][0].strip(), 1);
        assert_eq!(spec.build.network_mode, BuildNetwork::None);
    }

    #[test]
    fn target_dependencies_override() {
        let spec = parse(GOMOD_SPEC);
        assert!(spec.build_deps("azlinux3").contains_key("golang"));
        let jammy = spec.build_deps("jammy");
        assert!(jammy.contains_key("golang-1.22-go"));
        assert!(!jammy.contains_key("golang"));
    }

    #[test]
    fn generator_and_cache_lists_parse() {
        let spec = parse(
            r#"
name: x
sources:
  src:
    context: {}
    generate:
      - gomod: {}
build:
  caches:
    - gobuild:
        disabled: true
    - dir:
        dest: /root/.ccache
"#,
        );
        assert!(spec.has_gomods());
        assert_eq!(spec.build.caches.len(), 2);
        let (kind, cache) = spec.build.caches[0].tool().unwrap();
        assert_eq!(kind, ToolKind::GoBuild);
        assert!(cache.disabled);
        assert!(matches!(&spec.build.caches[1], CacheConfig::Dir(d) if d.dest == "/root/.ccache"));
    }

    #[test]
    fn numeric_arg_defaults_are_strings() {
        let spec = parse("name: x\nargs:\n  VERSION: 1.22\n  EMPTY:\n");
        assert_eq!(spec.args["VERSION"], "1.22");
        assert_eq!(spec.args["EMPTY"], "");
    }

    #[test]
    fn fill_defaults_reaches_every_source() {
        let mut spec = parse(
            "name: x\nsources:\n  src:\n    git:\n      url: https://github.com/x/y.git\n      commit: abc\n      auth:\n        token: GH\n    generate:\n      - gomod: {}\n",
        );
        spec.fill_defaults();
        let gomod = spec.sources["src"].gomod_generators().next().unwrap();
        assert_eq!(gomod.auth["github.com"], GomodGitAuth::Token { secret: "GH".into() });
    }

    #[test]
    fn parse_error_names_file() {
        let err = Spec::parse("name: [", Path::new("broken.yml")).unwrap_err();
        assert!(err.to_string().contains("broken.yml"));
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("spec.yml");
        tokio::fs::write(&path, "name: x\n").await.unwrap();
        let spec = Spec::load(&path).await.unwrap();
        assert_eq!(spec.name, "x");
        assert!(!spec.has_gomods());
    }
}
