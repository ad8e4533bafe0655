//! Package dependencies and extra repositories

use crate::spec::Source;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Constraints on one package dependency
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PackageConstraints {
    /// Version constraints such as `>= 1.20` or `1.2.3`
    pub version: Vec<String>,
    /// Restrict to these architectures
    pub arch: Vec<String>,
}

/// Dependencies of a package per lifecycle phase
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PackageDependencies {
    #[serde(deserialize_with = "constraint_map")]
    pub build: BTreeMap<String, PackageConstraints>,
    #[serde(deserialize_with = "constraint_map")]
    pub runtime: BTreeMap<String, PackageConstraints>,
    #[serde(deserialize_with = "constraint_map")]
    pub test: BTreeMap<String, PackageConstraints>,
    pub extra_repos: Vec<PackageRepositoryConfig>,
}

/// Where a repository is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoEnv {
    Build,
    Test,
    Install,
}

/// A repository made available to the package manager
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PackageRepositoryConfig {
    /// Public keys to import, by file name
    pub keys: BTreeMap<String, Source>,
    /// Repository configuration files, by file name
    pub config: BTreeMap<String, Source>,
    /// Extra content mounted while the repository is in use
    pub data: Vec<RepoData>,
    /// Phases the repository applies to; empty means all
    pub envs: Vec<RepoEnv>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoData {
    pub dest: String,
    pub spec: Source,
}

impl PackageRepositoryConfig {
    pub fn applies_to(&self, env: RepoEnv) -> bool {
        self.envs.is_empty() || self.envs.contains(&env)
    }
}

/// `name:` with no body is allowed and means "any version"
fn constraint_map<'de, D>(d: D) -> Result<BTreeMap<String, PackageConstraints>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Option<PackageConstraints>>> = Option::deserialize(d)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, c)| (name, c.unwrap_or_default()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_package_names_have_no_constraints() {
        let deps: PackageDependencies = serde_yaml::from_str(
            "build:\n  golang:\n  gcc:\n    version: ['>= 12']\nruntime: {}\n",
        )
        .unwrap();
        assert_eq!(deps.build["golang"], PackageConstraints::default());
        assert_eq!(deps.build["gcc"].version, vec![">= 12"]);
        assert!(deps.runtime.is_empty());
    }

    #[test]
    fn repo_envs_default_to_all() {
        let repo = PackageRepositoryConfig::default();
        assert!(repo.applies_to(RepoEnv::Build));
        let repo = PackageRepositoryConfig {
            envs: vec![RepoEnv::Test],
            ..Default::default()
        };
        assert!(!repo.applies_to(RepoEnv::Build));
        assert!(repo.applies_to(RepoEnv::Test));
    }
}
