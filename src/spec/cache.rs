//! Declarative build cache configuration

use crate::llb::CacheSharing;
use serde::Deserialize;

/// One entry of `build.caches`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawCacheConfig")]
pub enum CacheConfig {
    Dir(CacheDir),
    GoBuild(ToolCache),
    Bazel(ToolCache),
    Pip(ToolCache),
    /// Zero or several kinds set; rejected by validation
    Ambiguous(Vec<&'static str>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCacheConfig {
    #[serde(default)]
    dir: Option<CacheDir>,
    #[serde(default)]
    gobuild: Option<ToolCache>,
    #[serde(default)]
    bazel: Option<ToolCache>,
    #[serde(default)]
    pip: Option<ToolCache>,
}

impl TryFrom<RawCacheConfig> for CacheConfig {
    type Error = String;

    fn try_from(raw: RawCacheConfig) -> Result<Self, Self::Error> {
        let set: Vec<&'static str> = [
            ("dir", raw.dir.is_some()),
            ("gobuild", raw.gobuild.is_some()),
            ("bazel", raw.bazel.is_some()),
            ("pip", raw.pip.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect();
        if set.len() != 1 {
            return Ok(Self::Ambiguous(set));
        }

        Ok(match (raw.dir, raw.gobuild, raw.bazel, raw.pip) {
            (Some(dir), ..) => Self::Dir(dir),
            (_, Some(c), ..) => Self::GoBuild(c),
            (_, _, Some(c), _) => Self::Bazel(c),
            (.., Some(c)) => Self::Pip(c),
            _ => Self::Ambiguous(set),
        })
    }
}

/// An explicit cache directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheDir {
    /// Cache identity; defaults to the destination
    #[serde(default)]
    pub key: Option<String>,
    /// Absolute mount point
    pub dest: String,
    #[serde(default)]
    pub sharing: CacheSharing,
    /// Share the cache between distro targets
    #[serde(default)]
    pub no_auto_namespace: bool,
}

/// A language tool cache managed by dalec
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolCache {
    pub scope: Option<String>,
    pub disabled: bool,
}

/// The kind of tool a cache belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolKind {
    GoBuild,
    Bazel,
    Pip,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [Self::GoBuild, Self::Bazel, Self::Pip];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoBuild => "gobuild",
            Self::Bazel => "bazel",
            Self::Pip => "pip",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CacheConfig {
    /// The tool and its settings, for tool entries
    pub fn tool(&self) -> Option<(ToolKind, &ToolCache)> {
        match self {
            Self::Dir(_) | Self::Ambiguous(_) => None,
            Self::GoBuild(c) => Some((ToolKind::GoBuild, c)),
            Self::Bazel(c) => Some((ToolKind::Bazel, c)),
            Self::Pip(c) => Some((ToolKind::Pip, c)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_variant() {
        let caches: Vec<CacheConfig> = serde_yaml::from_str(
            r#"
- dir:
    key: ccache
    dest: /root/.ccache
    sharing: locked
- gobuild:
    disabled: true
- bazel:
    scope: my-scope
- pip: {}
"#,
        )
        .unwrap();

        assert_eq!(
            caches[0],
            CacheConfig::Dir(CacheDir {
                key: Some("ccache".into()),
                dest: "/root/.ccache".into(),
                sharing: CacheSharing::Locked,
                no_auto_namespace: false,
            })
        );
        assert_eq!(caches[1].tool().unwrap().0, ToolKind::GoBuild);
        assert!(caches[1].tool().unwrap().1.disabled);
        assert_eq!(caches[2].tool().unwrap().1.scope.as_deref(), Some("my-scope"));
        assert_eq!(caches[3].tool().unwrap().0, ToolKind::Pip);
    }

    #[test]
    fn entry_with_two_kinds_is_ambiguous() {
        let caches: Vec<CacheConfig> =
            serde_yaml::from_str("- gobuild: {}\n  pip: {}\n").unwrap();
        assert_eq!(caches[0], CacheConfig::Ambiguous(vec!["gobuild", "pip"]));
        assert!(caches[0].tool().is_none());
    }

    #[test]
    fn entry_with_no_kind_is_ambiguous() {
        let caches: Vec<CacheConfig> = serde_yaml::from_str("- {}\n").unwrap();
        assert_eq!(caches[0], CacheConfig::Ambiguous(vec![]));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let res: Result<Vec<CacheConfig>, _> = serde_yaml::from_str("- cargo: {}\n");
        assert!(res.is_err());
    }

    #[test]
    fn unknown_sharing_is_rejected() {
        let res: Result<Vec<CacheConfig>, _> =
            serde_yaml::from_str("- dir:\n    dest: /x\n    sharing: bogus\n");
        assert!(res.is_err());
    }
}
