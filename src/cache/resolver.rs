//! Cache mount resolution
//!
//! Maps `build.caches` entries (plus auto-detected tool caches) to concrete
//! mounts. Keys are namespaced by distro and platform so a cache written
//! while building for one target is never read while building another,
//! unless a `dir` cache opts out with `no_auto_namespace`.

use crate::llb::{CacheSharing, RunOption, State};
use crate::spec::{CacheConfig, CacheDir, Spec, ToolCache, ToolKind};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

pub const GOBUILD_CACHE_DIR: &str = "/tmp/dalec/gobuild-cache";
pub const BAZEL_CACHE_DIR: &str = "/tmp/dalec/bazel-local-cache";
pub const PIP_CACHE_DIR: &str = "/tmp/dalec/pip-cache";
pub const BAZELRC_PATH: &str = "/etc/bazel.bazelrc";

/// Where a resolved mount came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "origin", content = "value")]
pub enum CacheOrigin {
    /// Index into `build.caches`
    Config(usize),
    /// Injected because the toolchain was detected
    Auto(&'static str),
}

/// A fully resolved cache mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMountSpec {
    pub kind: &'static str,
    pub dest: String,
    pub key: String,
    pub sharing: CacheSharing,
    /// Variables pointing tools at the cache
    pub env: BTreeMap<String, String>,
    /// Generated config files, destination to contents
    pub files: BTreeMap<String, String>,
    #[serde(flatten)]
    pub origin: CacheOrigin,
}

impl CacheMountSpec {
    pub fn run_options(&self) -> Vec<RunOption> {
        let mut opts = vec![RunOption::cache_mount(&self.dest, &self.key, self.sharing)];
        for (k, v) in &self.env {
            opts.push(RunOption::env(k, v));
        }
        for (dest, contents) in &self.files {
            let st = State::scratch().mkfile("/file", 0o644, contents.clone());
            opts.push(RunOption::readonly_selected(dest, st, "/file"));
        }
        opts
    }
}

/// Platform string of the host, e.g. `linux/amd64`
pub fn host_platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        other => other,
    };
    format!("linux/{}", arch)
}

fn namespace(distro: &str, platform: &str, key: &str) -> String {
    format!("{}-{}-{}", distro, platform, key)
}

fn dir_mount(index: usize, dir: &CacheDir, distro: &str, platform: &str) -> CacheMountSpec {
    let key = dir.key.clone().unwrap_or_else(|| dir.dest.clone());
    let key = if dir.no_auto_namespace {
        key
    } else {
        namespace(distro, platform, &key)
    };
    CacheMountSpec {
        kind: "dir",
        dest: dir.dest.clone(),
        key,
        sharing: dir.sharing,
        env: BTreeMap::new(),
        files: BTreeMap::new(),
        origin: CacheOrigin::Config(index),
    }
}

fn tool_mount(
    kind: ToolKind,
    cache: &ToolCache,
    distro: &str,
    platform: &str,
    origin: CacheOrigin,
) -> Option<CacheMountSpec> {
    if cache.disabled {
        return None;
    }

    let mut key = namespace(distro, platform, &format!("dalec-{}cache", kind));
    if let Some(scope) = cache.scope.as_deref().filter(|s| !s.is_empty()) {
        key.push('-');
        key.push_str(scope);
    }

    let mut env = BTreeMap::new();
    let mut files = BTreeMap::new();
    let dest = match kind {
        ToolKind::GoBuild => {
            env.insert("GOCACHE".to_string(), GOBUILD_CACHE_DIR.to_string());
            GOBUILD_CACHE_DIR
        }
        ToolKind::Pip => {
            env.insert("PIP_CACHE_DIR".to_string(), PIP_CACHE_DIR.to_string());
            PIP_CACHE_DIR
        }
        ToolKind::Bazel => {
            files.insert(
                BAZELRC_PATH.to_string(),
                format!(
                    "build --disk_cache={dir}\nfetch --disk_cache={dir}\n",
                    dir = BAZEL_CACHE_DIR
                ),
            );
            BAZEL_CACHE_DIR
        }
    };

    Some(CacheMountSpec {
        kind: kind.as_str(),
        dest: dest.to_string(),
        key,
        sharing: CacheSharing::Shared,
        env,
        files,
        origin,
    })
}

/// Resolve explicit cache configs for one distro target, in declaration order
pub fn resolve_cache_mounts(configs: &[CacheConfig], distro: &str, platform: &str) -> Vec<CacheMountSpec> {
    configs
        .iter()
        .enumerate()
        .filter_map(|(i, cfg)| match cfg {
            CacheConfig::Dir(dir) => Some(dir_mount(i, dir, distro, platform)),
            CacheConfig::GoBuild(c) => tool_mount(ToolKind::GoBuild, c, distro, platform, CacheOrigin::Config(i)),
            CacheConfig::Bazel(c) => tool_mount(ToolKind::Bazel, c, distro, platform, CacheOrigin::Config(i)),
            CacheConfig::Pip(c) => tool_mount(ToolKind::Pip, c, distro, platform, CacheOrigin::Config(i)),
            CacheConfig::Ambiguous(_) => None,
        })
        .collect()
}

fn has_package(deps: &BTreeMap<String, crate::spec::PackageConstraints>, names: &[&str], prefix: Option<&str>) -> bool {
    deps.keys().any(|dep| {
        names.contains(&dep.as_str()) || prefix.is_some_and(|p| dep.starts_with(p))
    })
}

/// Whether a toolchain is part of the build for `target`
pub fn detects_tool(spec: &Spec, target: &str, kind: ToolKind) -> bool {
    let deps = spec.build_deps(target);
    match kind {
        ToolKind::GoBuild => {
            spec.has_gomods() || has_package(&deps, &["golang", "msft-golang"], Some("golang-"))
        }
        ToolKind::Pip => has_package(&deps, &["python3-pip", "python3", "python-pip", "pip"], None),
        ToolKind::Bazel => has_package(&deps, &["bazel"], Some("bazel-")),
    }
}

/// All cache mounts for building `spec` on `distro`, explicit ones first
pub fn caches_for_build(spec: &Spec, distro: &str, platform: &str) -> Vec<CacheMountSpec> {
    let configs = &spec.build.caches;
    let mut mounts = resolve_cache_mounts(configs, distro, platform);

    for kind in ToolKind::ALL {
        let configured = configs.iter().any(|c| c.tool().is_some_and(|(k, _)| k == kind));
        if configured || !detects_tool(spec, distro, kind) {
            continue;
        }
        debug!("Auto-injecting {} cache for {}", kind, distro);
        if let Some(m) = tool_mount(kind, &ToolCache::default(), distro, platform, CacheOrigin::Auto(kind.as_str())) {
            mounts.push(m);
        }
    }
    mounts
}

/// Run options for a set of mounts
pub fn run_options(mounts: &[CacheMountSpec]) -> Vec<RunOption> {
    mounts.iter().flat_map(CacheMountSpec::run_options).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::tests::parse;

    const PLATFORM: &str = "linux/amd64";

    fn caches(yaml: &str) -> Vec<CacheConfig> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn dir_cache_is_namespaced_per_distro() {
        let cfg = caches("- dir:\n    key: ccache\n    dest: /root/.ccache\n");
        let a = resolve_cache_mounts(&cfg, "jammy", PLATFORM);
        let b = resolve_cache_mounts(&cfg, "azlinux3", PLATFORM);
        assert_eq!(a[0].key, "jammy-linux/amd64-ccache");
        assert_ne!(a[0].key, b[0].key);
        assert_eq!(a[0].dest, "/root/.ccache");
        assert_eq!(a[0].sharing, CacheSharing::Shared);
    }

    #[test]
    fn dir_cache_key_defaults_to_dest() {
        let cfg = caches("- dir:\n    dest: /cache\n    sharing: private\n");
        let m = &resolve_cache_mounts(&cfg, "noble", PLATFORM)[0];
        assert_eq!(m.key, "noble-linux/amd64-/cache");
        assert_eq!(m.sharing, CacheSharing::Private);
    }

    #[test]
    fn no_auto_namespace_shares_across_distros() {
        let cfg = caches("- dir:\n    key: shared\n    dest: /cache\n    no_auto_namespace: true\n");
        let a = resolve_cache_mounts(&cfg, "jammy", PLATFORM);
        let b = resolve_cache_mounts(&cfg, "azlinux3", PLATFORM);
        assert_eq!(a[0].key, "shared");
        assert_eq!(a[0].key, b[0].key);
    }

    #[test]
    fn tool_caches_are_isolated_per_distro() {
        let cfg = caches("- gobuild:\n    scope: app\n- bazel:\n    scope: app\n- pip:\n    scope: app\n");
        let a = resolve_cache_mounts(&cfg, "jammy", PLATFORM);
        let b = resolve_cache_mounts(&cfg, "bookworm", PLATFORM);
        assert_eq!(a[0].key, "jammy-linux/amd64-dalec-gobuildcache-app");
        for (x, y) in a.iter().zip(&b) {
            assert_ne!(x.key, y.key);
        }
    }

    #[test]
    fn tool_env_and_files() {
        let cfg = caches("- gobuild: {}\n- pip: {}\n- bazel: {}\n");
        let m = resolve_cache_mounts(&cfg, "jammy", PLATFORM);
        assert_eq!(m[0].env["GOCACHE"], GOBUILD_CACHE_DIR);
        assert_eq!(m[1].env["PIP_CACHE_DIR"], PIP_CACHE_DIR);
        assert!(m[2].env.is_empty());
        assert_eq!(
            m[2].files[BAZELRC_PATH],
            "build --disk_cache=/tmp/dalec/bazel-local-cache\nfetch --disk_cache=/tmp/dalec/bazel-local-cache\n"
        );
        assert_eq!(m[0].key, "jammy-linux/amd64-dalec-gobuildcache");
    }

    #[test]
    fn disabled_tool_cache_produces_nothing() {
        let cfg = caches("- gobuild:\n    disabled: true\n");
        assert!(resolve_cache_mounts(&cfg, "jammy", PLATFORM).is_empty());
    }

    #[test]
    fn golang_build_dep_injects_gobuild_cache() {
        let spec = parse("name: x\ndependencies:\n  build:\n    msft-golang:\n");
        let m = caches_for_build(&spec, "azlinux3", PLATFORM);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].origin, CacheOrigin::Auto("gobuild"));
        assert_eq!(m[0].env["GOCACHE"], GOBUILD_CACHE_DIR);

        let spec = parse("name: x\ndependencies:\n  build:\n    golang-1.22-go:\n");
        assert_eq!(caches_for_build(&spec, "jammy", PLATFORM).len(), 1);
    }

    #[test]
    fn python_build_dep_injects_pip_cache() {
        let spec = parse("name: x\ndependencies:\n  build:\n    python3-pip:\n");
        let m = caches_for_build(&spec, "jammy", PLATFORM);
        assert_eq!(m[0].kind, "pip");
    }

    #[test]
    fn explicit_disable_suppresses_auto_cache() {
        let spec = parse(
            "name: x\nbuild:\n  caches:\n    - gobuild:\n        disabled: true\ndependencies:\n  build:\n    golang:\n",
        );
        let m = caches_for_build(&spec, "jammy", PLATFORM);
        assert!(m.is_empty());
        let env: Vec<_> = run_options(&m)
            .into_iter()
            .filter(|o| matches!(o, RunOption::Env(k, _) if k == "GOCACHE"))
            .collect();
        assert!(env.is_empty());
    }

    #[test]
    fn explicit_tool_config_replaces_auto_default() {
        let spec = parse(
            "name: x\nbuild:\n  caches:\n    - gobuild:\n        scope: mine\ndependencies:\n  build:\n    golang:\n",
        );
        let m = caches_for_build(&spec, "jammy", PLATFORM);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].origin, CacheOrigin::Config(0));
        assert!(m[0].key.ends_with("-mine"));
    }

    #[test]
    fn no_toolchain_no_auto_cache() {
        let spec = parse("name: x\ndependencies:\n  build:\n    gcc:\n");
        assert!(caches_for_build(&spec, "jammy", PLATFORM).is_empty());
    }

    #[test]
    fn run_options_mount_and_env() {
        let cfg = caches("- gobuild: {}\n");
        let opts = run_options(&resolve_cache_mounts(&cfg, "jammy", PLATFORM));
        assert_eq!(opts.len(), 2);
        assert!(matches!(&opts[1], RunOption::Env(k, v) if k == "GOCACHE" && v == GOBUILD_CACHE_DIR));
    }
}
