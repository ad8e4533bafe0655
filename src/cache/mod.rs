//! Keyed build caches
//!
//! `resolver` turns declarative cache configuration into mounts with
//! distro-namespaced keys; `volume` maps those keys onto the engine's
//! persistent volumes.
//!
//! # Key layout
//!
//! | Config | Key |
//! |--------|-----|
//! | `dir` | `{distro}-{platform}-{key or dest}` |
//! | `dir` + `no_auto_namespace` | `{key or dest}` |
//! | `gobuild` / `bazel` / `pip` | `{distro}-{platform}-dalec-{tool}cache[-{scope}]` |

pub mod resolver;
pub mod volume;

pub use resolver::{
    caches_for_build, detects_tool, host_platform, resolve_cache_mounts, run_options,
    CacheMountSpec, CacheOrigin,
};
pub use volume::{format_bytes, labels, CacheVolume};
