//! Spec validation
//!
//! Runs before any graph is built and collects every problem instead of
//! stopping at the first one.

use crate::error::{DalecError, DalecResult};
use crate::spec::{CacheConfig, GomodGitAuth, Source, SourceKind, Spec};
use std::collections::BTreeSet;
use std::path::{Component, Path};

impl Spec {
    /// Check the spec for configuration errors
    pub fn validate(&self) -> DalecResult<()> {
        let mut errors = Vec::new();

        for (name, src) in &self.sources {
            validate_source(name, src, &mut errors);
        }
        self.validate_patches(&mut errors);
        self.validate_caches(&mut errors);

        for (i, step) in self.build.steps.iter().enumerate() {
            if step.command.trim().is_empty() {
                errors.push(format!("build step {}: command is empty", i));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DalecError::SpecInvalid { errors })
        }
    }

    fn validate_patches(&self, errors: &mut Vec<String>) {
        for (target, patches) in &self.patches {
            if !self.sources.contains_key(target) {
                errors.push(format!("patches for {}: no such source", target));
            }
            for (i, patch) in patches.iter().enumerate() {
                let Some(src) = self.sources.get(&patch.source) else {
                    errors.push(format!(
                        "patch {} for source {}: patch source {} does not exist",
                        i, target, patch.source
                    ));
                    continue;
                };
                if src.is_dir() && patch.path.is_none() {
                    errors.push(format!(
                        "patch {} for source {}: patch source {} is a directory, path is required",
                        i, target, patch.source
                    ));
                }
                if let Some(path) = &patch.path {
                    if !is_relative_inside(path) {
                        errors.push(format!(
                            "patch {} for source {}: path {} must be relative and stay inside the source",
                            i, target, path
                        ));
                    }
                }
            }
        }
    }

    fn validate_caches(&self, errors: &mut Vec<String>) {
        let mut tools = BTreeSet::new();
        let mut dests = BTreeSet::new();

        for (i, cache) in self.build.caches.iter().enumerate() {
            match cache {
                CacheConfig::Dir(dir) => {
                    if !dir.dest.starts_with('/') {
                        errors.push(format!(
                            "cache {}: dir dest {} must be an absolute path",
                            i, dir.dest
                        ));
                    }
                    if !dests.insert(dir.dest.as_str()) {
                        errors.push(format!(
                            "cache {}: dest {} is mounted by another cache",
                            i, dir.dest
                        ));
                    }
                }
                CacheConfig::GoBuild(_) | CacheConfig::Bazel(_) | CacheConfig::Pip(_) => {
                    if let Some((kind, _)) = cache.tool() {
                        if !tools.insert(kind) {
                            errors.push(format!("cache {}: {} cache configured more than once", i, kind));
                        }
                    }
                }
                CacheConfig::Ambiguous(set) if set.is_empty() => errors.push(format!(
                    "cache {}: one of dir, gobuild, bazel or pip must be set",
                    i
                )),
                CacheConfig::Ambiguous(set) => errors.push(format!(
                    "cache {}: only one of dir, gobuild, bazel or pip may be set, got {}",
                    i,
                    set.join(", ")
                )),
            }
        }
    }
}

fn validate_source(name: &str, src: &Source, errors: &mut Vec<String>) {
    if let SourceKind::Http(http) = &src.kind {
        if let Some(digest) = &http.digest {
            if !is_sha256_digest(digest) {
                errors.push(format!(
                    "source {}: digest {} must be of the form sha256:<64 hex chars>",
                    name, digest
                ));
            }
        }
    }

    if let Some(path) = &src.path {
        if !is_relative_inside(path.trim_start_matches('/')) {
            errors.push(format!("source {}: path {} escapes the source", name, path));
        }
    }

    for (g, gomod) in src.gomod_generators().enumerate() {
        if let Err(e) = gomod.edit_flags() {
            errors.push(format!("source \"{}\" generator[{}]: {}", name, g, e));
        }
        if !src.is_dir() {
            errors.push(format!(
                "source {}: gomod generator requires a directory source",
                name
            ));
        }
        for path in gomod.paths.iter().chain(std::iter::once(&gomod.subpath)) {
            if !path.is_empty() && !is_relative_inside(path) {
                errors.push(format!(
                    "source {}: gomod path {} must be relative and stay inside the source",
                    name, path
                ));
            }
        }
        for (host, auth) in &gomod.auth {
            match auth {
                GomodGitAuth::Unset => errors.push(format!(
                    "source {}: gomod auth for host {}: one of token, header or ssh must be set",
                    name, host
                )),
                GomodGitAuth::Header { .. } => auth.warn_ambiguous(name, host),
                GomodGitAuth::Token { .. } | GomodGitAuth::Ssh(_) => {}
            }
        }
    }
}

fn is_relative_inside(path: &str) -> bool {
    let p = Path::new(path);
    !p.is_absolute() && !p.components().any(|c| matches!(c, Component::ParentDir))
}

fn is_sha256_digest(digest: &str) -> bool {
    digest
        .strip_prefix("sha256:")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}
