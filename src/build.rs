//! Package build steps
//!
//! Builds run on a single root filesystem: the worker with build
//! dependencies installed, patched sources copied to `/work/src/<name>` and
//! the fetched go modules at `/go/pkg/mod`. go.mod edits declared by gomod
//! generators are applied from `/work/src` first. Each step runs on the
//! previous step's root and the artifacts are whatever the steps leave in
//! `/work/out`.

use crate::cache::{caches_for_build, run_options, CacheMountSpec};
use crate::error::DalecResult;
use crate::gomod::{fetch_all, gomod_edit_script, GOMODCACHE_DIR, GOPATH_DIR, WORK_DIR};
use crate::llb::{NetworkMode, RunOption, State};
use crate::repo::{install_build_deps, prepare_worker, Distro};
use crate::source::patched_sources;
use crate::spec::Spec;
use tracing::{debug, info};

/// Where build steps place their artifacts
pub const OUTPUT_DIR: &str = "/work/out";

/// Worker image with the fetch tools and the spec's build dependencies
pub fn build_worker(spec: &Spec, distro: &Distro, image_override: Option<&str>) -> DalecResult<State> {
    let worker = prepare_worker(distro, &distro.worker(image_override));
    install_build_deps(spec, distro, &worker)
}

/// Everything a build needs besides the graph itself
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// The `/work/out` tree after the last step
    pub output: State,
    pub caches: Vec<CacheMountSpec>,
}

/// Plan the build of `spec` for `distro` on `platform`
pub fn plan_build(spec: &Spec, distro: &Distro, worker: &State, platform: &str) -> DalecResult<BuildPlan> {
    let sources = patched_sources(spec, worker, |_, _| true)?;
    let gomods = fetch_all(spec, worker)?;
    let caches = caches_for_build(spec, distro.key, platform);

    let mut root = worker.mkdir(OUTPUT_DIR, 0o755).mkdir(WORK_DIR, 0o755);
    for (name, st) in &sources {
        let dest = format!("{}/{}", WORK_DIR, name);
        root = match spec.sources.get(name) {
            Some(src) if !src.is_dir() => root.copy_from(st, format!("/{}", name), dest),
            _ => root.copy_from(st, "/", dest),
        };
    }

    let mut base = vec![RunOption::Network(NetworkMode::from(spec.build.network_mode))];
    if let Some(mods) = &gomods {
        root = root.copy_from(mods, "/", GOMODCACHE_DIR);
        base.push(RunOption::env("GOMODCACHE", GOMODCACHE_DIR));
        base.push(RunOption::env("GOPATH", GOPATH_DIR));
    }
    base.extend(run_options(&caches));
    for (k, v) in &spec.build.env {
        base.push(RunOption::env(k, v));
    }

    if let Some(script) = gomod_edit_script(spec)? {
        debug!("Applying go.mod edits before the build steps");
        let mut opts = base.clone();
        opts.push(RunOption::shell(script));
        opts.push(RunOption::dir(WORK_DIR));
        opts.push(RunOption::description("apply go.mod edits"));
        root = root.run(opts).root();
    }

    info!(
        "Planning {} build step(s) for {} with {} cache mount(s)",
        spec.build.steps.len(),
        distro.key,
        caches.len()
    );
    for (i, step) in spec.build.steps.iter().enumerate() {
        debug!("Step {}: {}", i, step.command);
        let mut opts = base.clone();
        opts.extend(step.env.iter().map(|(k, v)| RunOption::env(k, v)));
        opts.push(RunOption::shell(step.command.clone()));
        opts.push(RunOption::dir(WORK_DIR));
        opts.push(RunOption::description(format!("build step {}: {}", i, step.command)));
        root = root.run(opts).root();
    }

    Ok(BuildPlan {
        output: State::scratch().copy_from(&root, OUTPUT_DIR, "/"),
        caches,
    })
}
