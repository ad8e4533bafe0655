//! Go module dependency fetching
//!
//! Every gomod generator path is downloaded in two execs. The first runs
//! with network and auth and fills a persistent proxy cache shared by all
//! builds. The second runs offline against that cache and writes only the
//! modules this go.mod needs into the accumulated `/go/pkg/mod` tree.

use crate::error::DalecResult;
use crate::gomod::auth::{prepare_auth, PreparedWorker};
use crate::gomod::edit::edit_commands;
use crate::llb::{CacheSharing, NetworkMode, RunOption, State};
use crate::source::patched_sources;
use crate::spec::{GomodGenerator, Spec};
use tracing::{debug, info};

/// Where patched sources are mounted
pub const WORK_DIR: &str = "/work/src";
/// Module cache layout of the fetched tree
pub const GOMODCACHE_DIR: &str = "/go/pkg/mod";
pub const GOPATH_DIR: &str = "/go";
pub const PROXY_CACHE_DIR: &str = "/tmp/dalec/gomod-proxy-cache";
/// Persistent cache identity of the module proxy cache
pub const PROXY_CACHE_KEY: &str = "dalec-gomod-proxy-cache";
const STAMP_DIR: &str = "/tmp/dalec/gomod-stamp";
const STAMP_FILE: &str = "/tmp/dalec/gomod-stamp/stamp";

const REQUIRE_GO_MOD: &str =
    "[ -f go.mod ] || { echo \"go.mod not found in $(pwd)\" >&2; exit 1; }";

/// Module directory relative to the work dir, dropping `.` and empty parts
pub(crate) fn module_rel_dir(source: &str, subpath: &str, path: &str) -> String {
    let mut dir = source.to_string();
    for part in [subpath, path]
        .into_iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty() && *p != ".")
    {
        dir.push('/');
        dir.push_str(part);
    }
    dir
}

fn module_dir(source: &str, subpath: &str, path: &str) -> String {
    format!("{}/{}", WORK_DIR, module_rel_dir(source, subpath, path))
}

/// The source tree as seen by one download
///
/// With go.mod edits the source is a private writable copy so the edits
/// never reach the source state itself.
struct DownloadInput<'a> {
    source: &'a str,
    src: &'a State,
    /// `go mod edit` commands followed by `go mod tidy`, or empty
    edits: String,
}

impl DownloadInput<'_> {
    fn mount(&self) -> RunOption {
        let dest = format!("{}/{}", WORK_DIR, self.source);
        if self.edits.is_empty() {
            RunOption::readonly_mount(dest, self.src.clone())
        } else {
            RunOption::writable_copy(dest, self.src.clone())
        }
    }
}

/// Phase 1: populate the proxy cache with network access
fn populate_proxy_cache(prepared: &PreparedWorker, input: &DownloadInput<'_>, dir: &str) -> State {
    let script = format!(
        "set -e; {}; export GOMODCACHE=\"${{TMP_GOMODCACHE}}\"; {}go mod download; date -u > {}",
        REQUIRE_GO_MOD, input.edits, STAMP_FILE
    );

    let mut opts = vec![
        RunOption::shell(prepared.wrap_command(&script)),
        RunOption::dir(dir),
        RunOption::env("GOPATH", GOPATH_DIR),
        RunOption::env("TMP_GOMODCACHE", PROXY_CACHE_DIR),
        input.mount(),
        RunOption::cache_mount(PROXY_CACHE_DIR, PROXY_CACHE_KEY, CacheSharing::Shared),
        RunOption::IgnoreCache,
        RunOption::description(format!(
            "populate go module proxy cache for {} ({})",
            input.source, dir
        )),
    ];
    opts.extend(prepared.auth_opts.iter().cloned());

    prepared.worker.run(opts).add_mount(STAMP_DIR, State::scratch())
}

/// Phase 2: offline download from the proxy cache into `acc`
fn extract_modules(worker: &State, input: &DownloadInput<'_>, stamp: State, dir: &str, acc: State) -> State {
    let script = format!(
        "set -e; {}; export GOPROXY=\"file://${{TMP_GOMODCACHE}}/cache/download\"; {}go mod download",
        REQUIRE_GO_MOD, input.edits
    );

    worker
        .run([
            RunOption::shell(script),
            RunOption::dir(dir),
            RunOption::env("GOPATH", GOPATH_DIR),
            RunOption::env("GOMODCACHE", GOMODCACHE_DIR),
            RunOption::env("TMP_GOMODCACHE", PROXY_CACHE_DIR),
            RunOption::env("GONOPROXY", "none"),
            RunOption::env("GOSUMDB", "off"),
            RunOption::env("GOTOOLCHAIN", "local"),
            input.mount(),
            RunOption::readonly_mount(STAMP_DIR, stamp),
            RunOption::cache_mount(PROXY_CACHE_DIR, PROXY_CACHE_KEY, CacheSharing::Shared),
            RunOption::Network(NetworkMode::None),
            RunOption::description(format!("extract go modules for {} ({})", input.source, dir)),
        ])
        .add_mount(GOMODCACHE_DIR, acc)
}

fn fetch_generator(
    worker: &State,
    source: &str,
    src: &State,
    generator: &GomodGenerator,
    mut acc: State,
) -> DalecResult<State> {
    let prepared = prepare_auth(worker, &generator.auth);
    let mut edits = String::new();
    for cmd in edit_commands(generator)? {
        edits.push_str(&cmd);
        edits.push_str("; ");
    }
    if !edits.is_empty() {
        edits.push_str("go mod tidy; ");
    }
    let input = DownloadInput { source, src, edits };

    for path in &generator.paths {
        let dir = module_dir(source, &generator.subpath, path);
        debug!("Fetching go modules for {} in {}", source, dir);
        let stamp = populate_proxy_cache(&prepared, &input, &dir);
        acc = extract_modules(worker, &input, stamp, &dir, acc);
    }
    Ok(acc)
}

/// Fetch the go modules of every gomod source into one module cache tree
///
/// Returns `None` when no source has a gomod generator. Sources are
/// processed in name order and each download layers onto the same tree.
pub fn fetch_all(spec: &Spec, worker: &State) -> DalecResult<Option<State>> {
    if !spec.has_gomods() {
        return Ok(None);
    }

    let patched = patched_sources(spec, worker, |_, src| src.has_gomod())?;
    info!("Fetching go modules for {} source(s)", patched.len());

    let mut acc = State::scratch();
    for (name, st) in &patched {
        let Some(src) = spec.sources.get(name) else {
            continue;
        };
        for generator in src.gomod_generators() {
            acc = fetch_generator(worker, name, st, generator, acc)?;
        }
    }
    Ok(Some(acc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llb::{ExecOp, MountKind, Op};
    use crate::spec::tests::{parse, GOMOD_SPEC};
    use std::sync::Arc;

    fn exec_of(state: &State) -> Arc<ExecOp> {
        match &state.node().unwrap().op {
            Op::Exec(e) => e.clone(),
            other => panic!("expected exec, got {:?}", other),
        }
    }

    /// Walk the accumulated chain from the newest download back to the first
    fn chain(mut st: State) -> Vec<Arc<ExecOp>> {
        let mut out = Vec::new();
        while let Some(node) = st.node() {
            let Op::Exec(exec) = &node.op else { break };
            let exec = exec.clone();
            let acc = exec
                .mounts
                .iter()
                .find_map(|m| match &m.kind {
                    MountKind::Snapshot { input, readonly: false, .. } if m.dest == GOMODCACHE_DIR => {
                        Some(input.clone())
                    }
                    _ => None,
                })
                .unwrap();
            out.push(exec);
            st = acc;
        }
        out
    }

    fn stamp_exec(extract: &ExecOp) -> Arc<ExecOp> {
        extract
            .mounts
            .iter()
            .find_map(|m| match &m.kind {
                MountKind::Snapshot { input, .. } if m.dest == STAMP_DIR => Some(exec_of(input)),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn no_gomod_sources_yields_none() {
        let spec = parse("name: x\nsources:\n  a:\n    context: {}\n");
        assert!(fetch_all(&spec, &State::image("golang")).unwrap().is_none());
    }

    #[test]
    fn module_dir_joins_subpath_and_path() {
        assert_eq!(module_dir("src", "", "."), "/work/src/src");
        assert_eq!(module_dir("src", "go", "tools"), "/work/src/src/go/tools");
        assert_eq!(module_dir("src", "./a/", "./b"), "/work/src/src/a/b");
    }

    #[test]
    fn every_path_downloads_in_two_phases() {
        let spec = parse(GOMOD_SPEC);
        let deps = fetch_all(&spec, &State::image("golang")).unwrap().unwrap();
        let execs = chain(deps);
        // Newest first: tools, then the root module
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[0].cwd, "/work/src/src/tools");
        assert_eq!(execs[1].cwd, "/work/src/src");

        for extract in &execs {
            assert_eq!(extract.network, NetworkMode::None);
            assert!(!extract.ignore_cache);
            assert!(extract.secret_env.is_empty());
            assert!(extract.ssh.is_empty());
            assert_eq!(extract.env["GOMODCACHE"], GOMODCACHE_DIR);
            assert!(extract.args[2].contains("export GOPROXY=\"file://${TMP_GOMODCACHE}/cache/download\"; go mod download"));

            let populate = stamp_exec(extract);
            assert!(populate.ignore_cache);
            assert_eq!(populate.network, NetworkMode::Default);
            assert_eq!(populate.cwd, extract.cwd);
            assert!(populate.args[2].contains("export GOMODCACHE=\"${TMP_GOMODCACHE}\"; go mod download"));

            // Both phases read the patched source, not the raw one
            for exec in [extract.as_ref(), populate.as_ref()] {
                let source = exec
                    .mounts
                    .iter()
                    .find_map(|m| match &m.kind {
                        MountKind::Snapshot { input, readonly: true, .. } if m.dest == "/work/src/src" => {
                            Some(exec_of(input))
                        }
                        _ => None,
                    })
                    .unwrap();
                assert_eq!(source.args[2], "patch -p1 < /tmp/dalec/patch");
            }
        }
    }

    #[test]
    fn stamp_path_does_not_depend_on_source_name() {
        let spec = parse(
            "name: x\nsources:\n  \"my src; rm -rf x\":\n    context: {}\n    generate:\n      - gomod: {}\n",
        );
        let deps = fetch_all(&spec, &State::image("golang")).unwrap().unwrap();
        let populate = stamp_exec(&chain(deps)[0]);
        let script = &populate.args[2];
        assert!(script.ends_with(&format!("date -u > {}", STAMP_FILE)));
        assert!(!script.contains("my src"));
        assert_eq!(populate.cwd, "/work/src/my src; rm -rf x");
    }

    #[test]
    fn edits_run_before_each_download_on_a_private_copy() {
        let spec = parse(
            r#"
name: x
sources:
  src:
    context: {}
    generate:
      - gomod:
          replace:
            - github.com/a/b:github.com/fork/b@v1.2.0
          require:
            - github.com/c/d:github.com/c/d@v0.3.1
"#,
        );
        let deps = fetch_all(&spec, &State::image("golang")).unwrap().unwrap();
        let extract = &chain(deps)[0];
        let populate = stamp_exec(extract);
        let edits = "go mod edit '-replace=github.com/a/b=github.com/fork/b@v1.2.0'; \
                     go mod edit '-require=github.com/c/d@v0.3.1'; go mod tidy; go mod download";

        for exec in [extract.as_ref(), populate.as_ref()] {
            assert!(exec.args[2].contains(edits), "{}", exec.args[2]);
            let source = exec.mounts.iter().find(|m| m.dest == "/work/src/src").unwrap();
            assert!(matches!(source.kind, MountKind::Snapshot { readonly: false, .. }));
        }
        // The edited copy is never the output of either exec
        assert!(matches!(
            extract.mounts.iter().find(|m| m.dest == GOMODCACHE_DIR).map(|m| &m.kind),
            Some(MountKind::Snapshot { readonly: false, .. })
        ));
    }

    #[test]
    fn edit_free_generators_mount_the_source_readonly() {
        let spec = parse(GOMOD_SPEC);
        let deps = fetch_all(&spec, &State::image("golang")).unwrap().unwrap();
        let extract = &chain(deps)[0];
        assert!(!extract.args[2].contains("go mod edit"));
        assert!(!extract.args[2].contains("go mod tidy"));
    }

    #[test]
    fn auth_is_scoped_to_the_networked_phase() {
        let spec = parse(GOMOD_SPEC);
        let deps = fetch_all(&spec, &State::image("golang")).unwrap().unwrap();
        let extract = &chain(deps)[0];
        let populate = stamp_exec(extract);

        assert!(populate.args[2].starts_with(". /tmp/dalec/internal/gomod/git_auth.sh; "));
        assert_eq!(populate.secret_env.len(), 1);
        assert_eq!(populate.secret_env[0].id, "GITHUB_TOKEN");
        assert_eq!(populate.ssh.len(), 1);
        assert_eq!(populate.ssh[0].id, "default");
        assert!(!extract.args[2].contains("git_auth.sh"));
    }

    #[test]
    fn both_phases_share_the_proxy_cache() {
        let spec = parse(GOMOD_SPEC);
        let deps = fetch_all(&spec, &State::image("golang")).unwrap().unwrap();
        let extract = &chain(deps)[0];
        let populate = stamp_exec(extract);
        for exec in [extract.as_ref(), populate.as_ref()] {
            assert!(exec.mounts.iter().any(|m| m.dest == PROXY_CACHE_DIR
                && matches!(&m.kind, MountKind::Cache { key, sharing: CacheSharing::Shared } if key == PROXY_CACHE_KEY)));
        }
    }

    #[test]
    fn sources_are_processed_in_name_order() {
        let spec = parse(
            r#"
name: x
sources:
  zeta:
    context: {}
    generate:
      - gomod: {}
  alpha:
    context:
      name: other
    generate:
      - gomod: {}
"#,
        );
        let deps = fetch_all(&spec, &State::image("golang")).unwrap().unwrap();
        let cwds: Vec<_> = chain(deps).iter().map(|e| e.cwd.clone()).collect();
        assert_eq!(cwds, vec!["/work/src/zeta", "/work/src/alpha"]);
    }

    #[test]
    fn downloads_are_volatile() {
        let spec = parse(GOMOD_SPEC);
        let deps = fetch_all(&spec, &State::image("golang")).unwrap().unwrap();
        assert!(deps.is_volatile());
    }
}
