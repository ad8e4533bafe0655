//! Source materialization
//!
//! Turns spec sources into graph states and applies patches. A directory
//! source's tree sits at the root of its state; a file source is a single
//! file named after the source.

use crate::error::{DalecError, DalecResult};
use crate::llb::{RunOption, State};
use crate::spec::{PatchSpec, Source, SourceInline, SourceKind, Spec};
use std::collections::BTreeMap;
use tracing::debug;

/// Mount point used for the patch file while applying it
const PATCH_MOUNT: &str = "/tmp/dalec/patch";

/// Build the state holding a source's content
pub fn source_state(name: &str, src: &Source) -> DalecResult<State> {
    let st = match &src.kind {
        SourceKind::Inline(SourceInline::File(file)) => {
            State::scratch().mkfile(format!("/{}", name), file.permissions, file.contents.clone())
        }
        SourceKind::Inline(SourceInline::Dir(dir)) => {
            let mut st = State::scratch().mkdir("/", dir.permissions);
            for (file_name, file) in &dir.files {
                if file_name.contains('/') {
                    return Err(DalecError::User(format!(
                        "source {}: inline file name {} must not contain '/'",
                        name, file_name
                    )));
                }
                st = st.mkfile(format!("/{}", file_name), file.permissions, file.contents.clone());
            }
            st
        }
        SourceKind::Http(http) => State::http(&http.url, http.digest.clone(), name),
        SourceKind::Git(git) => State::git(&git.url, &git.commit, git.keep_git_dir),
        SourceKind::Context(ctx) => {
            State::local(&ctx.name, ctx.includes.clone(), ctx.excludes.clone())
        }
        SourceKind::DockerImage(img) => {
            let mut st = State::image(&img.reference);
            if let Some(cmd) = &img.cmd {
                for (i, step) in cmd.steps.iter().enumerate() {
                    let mut opts = vec![
                        RunOption::shell(step.command.clone()),
                        RunOption::description(format!("source {} step {}", name, i)),
                    ];
                    if let Some(dir) = &cmd.dir {
                        opts.push(RunOption::dir(dir.clone()));
                    }
                    for (k, v) in cmd.env.iter().chain(step.env.iter()) {
                        opts.push(RunOption::env(k, v));
                    }
                    st = st.run(opts).root();
                }
            }
            st
        }
    };

    Ok(match &src.path {
        Some(path) if src.is_dir() && !path.trim_matches('/').is_empty() => {
            State::scratch().copy_from(&st, format!("/{}", path.trim_start_matches('/')), "/")
        }
        _ => st,
    })
}

/// Path of the patch file inside the patch source's state
fn patch_file(spec: &Spec, patch: &PatchSpec) -> DalecResult<String> {
    let src = spec
        .sources
        .get(&patch.source)
        .ok_or_else(|| DalecError::SourceNotFound(patch.source.clone()))?;
    Ok(match (&patch.path, src.is_dir()) {
        (Some(path), true) => format!("/{}", path.trim_start_matches('/')),
        (_, false) => format!("/{}", patch.source),
        (None, true) => {
            return Err(DalecError::User(format!(
                "patch source {} is a directory, path is required",
                patch.source
            )))
        }
    })
}

/// Apply the spec's patches for `name` onto `st` in declared order
pub fn patch_source(spec: &Spec, name: &str, st: State, worker: &State) -> DalecResult<State> {
    let Some(patches) = spec.patches.get(name) else {
        return Ok(st);
    };

    let mut st = st;
    for patch in patches {
        let patch_src = spec
            .sources
            .get(&patch.source)
            .ok_or_else(|| DalecError::SourceNotFound(patch.source.clone()))?;
        let patch_st = source_state(&patch.source, patch_src)?;
        let file = patch_file(spec, patch)?;
        debug!("Patching {} with {}{}", name, patch.source, file);

        st = worker
            .run([
                RunOption::shell(format!("patch -p{} < {}", patch.strip(), PATCH_MOUNT)),
                RunOption::readonly_selected(PATCH_MOUNT, patch_st, file),
                RunOption::dir("/src"),
                RunOption::description(format!("apply patch {} to {}", patch.source, name)),
            ])
            .add_mount("/src", st);
    }
    Ok(st)
}

/// Patched states of the sources accepted by `filter`, sorted by name
pub fn patched_sources<F>(spec: &Spec, worker: &State, filter: F) -> DalecResult<BTreeMap<String, State>>
where
    F: Fn(&str, &Source) -> bool,
{
    let mut out = BTreeMap::new();
    for (name, src) in &spec.sources {
        if !filter(name, src) {
            continue;
        }
        let st = source_state(name, src)?;
        out.insert(name.clone(), patch_source(spec, name, st, worker)?);
    }
    Ok(out)
}

/// Mount option placing a source at `dest`
pub fn mount_source(dest: impl Into<String>, name: &str, src: &Source, st: State) -> RunOption {
    if src.is_dir() {
        RunOption::readonly_mount(dest, st)
    } else {
        RunOption::readonly_selected(dest, st, format!("/{}", name))
    }
}
