//! go.mod edits from gomod `replace` and `require` entries
//!
//! The same edits run twice: in the download execs, so the fetched module
//! tree matches the edited module graph, and once from the source root
//! before the build steps, so the build sees the edited go.mod files.

use crate::error::{DalecError, DalecResult};
use crate::gomod::fetch::module_rel_dir;
use crate::spec::{GomodGenerator, Spec};
use std::fmt::Write as _;

/// Quote `s` for `/bin/sh`
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// One `go mod edit` command per replace and require entry
pub fn edit_commands(generator: &GomodGenerator) -> DalecResult<Vec<String>> {
    let flags = generator
        .edit_flags()
        .map_err(|e| DalecError::SpecInvalid { errors: vec![e] })?;
    Ok(flags
        .iter()
        .map(|flag| format!("go mod edit {}", shell_quote(flag)))
        .collect())
}

/// Script applying every gomod edit of `spec`, run from the source root
///
/// Sources are visited in name order and paths without a go.mod are
/// skipped. Returns `None` when no generator declares edits.
pub fn gomod_edit_script(spec: &Spec) -> DalecResult<Option<String>> {
    let mut script = String::new();

    for (name, src) in spec.gomod_sources() {
        if !src.is_dir() {
            continue;
        }
        for generator in src.gomod_generators().filter(|g| g.has_edits()) {
            let commands = edit_commands(generator)?;
            for path in &generator.paths {
                let rel = shell_quote(&module_rel_dir(name, &generator.subpath, path));
                let _ = writeln!(script, "if [ -f {}/go.mod ]; then", rel);
                let _ = writeln!(script, "  (");
                let _ = writeln!(script, "    cd {}", rel);
                for cmd in &commands {
                    let _ = writeln!(script, "    {}", cmd);
                }
                let _ = writeln!(script, "    go mod tidy");
                let _ = writeln!(script, "    go mod download");
                let _ = writeln!(script, "  )");
                let _ = writeln!(script, "fi");
            }
        }
    }

    if script.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!("set -e\n{}", script)))
    }
}
