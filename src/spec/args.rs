//! Build argument substitution
//!
//! Args are declared in the spec's `args` map with default values and may
//! be overridden from the command line. `$NAME` and `${NAME}` references
//! are expanded in git source URLs, gomod auth hosts and gomod
//! replace/require entries. A reference to an undeclared arg is kept as
//! written and reported.

use crate::error::{DalecError, DalecResult};
use crate::spec::{SourceKind, Spec};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Result of expanding one string
#[derive(Debug, PartialEq, Eq)]
struct Expanded {
    value: String,
    unmatched: BTreeSet<String>,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Expand `$NAME` and `${NAME}` from `args`; `\$` is a literal dollar
fn expand(input: &str, args: &BTreeMap<String, String>) -> Expanded {
    let mut value = String::with_capacity(input.len());
    let mut unmatched = BTreeSet::new();
    let mut chars = input.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some((_, '$'))) => {
                value.push('$');
                chars.next();
            }
            '$' => {
                let rest = &input[i + 1..];
                let (name, raw_len) = if let Some(braced) = rest.strip_prefix('{') {
                    match braced.find('}') {
                        Some(end) if braced[..end].chars().all(is_name_char) => {
                            (&braced[..end], end + 2)
                        }
                        _ => ("", 0),
                    }
                } else {
                    let end = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
                    (&rest[..end], end)
                };

                if name.is_empty() {
                    value.push('$');
                    continue;
                }
                match args.get(name) {
                    Some(v) => value.push_str(v),
                    None => {
                        value.push_str(&input[i..i + 1 + raw_len]);
                        unmatched.insert(name.to_string());
                    }
                }
                // Skip the consumed reference
                let skip_to = i + 1 + raw_len;
                while chars.peek().is_some_and(|(j, _)| *j < skip_to) {
                    chars.next();
                }
            }
            c => value.push(c),
        }
    }

    Expanded { value, unmatched }
}

impl Spec {
    /// Substitute build args; `overrides` replace declared defaults
    ///
    /// Every undeclared reference is reported in one error.
    pub fn substitute_args(&mut self, overrides: &[(String, String)]) -> DalecResult<()> {
        let mut values = self.args.clone();
        for (key, value) in overrides {
            if values.contains_key(key) {
                values.insert(key.clone(), value.clone());
            } else {
                warn!("Ignoring build arg {} not declared in spec {}", key, self.name);
            }
        }

        let mut errors = Vec::new();
        let mut check = |context: &str, expanded: &Expanded| {
            for name in &expanded.unmatched {
                errors.push(format!("{}: build arg \"{}\" not declared", context, name));
            }
        };

        for (name, src) in self.sources.iter_mut() {
            if let SourceKind::Git(git) = &mut src.kind {
                let expanded = expand(&git.url, &values);
                check(&format!("source {} git url", name), &expanded);
                git.url = expanded.value;
            }

            for gomod in src.gomod_generators_mut() {
                let auth = std::mem::take(&mut gomod.auth);
                for (host, method) in auth {
                    let expanded = expand(&host, &values);
                    check(&format!("source {} gomod auth host {}", name, host), &expanded);
                    if expanded.value != host {
                        debug!("Expanded gomod auth host {} to {}", host, expanded.value);
                    }
                    gomod.auth.insert(expanded.value, method);
                }

                for entry in gomod.replace.iter_mut().chain(gomod.require.iter_mut()) {
                    let expanded = expand(entry, &values);
                    check(&format!("source {} gomod edit {}", name, entry), &expanded);
                    *entry = expanded.value;
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DalecError::SpecInvalid { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::tests::parse;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn expands_both_reference_forms() {
        let a = args(&[("HOST", "git.example.com"), ("PORT", "2222")]);
        let e = expand("${HOST}:$PORT/x", &a);
        assert_eq!(e.value, "git.example.com:2222/x");
        assert!(e.unmatched.is_empty());
    }

    #[test]
    fn unresolved_references_are_kept() {
        let e = expand("${MISSING}.com and $OTHER", &BTreeMap::new());
        assert_eq!(e.value, "${MISSING}.com and $OTHER");
        assert_eq!(e.unmatched.into_iter().collect::<Vec<_>>(), vec!["MISSING", "OTHER"]);
    }

    #[test]
    fn escaped_and_bare_dollars_are_literal() {
        let e = expand("a\\$B $ c${", &args(&[("B", "x")]));
        assert_eq!(e.value, "a$B $ c${");
        assert!(e.unmatched.is_empty());
    }

    const ARG_SPEC: &str = r#"
name: x
args:
  PRIVATE_HOST: git.internal
  VERSION: v1.2.0
sources:
  src:
    git:
      url: https://${PRIVATE_HOST}/app.git
      commit: abc
    generate:
      - gomod:
          auth:
            ${PRIVATE_HOST}:
              token: TKN
            github.com:
              token: GH
          replace:
            - github.com/a/b:github.com/fork/b@${VERSION}
          require:
            - github.com/c/d:github.com/c/d@${VERSION}
"#;

    #[test]
    fn declared_args_expand_hosts_and_edits() {
        let mut spec = parse(ARG_SPEC);
        spec.substitute_args(&[]).unwrap();
        let src = &spec.sources["src"];
        let SourceKind::Git(git) = &src.kind else {
            panic!("expected git source");
        };
        assert_eq!(git.url, "https://git.internal/app.git");

        let gomod = src.gomod_generators().next().unwrap();
        assert_eq!(
            gomod.auth.keys().collect::<Vec<_>>(),
            vec!["git.internal", "github.com"]
        );
        assert_eq!(gomod.replace, vec!["github.com/a/b:github.com/fork/b@v1.2.0"]);
        assert_eq!(gomod.require, vec!["github.com/c/d:github.com/c/d@v1.2.0"]);
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut spec = parse(ARG_SPEC);
        spec.substitute_args(&[
            ("PRIVATE_HOST".into(), "git.corp:8443".into()),
            ("UNDECLARED".into(), "ignored".into()),
        ])
        .unwrap();
        let gomod = spec.sources["src"].gomod_generators().next().unwrap();
        assert!(gomod.auth.contains_key("git.corp:8443"));
        assert!(!gomod.auth.contains_key("${PRIVATE_HOST}"));
    }

    #[test]
    fn undeclared_reference_is_reported() {
        let mut spec = parse(
            "name: x\nsources:\n  src:\n    context: {}\n    generate:\n      - gomod:\n          auth:\n            ${NOPE}:\n              token: T\n",
        );
        let err = spec.substitute_args(&[]).unwrap_err().to_string();
        assert!(err.contains("build arg \"NOPE\" not declared"));
        let gomod = spec.sources["src"].gomod_generators().next().unwrap();
        assert!(gomod.auth.contains_key("${NOPE}"));
    }
}
