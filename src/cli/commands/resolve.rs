//! Resolve command - show dependencies in a target's native syntax

use crate::cli::args::{OutputFormat, ResolveArgs};
use crate::cli::commands::load_spec;
use crate::error::DalecResult;
use crate::repo::{distro, format_dependency, parse_all, select_version, Distro};
use crate::spec::{PackageConstraints, Spec};
use console::style;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Serialize)]
struct ResolvedDep {
    kind: &'static str,
    package: String,
    /// Arguments handed to the package manager
    install: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    selected: Option<String>,
}

fn resolve(
    spec: &Spec,
    distro: &Distro,
    available: &HashMap<String, Vec<String>>,
) -> DalecResult<Vec<ResolvedDep>> {
    let groups: [(&'static str, BTreeMap<String, PackageConstraints>); 3] = [
        ("build", spec.build_deps(distro.key)),
        ("runtime", spec.runtime_deps(distro.key)),
        ("test", spec.test_deps(distro.key)),
    ];

    let mut resolved = Vec::new();
    for (kind, deps) in groups {
        for (name, constraints) in deps {
            let selected = match available.get(&name) {
                Some(candidates) => {
                    let parsed = parse_all(&constraints)?;
                    Some(
                        select_version(candidates, &parsed)
                            .map(String::from)
                            .unwrap_or_default(),
                    )
                }
                None => None,
            };
            resolved.push(ResolvedDep {
                kind,
                install: format_dependency(distro.family, &name, &constraints)?,
                package: name,
                selected,
            });
        }
    }
    Ok(resolved)
}

pub async fn execute(args: ResolveArgs) -> DalecResult<()> {
    let spec = load_spec(&args.spec, &[]).await?;
    let distro = distro::lookup(&args.target)?;
    let available: HashMap<String, Vec<String>> = args.available.into_iter().collect();
    let deps = resolve(&spec, distro, &available)?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&deps)?),
        OutputFormat::Plain => {
            for dep in &deps {
                for arg in &dep.install {
                    println!("{}: {}", dep.kind, arg);
                }
            }
        }
        OutputFormat::Table => {
            println!("{:<8} {:<24} {:<40} {:<12}", "KIND", "PACKAGE", "INSTALL", "SELECTED");
            println!("{}", "-".repeat(86));
            for dep in &deps {
                let selected = match dep.selected.as_deref() {
                    Some("") => style("none".to_string()).red().to_string(),
                    Some(v) => style(v.to_string()).green().to_string(),
                    None => "-".to_string(),
                };
                println!(
                    "{:<8} {:<24} {:<40} {:<12}",
                    dep.kind,
                    dep.package,
                    dep.install.join("; "),
                    selected
                );
            }
        }
    }
    Ok(())
}
