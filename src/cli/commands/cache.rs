//! Cache command - inspect and manage build caches

use crate::cache::{caches_for_build, format_bytes, host_platform, CacheMountSpec, CacheOrigin, CacheVolume};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::cli::commands::load_spec;
use crate::config::Config;
use crate::engine::{create_engine, Engine};
use crate::error::DalecResult;
use crate::repo::distro;
use console::style;
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;

pub async fn execute(args: CacheArgs, config: &Config) -> DalecResult<()> {
    match args.action {
        CacheAction::Plan {
            spec,
            target,
            platform,
            format,
        } => plan(&spec, &target, platform, format).await,
        CacheAction::List { format } => {
            let engine = create_engine(config, None)?;
            list_caches(&*engine, format).await
        }
        CacheAction::Clear { key_prefix, yes } => {
            let engine = create_engine(config, None)?;
            clear_caches(&*engine, key_prefix.as_deref(), yes).await
        }
    }
}

/// Show the resolved cache mounts for a spec and target
async fn plan(spec: &Path, target: &str, platform: Option<String>, format: OutputFormat) -> DalecResult<()> {
    let spec = load_spec(spec, &[]).await?;
    let distro = distro::lookup(target)?;
    let platform = platform.unwrap_or_else(host_platform);
    let mounts = caches_for_build(&spec, distro.key, &platform);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&mounts)?),
        OutputFormat::Plain => {
            for m in &mounts {
                println!("{}", m.key);
            }
        }
        OutputFormat::Table => print_plan_table(&mounts),
    }
    Ok(())
}

fn print_plan_table(mounts: &[CacheMountSpec]) {
    if mounts.is_empty() {
        println!("No cache mounts.");
        return;
    }

    println!("{:<8} {:<50} {:<28} {:<8} {:<10}", "KIND", "KEY", "DEST", "SHARING", "ORIGIN");
    println!("{}", "-".repeat(108));
    for m in mounts {
        let origin = match m.origin {
            CacheOrigin::Config(i) => format!("caches[{}]", i),
            CacheOrigin::Auto(_) => style("auto").cyan().to_string(),
        };
        println!(
            "{:<8} {:<50} {:<28} {:<8} {:<10}",
            m.kind,
            m.key,
            m.dest,
            m.sharing.to_string(),
            origin
        );
        for (k, v) in &m.env {
            println!("{:<8} {} {}={}", "", style("env").dim(), k, v);
        }
        for path in m.files.keys() {
            println!("{:<8} {} {}", "", style("file").dim(), path);
        }
    }
}

/// List persistent cache volumes
async fn list_caches(engine: &dyn Engine, format: OutputFormat) -> DalecResult<()> {
    let caches = engine.cache_volumes().await?;

    if caches.is_empty() {
        println!("No cache volumes found.");
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_cache_table(&caches),
        OutputFormat::Json => print_cache_json(&caches)?,
        OutputFormat::Plain => {
            for cache in &caches {
                println!("{}", cache.name);
            }
        }
    }
    Ok(())
}

fn print_cache_table(caches: &[CacheVolume]) {
    println!("{:<30} {:<50} {:<8} {:<10} {:<17}", "VOLUME", "KEY", "SHARING", "SIZE", "CREATED");
    println!("{}", "-".repeat(118));

    for cache in caches {
        let size = cache
            .size_bytes
            .map(format_bytes)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<30} {:<50} {:<8} {:<10} {:<17}",
            cache.name,
            cache.key,
            cache.sharing.to_string(),
            size,
            cache.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Total: {} cache(s)", caches.len());
}

fn print_cache_json(caches: &[CacheVolume]) -> DalecResult<()> {
    #[derive(serde::Serialize)]
    struct CacheJson<'a> {
        name: &'a str,
        key: &'a str,
        sharing: String,
        created_at: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    }

    let json: Vec<CacheJson> = caches
        .iter()
        .map(|c| CacheJson {
            name: &c.name,
            key: &c.key,
            sharing: c.sharing.to_string(),
            created_at: c.created_at.to_rfc3339(),
            size_bytes: c.size_bytes,
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// Remove cache volumes, optionally only those with a key prefix
async fn clear_caches(engine: &dyn Engine, key_prefix: Option<&str>, skip_confirm: bool) -> DalecResult<()> {
    let caches: Vec<CacheVolume> = engine
        .cache_volumes()
        .await?
        .into_iter()
        .filter(|c| key_prefix.is_none_or(|p| c.key.starts_with(p)))
        .collect();

    if caches.is_empty() {
        println!("No cache volumes to clear.");
        return Ok(());
    }

    println!("This will remove {} cache volume(s):", caches.len());
    for cache in &caches {
        println!("  {} {} ({})", style("•").red(), cache.name, cache.key);
    }
    println!();

    if !skip_confirm {
        print!("Are you sure? [y/N] ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            println!("Failed to read input, aborting.");
            return Ok(());
        }
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let mut removed = 0;
    for cache in caches {
        debug!("Removing cache: {}", cache.name);
        engine.remove_cache_volume(&cache.name).await?;
        removed += 1;
    }

    println!("{} cleared {} cache(s)", style("✓").green(), removed);
    Ok(())
}
