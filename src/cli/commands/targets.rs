//! Targets command - list supported distro targets

use crate::cli::args::OutputFormat;
use crate::config::Config;
use crate::error::DalecResult;
use crate::repo::{distro, Distro};
use console::style;

pub async fn execute(format: OutputFormat, config: &Config) -> DalecResult<()> {
    let targets = distro::all();
    match format {
        OutputFormat::Table => print_table(targets, config),
        OutputFormat::Json => print_json(targets, config)?,
        OutputFormat::Plain => {
            for target in targets {
                println!("{}", target.key);
            }
        }
    }
    Ok(())
}

fn print_table(targets: &[Distro], config: &Config) {
    println!("{:<14} {:<8} {:<6} {:<40}", "TARGET", "FAMILY", "PM", "WORKER");
    println!("{}", "-".repeat(70));
    for target in targets {
        let worker = match config.worker_image(target.key) {
            Some(image) => style(image.to_string()).yellow().to_string(),
            None => target.worker_image.to_string(),
        };
        println!(
            "{:<14} {:<8} {:<6} {:<40}",
            target.key,
            target.family.to_string(),
            target.package_manager.binary(),
            worker
        );
    }
}

fn print_json(targets: &[Distro], config: &Config) -> DalecResult<()> {
    #[derive(serde::Serialize)]
    struct TargetJson<'a> {
        target: &'a str,
        family: String,
        package_manager: &'a str,
        worker_image: &'a str,
    }

    let json: Vec<TargetJson> = targets
        .iter()
        .map(|t| TargetJson {
            target: t.key,
            family: t.family.to_string(),
            package_manager: t.package_manager.binary(),
            worker_image: config.worker_image(t.key).unwrap_or(t.worker_image),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
