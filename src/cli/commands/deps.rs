//! Deps command - fetch go modules and export the module cache tree

use crate::build::build_worker;
use crate::cli::args::DepsArgs;
use crate::cli::commands::{build_session, load_spec, run_with_progress};
use crate::config::Config;
use crate::error::DalecResult;
use crate::gomod::fetch_all;
use crate::repo::distro;
use console::style;

pub async fn execute(args: DepsArgs, config: &Config) -> DalecResult<()> {
    let spec = load_spec(&args.spec, &args.build_args).await?;
    let distro = distro::lookup(&args.target)?;
    let worker = build_worker(&spec, distro, config.worker_image(distro.key))?;

    let Some(modules) = fetch_all(&spec, &worker)? else {
        println!("{} {} has no gomod sources", style("!").yellow(), spec.name);
        return Ok(());
    };

    let session = build_session(args.session, &spec).await?;
    run_with_progress(
        config,
        &format!("Fetching go modules for {}", spec.name),
        &modules,
        &session,
        &args.output,
    )
    .await
}
