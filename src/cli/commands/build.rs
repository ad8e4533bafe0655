//! Build command - build a spec for one target

use crate::build::{build_worker, plan_build};
use crate::cache::host_platform;
use crate::cli::args::BuildArgs;
use crate::cli::commands::{build_session, load_spec, run_with_progress};
use crate::config::Config;
use crate::error::DalecResult;
use crate::repo::distro;
use tracing::{debug, info};

pub async fn execute(args: BuildArgs, config: &Config) -> DalecResult<()> {
    let spec = load_spec(&args.spec, &args.build_args).await?;
    let distro = distro::lookup(&args.target)?;

    let worker = build_worker(&spec, distro, config.worker_image(distro.key))?;
    let plan = plan_build(&spec, distro, &worker, &host_platform())?;
    for cache in &plan.caches {
        debug!("Cache {} at {} ({})", cache.key, cache.dest, cache.sharing);
    }

    let session = build_session(args.session, &spec).await?;
    info!("Building {} for {} in session {}", spec.name, distro.key, session.id());

    run_with_progress(
        config,
        &format!("Building {} for {}", spec.name, distro.key),
        &plan.output,
        &session,
        &args.output,
    )
    .await
}
