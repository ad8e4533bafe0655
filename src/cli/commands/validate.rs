//! Validate command - parse a spec and report every problem

use crate::cli::args::ValidateArgs;
use crate::cli::commands::load_spec;
use crate::error::DalecResult;
use console::style;

pub async fn execute(args: ValidateArgs) -> DalecResult<()> {
    let spec = load_spec(&args.spec, &args.build_args).await?;
    println!(
        "{} {} is valid ({} source(s), {} build step(s))",
        style("✓").green(),
        spec.name,
        spec.sources.len(),
        spec.build.steps.len()
    );
    Ok(())
}
