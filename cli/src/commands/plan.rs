//! `keel plan`: preview the changes a deploy would make.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use keel_common::RunKind;

use crate::app::AppContext;
use crate::commands::run;

#[derive(Args)]
pub struct PlanArgs {
    /// Deployment manifest (YAML)
    #[arg(short, long)]
    pub manifest: PathBuf,
}

/// Run the plan command.
///
/// # Errors
///
/// Returns an error if the manifest or the adapters cannot be loaded.
pub async fn run(app: &AppContext, args: PlanArgs) -> Result<ExitCode> {
    let manifest = run::load_manifest(&args.manifest)?;
    let config = app.config()?;
    let ids = run::identify(app, None, None)?;
    let target = manifest.target.clone();
    let request = run::request(RunKind::Preview, &target, ids, Some(manifest), None);
    run::execute(app, &config, &request).await
}
