//! `keel deploy` and `keel destroy`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use keel_common::{RunKind, validate_target_key};

use crate::app::AppContext;
use crate::commands::run;

#[derive(Args)]
pub struct DeployArgs {
    /// Deployment manifest (YAML)
    #[arg(short, long)]
    pub manifest: PathBuf,

    /// Resume a run (e.g. one that was waiting for approval)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Expected acting identity; refused unless it equals KEEL_ACTOR (or USER)
    #[arg(long)]
    pub initiator: Option<String>,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Target whose recorded resources are torn down
    pub target: String,

    /// Resume a run (e.g. one that was waiting for approval)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Expected acting identity; refused unless it equals KEEL_ACTOR (or USER)
    #[arg(long)]
    pub initiator: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Converge infrastructure and roll out the workload.
///
/// # Errors
///
/// Returns an error if the manifest, identity or adapters cannot be resolved.
pub async fn deploy(app: &AppContext, args: DeployArgs) -> Result<ExitCode> {
    let manifest = run::load_manifest(&args.manifest)?;
    let password = run::registry_password(&manifest)?;
    let config = app.config()?;
    let ids = run::identify(app, args.run_id, args.initiator)?;
    let target = manifest.target.clone();
    let request = run::request(RunKind::Deploy, &target, ids, Some(manifest), password);
    run::execute(app, &config, &request).await
}

/// Tear down everything recorded for a target.
///
/// # Errors
///
/// Returns an error if the target or identity is invalid or the adapters
/// cannot be set up.
pub async fn destroy(app: &AppContext, args: DestroyArgs) -> Result<ExitCode> {
    validate_target_key(&args.target)?;
    if !args.yes
        && !app.confirm(
            &format!("Destroy all resources recorded for '{}'?", args.target),
            false,
        )?
    {
        app.output.info("Aborted.");
        return Ok(ExitCode::SUCCESS);
    }
    let config = app.config()?;
    let ids = run::identify(app, args.run_id, args.initiator)?;
    let request = run::request(RunKind::Destroy, &args.target, ids, None, None);
    run::execute(app, &config, &request).await
}
