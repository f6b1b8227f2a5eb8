//! `keel status`: stored snapshot, lock and recent runs of a target.

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::app::AppContext;
use crate::application::services::status::target_status;
use crate::output::json;

#[derive(Args)]
pub struct StatusArgs {
    /// Target key
    pub target: String,
}

/// Run the status command.
///
/// # Errors
///
/// Returns an error if the target key is invalid or the store is unreadable.
pub async fn run(app: &AppContext, args: StatusArgs) -> Result<ExitCode> {
    let config = app.config()?;
    let store = app.open_store(&config)?;
    let status = target_status(&store, &args.target).await?;
    if app.is_json() {
        json::print(&status)?;
    } else {
        app.renderer().render_status(&status);
    }
    Ok(ExitCode::SUCCESS)
}
