//! `keel approve` / `keel reject`: decide on a run awaiting approval.

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use keel_common::Verdict;

use crate::app::AppContext;
use crate::application::services::decision;
use crate::output::json;

#[derive(Args)]
pub struct DecisionArgs {
    /// Run id printed by the waiting run
    pub run_id: String,

    /// Note stored with the decision
    #[arg(long)]
    pub comment: Option<String>,
}

/// Record the acting identity's verdict.
///
/// # Errors
///
/// Returns an error if the run is not waiting, the actor may not decide on
/// it, or the actor already decided.
pub async fn run(app: &AppContext, args: DecisionArgs, verdict: Verdict) -> Result<ExitCode> {
    let config = app.config()?;
    let store = app.open_store(&config)?;
    let actor = app.actor()?;
    let recorded = decision::decide(&store, &args.run_id, actor, verdict, args.comment).await?;
    if app.is_json() {
        json::print(&recorded)?;
    } else {
        app.renderer().render_decision(&recorded);
    }
    Ok(ExitCode::SUCCESS)
}
