//! `keel unlock`: break-glass removal of a target lock.

use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use keel_common::validate_target_key;

use crate::app::AppContext;
use crate::application::ports::LockManager;
use crate::output::json;

#[derive(Args)]
pub struct UnlockArgs {
    /// Target key
    pub target: String,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Run the unlock command.
///
/// # Errors
///
/// Returns an error if the target key is invalid or the store is unreadable.
pub async fn run(app: &AppContext, args: UnlockArgs) -> Result<ExitCode> {
    validate_target_key(&args.target)?;
    let config = app.config()?;
    let store = app.open_store(&config)?;

    let Some(lock) = store.current_lock(&args.target).await? else {
        if app.is_json() {
            json::print(&serde_json::json!({ "target": args.target, "released": false }))?;
        } else {
            app.output.info(&format!("{} is not locked", args.target));
        }
        return Ok(ExitCode::SUCCESS);
    };

    if !lock.is_expired_at(Utc::now()) && !args.yes {
        let prompt = format!(
            "{} is locked by {} until {}. A run may still be active. Remove the lock?",
            args.target,
            lock.holder_id,
            lock.expires_at().format("%Y-%m-%d %H:%M:%S UTC")
        );
        if !app.confirm(&prompt, false)? {
            app.output.info("Aborted.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let released = store.force_release(&args.target).await?;
    tracing::warn!(target_key = %args.target, holder = %lock.holder_id, "lock force-released");
    if app.is_json() {
        json::print(&serde_json::json!({
            "target": args.target,
            "released": released,
            "holder": lock.holder_id,
        }))?;
    } else if released {
        app.output
            .success(&format!("Removed lock held by {}", lock.holder_id));
    }
    Ok(ExitCode::SUCCESS)
}
