//! Shared execution path of `keel plan`, `keel deploy` and `keel destroy`.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use keel_common::{RunKind, validate_actor, validate_run_id};

use crate::app::AppContext;
use crate::application::services::orchestrator::{Orchestrator, RunRequest, RunSettings};
use crate::domain::bootstrap::generate_run_id;
use crate::domain::config::KeelConfig;
use crate::domain::manifest::{DeploymentManifest, parse_manifest};
use crate::output::{TerminalReporter, json};

/// Read and validate a deployment manifest.
///
/// # Errors
///
/// Returns an error if the file cannot be read or fails validation.
pub fn load_manifest(path: &Path) -> Result<DeploymentManifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read manifest {}", path.display()))?;
    parse_manifest(&content).with_context(|| format!("invalid manifest {}", path.display()))
}

/// Registry password for the workload, from the env var the manifest names.
///
/// # Errors
///
/// Returns an error when credentials are declared but the variable is unset.
pub fn registry_password(manifest: &DeploymentManifest) -> Result<Option<String>> {
    let Some(creds) = &manifest.workload.registry_credentials else {
        return Ok(None);
    };
    let password = std::env::var(&creds.password_env).with_context(|| {
        format!(
            "registry credentials for {} need the password in ${}",
            creds.registry, creds.password_env
        )
    })?;
    Ok(Some(password))
}

/// Resolve `--run-id` (or mint one) and the initiator, which is always the
/// acting identity.
///
/// # Errors
///
/// Returns an error if either value is malformed or `--initiator` names
/// someone other than the acting identity.
pub fn identify(
    app: &AppContext,
    run_id: Option<String>,
    initiator: Option<String>,
) -> Result<(String, String)> {
    let run_id = match run_id {
        Some(id) => {
            validate_run_id(&id)?;
            id
        }
        None => generate_run_id(),
    };
    let actor = app.actor()?;
    // The initiator is always the acting identity.
    let initiator = match initiator {
        Some(who) if who != actor => {
            anyhow::bail!("--initiator {who} does not match the acting identity {actor}")
        }
        _ => actor.to_string(),
    };
    validate_actor(&initiator)?;
    Ok((run_id, initiator))
}

/// Build a request for `kind` against `target`.
#[must_use]
pub fn request(
    kind: RunKind,
    target: &str,
    ids: (String, String),
    manifest: Option<DeploymentManifest>,
    registry_password: Option<String>,
) -> RunRequest {
    let (run_id, initiator) = ids;
    RunRequest {
        run_id,
        kind,
        target: target.to_string(),
        initiator,
        manifest,
        registry_password,
    }
}

/// Drive one run with the production adapters and render its report.
///
/// # Errors
///
/// Returns an error only when the adapters cannot be set up; run failures
/// are reported and mapped to a failure exit code.
pub async fn execute(app: &AppContext, config: &KeelConfig, request: &RunRequest) -> Result<ExitCode> {
    let store = app.open_store(config)?;
    let adapters = app.run_adapters(config)?;
    let settings = RunSettings::from_config(config, &request.target);

    let report = {
        let reporter = TerminalReporter::new(&app.output);
        let orchestrator = Orchestrator::new(
            &store,
            &adapters.provider,
            &adapters.remote,
            &adapters.prober,
            &reporter,
            settings,
            &app.cancel,
        );
        orchestrator.run(request).await
    };

    if app.is_json() {
        json::print(&report)?;
    } else {
        app.renderer().render_report(&report);
    }
    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
