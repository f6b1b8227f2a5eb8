//! Idempotent container convergence over the remote channel.

use std::process::Output;

use anyhow::Result;
use keel_common::{Endpoint, WorkloadDescriptor};
use tokio_util::sync::CancellationToken;

use crate::application::ports::RemoteExecutor;
use crate::application::services::poll::{Polled, poll_until, retry};
use crate::domain::error::DeployError;
use crate::domain::retry::{PollPolicy, RetryPolicy};
use crate::domain::workload::{
    ContainerAction, ConvergeOutcome, ENSURE_RUNTIME, decide, image_id_command, inspect_command,
    login_command, parse_inspect, pull_command, remove_command, run_command, spec_digest,
    status_command,
};

pub struct ConvergenceAgent<'a, R: RemoteExecutor> {
    remote: &'a R,
    connect_retry: RetryPolicy,
    status_poll: PollPolicy,
    cancel: &'a CancellationToken,
}

impl<'a, R: RemoteExecutor> ConvergenceAgent<'a, R> {
    #[must_use]
    pub fn new(
        remote: &'a R,
        connect_retry: RetryPolicy,
        status_poll: PollPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            remote,
            connect_retry,
            status_poll,
            cancel,
        }
    }

    /// Bring the container on `endpoint` to `workload`.
    ///
    /// A container already running the pulled image with the same spec label
    /// is left alone; nothing is stopped, removed or started.
    ///
    /// # Errors
    ///
    /// Fails with [`DeployError::Connect`] once connection retries are spent,
    /// or [`DeployError::Convergence`] when a remote step fails.
    pub async fn converge(
        &self,
        endpoint: &Endpoint,
        workload: &WorkloadDescriptor,
        registry_password: Option<&str>,
    ) -> Result<ConvergeOutcome> {
        let host = endpoint.address.as_str();

        self.step(host, "ensure container runtime", ENSURE_RUNTIME, None)
            .await?;

        if let Some(creds) = &workload.registry_credentials {
            let password = registry_password.ok_or_else(|| {
                DeployError::Convergence(format!(
                    "registry password not available (set {})",
                    creds.password_env
                ))
            })?;
            self.step(
                host,
                "registry login",
                &login_command(creds),
                Some(password.as_bytes()),
            )
            .await?;
        }

        let image = workload.image_reference.as_str();
        self.step(host, "pull image", &pull_command(image), None).await?;
        let image_id = self
            .step(host, "read image id", &image_id_command(image), None)
            .await?
            .trim()
            .to_string();

        let inspected = self.exec(host, &inspect_command(&workload.container_name), None).await?;
        let current = if inspected.status.success() {
            parse_inspect(&String::from_utf8_lossy(&inspected.stdout))
        } else {
            None
        };

        let spec = spec_digest(workload);
        let action = decide(current.as_ref(), &image_id, &spec);
        tracing::info!(
            host,
            container = %workload.container_name,
            action = action.as_str(),
            "container decision"
        );

        match action {
            ContainerAction::Kept => {}
            ContainerAction::Replaced => {
                self.step(host, "remove container", &remove_command(&workload.container_name), None)
                    .await?;
                self.start(host, workload, &spec).await?;
            }
            ContainerAction::Started => self.start(host, workload, &spec).await?,
        }

        Ok(ConvergeOutcome { action, image_id })
    }

    async fn start(&self, host: &str, workload: &WorkloadDescriptor, spec: &str) -> Result<()> {
        self.step(host, "start container", &run_command(workload, spec), None)
            .await?;

        let command = status_command(&workload.container_name);
        let command = command.as_str();
        let polled = poll_until(&self.status_poll, self.cancel, move || async move {
            match self.remote.exec(host, command).await {
                Ok(out) if out.status.success() => {
                    (String::from_utf8_lossy(&out.stdout).trim() == "running").then_some(())
                }
                _ => None,
            }
        })
        .await?;
        match polled {
            Polled::Ready { .. } => Ok(()),
            Polled::TimedOut { .. } => Err(DeployError::Convergence(format!(
                "container {} did not report running within {}s",
                workload.container_name,
                self.status_poll.timeout.as_secs()
            ))
            .into()),
        }
    }

    /// Run a step that must exit zero; returns its stdout.
    async fn step(
        &self,
        host: &str,
        what: &str,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<String> {
        tracing::debug!(host, step = what, "remote step");
        let output = self.exec(host, command, stdin).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeployError::Convergence(format!("{what}: {}", stderr.trim())).into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn exec(&self, host: &str, command: &str, stdin: Option<&[u8]>) -> Result<Output> {
        retry(
            &self.connect_retry,
            self.cancel,
            "remote exec",
            is_connect_error,
            move || async move {
                match stdin {
                    Some(input) => self.remote.exec_with_stdin(host, command, input).await,
                    None => self.remote.exec(host, command).await,
                }
            },
        )
        .await
    }
}

fn is_connect_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<DeployError>(), Some(DeployError::Connect { .. }))
}
