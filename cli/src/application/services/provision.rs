//! Change-set application against the cloud provider.
//!
//! Operations run strictly in change-set order. Each provider call is
//! retried on transient errors; the first terminal error stops the apply and
//! the resources created so far are handed back so they can be persisted.

use anyhow::Result;
use keel_common::{
    Action, ChangeOp, ChangeSet, InstanceLifecycle, InstanceParams, InstanceRecord,
    ProvisionedResources, ResourceKind, ResourceParams,
};
use tokio_util::sync::CancellationToken;

use crate::application::ports::CloudProvider;
use crate::application::services::poll::{Polled, poll_until, retry_transient};
use crate::domain::error::{DeployError, ProviderError};
use crate::domain::retry::{PollPolicy, RetryPolicy};

/// An apply that stopped early. `partial` holds every resource known to
/// exist at the provider when it stopped.
#[derive(Debug)]
pub struct ApplyFailure {
    pub error: anyhow::Error,
    pub partial: ProvisionedResources,
}

pub struct Provisioner<'a, P: CloudProvider> {
    provider: &'a P,
    retry: RetryPolicy,
    instance_poll: PollPolicy,
    cancel: &'a CancellationToken,
}

impl<'a, P: CloudProvider> Provisioner<'a, P> {
    #[must_use]
    pub fn new(
        provider: &'a P,
        retry: RetryPolicy,
        instance_poll: PollPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            provider,
            retry,
            instance_poll,
            cancel,
        }
    }

    /// Apply `changes` on top of `base` and return the resulting resources.
    ///
    /// # Errors
    ///
    /// Returns an [`ApplyFailure`] carrying the partial resource set.
    pub async fn apply(
        &self,
        target: &str,
        changes: &ChangeSet,
        base: &ProvisionedResources,
    ) -> Result<ProvisionedResources, ApplyFailure> {
        let mut resources = base.clone();
        for op in &changes.operations {
            if op.action == Action::Noop {
                continue;
            }
            tracing::info!(
                target_key = target,
                resource = %op.resource_kind,
                action = op.action.as_str(),
                "applying change"
            );
            if let Err(error) = self.apply_op(target, op, &mut resources).await {
                return Err(ApplyFailure {
                    error: error.context(format!(
                        "{} {} failed",
                        op.action.as_str(),
                        op.resource_kind
                    )),
                    partial: resources,
                });
            }
        }
        Ok(resources)
    }

    async fn apply_op(
        &self,
        target: &str,
        op: &ChangeOp,
        resources: &mut ProvisionedResources,
    ) -> Result<()> {
        match (op.action, &op.params) {
            (Action::Destroy, ResourceParams::Existing { id }) => {
                self.destroy(op.resource_kind, id).await?;
                match op.resource_kind {
                    ResourceKind::CredentialPair => resources.credential_pair = None,
                    ResourceKind::NetworkPolicy => resources.network_policy = None,
                    ResourceKind::Instance => resources.instance = None,
                }
                Ok(())
            }
            (Action::Create, ResourceParams::CredentialPair(credential)) => {
                let record = retry_transient(&self.retry, self.cancel, "import key pair", || {
                    self.provider.import_key_pair(target, credential)
                })
                .await?;
                resources.credential_pair = Some(record);
                Ok(())
            }
            (Action::Create, ResourceParams::NetworkPolicy { name, ingress }) => {
                let group = retry_transient(&self.retry, self.cancel, "create security group", || {
                    self.provider.create_security_group(target, name)
                })
                .await?;
                resources.network_policy = Some(group.clone());
                let updated = retry_transient(&self.retry, self.cancel, "authorize ingress", || {
                    self.provider.update_security_group(&group, ingress)
                })
                .await?;
                resources.network_policy = Some(updated);
                Ok(())
            }
            (Action::Update, ResourceParams::NetworkPolicy { ingress, .. }) => {
                let current = resources.network_policy.clone().ok_or_else(|| {
                    anyhow::anyhow!("no recorded network policy to update")
                })?;
                let updated = retry_transient(&self.retry, self.cancel, "update ingress", || {
                    self.provider.update_security_group(&current, ingress)
                })
                .await?;
                resources.network_policy = Some(updated);
                Ok(())
            }
            (Action::Create, ResourceParams::Instance(params)) => {
                self.create_instance(target, params, resources).await
            }
            (action, _) => anyhow::bail!(
                "unsupported change: {} {}",
                action.as_str(),
                op.resource_kind
            ),
        }
    }

    async fn create_instance(
        &self,
        target: &str,
        params: &InstanceParams,
        resources: &mut ProvisionedResources,
    ) -> Result<()> {
        let policy_id = resources.network_policy.as_ref().map(|p| p.id.clone());
        let launched = retry_transient(&self.retry, self.cancel, "run instance", || {
            self.provider
                .run_instance(target, params, policy_id.as_deref())
        })
        .await?;
        let id = launched.id.clone();
        resources.instance = Some(launched);

        let running = self.wait_for_instance(&id, is_running).await?;
        match running {
            Some(record) => {
                tracing::info!(instance_id = %record.id, address = ?record.address, "instance running");
                resources.instance = Some(record);
                Ok(())
            }
            None => Err(DeployError::Timeout {
                what: format!("instance {id} reaching running state"),
                secs: self.instance_poll.timeout.as_secs(),
            }
            .into()),
        }
    }

    async fn destroy(&self, kind: ResourceKind, id: &str) -> Result<()> {
        let result = match kind {
            ResourceKind::CredentialPair => {
                retry_transient(&self.retry, self.cancel, "delete key pair", || {
                    self.provider.delete_key_pair(id)
                })
                .await
            }
            ResourceKind::NetworkPolicy => {
                retry_transient(&self.retry, self.cancel, "delete security group", || {
                    self.provider.delete_security_group(id)
                })
                .await
            }
            ResourceKind::Instance => {
                retry_transient(&self.retry, self.cancel, "terminate instance", || {
                    self.provider.terminate_instance(id)
                })
                .await
            }
        };
        match result {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                tracing::info!(resource = %kind, id, "already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if kind == ResourceKind::Instance {
            // Dependent groups cannot be deleted until the instance is gone.
            if self.wait_for_instance(id, is_gone).await?.is_none() {
                return Err(DeployError::Timeout {
                    what: format!("instance {id} terminating"),
                    secs: self.instance_poll.timeout.as_secs(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Poll `describe_instance` until `done` accepts the answer. Transient
    /// errors keep polling; `Ok(None)` means the deadline passed.
    async fn wait_for_instance(
        &self,
        id: &str,
        done: fn(&Result<InstanceRecord, ProviderError>) -> bool,
    ) -> Result<Option<InstanceRecord>> {
        let polled = poll_until(&self.instance_poll, self.cancel, move || async move {
            let answer = self.provider.describe_instance(id).await;
            if done(&answer) {
                return Some(answer);
            }
            match answer {
                Err(ProviderError::Transient(reason)) => {
                    tracing::debug!(instance_id = id, reason = %reason, "describe failed, polling again");
                    None
                }
                Err(e @ ProviderError::Terminal(_)) => Some(Err(e)),
                _ => None,
            }
        })
        .await?;
        match polled {
            Polled::Ready { value: Ok(record), .. } => Ok(Some(record)),
            Polled::Ready {
                value: Err(ProviderError::NotFound { .. }),
                ..
            } => Ok(Some(gone_record(id))),
            Polled::Ready { value: Err(e), .. } => Err(e.into()),
            Polled::TimedOut { .. } => Ok(None),
        }
    }
}

fn is_running(answer: &Result<InstanceRecord, ProviderError>) -> bool {
    matches!(answer, Ok(r) if r.lifecycle == InstanceLifecycle::Running && r.address.is_some())
}

fn is_gone(answer: &Result<InstanceRecord, ProviderError>) -> bool {
    match answer {
        Ok(r) => r.lifecycle == InstanceLifecycle::Terminated,
        Err(e) => matches!(e, ProviderError::NotFound { .. }),
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ProviderError>(),
        Some(ProviderError::NotFound { .. })
    )
}

// Stand-in for an instance the provider no longer knows about.
fn gone_record(id: &str) -> InstanceRecord {
    InstanceRecord {
        id: id.to_string(),
        name: String::new(),
        class: String::new(),
        image_id: String::new(),
        bootstrap_digest: String::new(),
        key_name: None,
        policy_id: None,
        address: None,
        lifecycle: InstanceLifecycle::Terminated,
    }
}
