//! `CloudProvider` backed by the `aws ec2` CLI.
//!
//! Every call passes `--output json`; failures are classified from the
//! error code the CLI prints on stderr.

use std::collections::BTreeSet;

use keel_common::{
    CredentialPairRecord, CredentialRef, IngressRule, InstanceLifecycle, InstanceParams,
    InstanceRecord, NetworkPolicyRecord, ResourceKind, TARGET_TAG,
};
use serde_json::{Value, json};

use crate::application::ports::{CloudProvider, CommandRunner};
use crate::domain::error::ProviderError;
use crate::domain::planner::normalize_ingress;

/// Tag carrying the bootstrap digest an instance was launched with.
pub const BOOTSTRAP_TAG: &str = "keel:bootstrap";

const TRANSIENT_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
    "ServiceUnavailable",
    "Unavailable",
    "InternalError",
    "InsufficientInstanceCapacity",
    "DependencyViolation",
    "IncorrectInstanceState",
];

pub struct AwsCliProvider<R: CommandRunner> {
    runner: R,
    region: Option<String>,
    profile: Option<String>,
}

impl<R: CommandRunner> AwsCliProvider<R> {
    #[must_use]
    pub fn new(runner: R, region: Option<String>, profile: Option<String>) -> Self {
        Self {
            runner,
            region,
            profile,
        }
    }

    /// Run `aws ec2 <args>` and parse its JSON output.
    async fn ec2(&self, kind: ResourceKind, id: &str, args: &[&str]) -> Result<Value, ProviderError> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 7);
        full.push("ec2");
        full.extend_from_slice(args);
        full.extend_from_slice(&["--output", "json"]);
        if let Some(region) = &self.region {
            full.extend_from_slice(&["--region", region]);
        }
        if let Some(profile) = &self.profile {
            full.extend_from_slice(&["--profile", profile]);
        }
        tracing::debug!(operation = args.first().copied().unwrap_or_default(), "aws ec2");

        let output = self.runner.run("aws", &full).await.map_err(|e| {
            let message = format!("{e:#}");
            if message.contains("timed out") {
                ProviderError::Transient(message)
            } else {
                ProviderError::Terminal(message)
            }
        })?;
        if !output.status.success() {
            return Err(classify_failure(
                kind,
                id,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout)
            .map_err(|e| ProviderError::Terminal(format!("unexpected aws output: {e}")))
    }

    async fn set_rules(
        &self,
        group_id: &str,
        operation: &str,
        rules: &[IngressRule],
    ) -> Result<(), ProviderError> {
        if rules.is_empty() {
            return Ok(());
        }
        let permissions = ip_permissions(rules).to_string();
        let result = self
            .ec2(
                ResourceKind::NetworkPolicy,
                group_id,
                &[operation, "--group-id", group_id, "--ip-permissions", &permissions],
            )
            .await;
        match result {
            // A retried call may find its own earlier effect.
            Err(ProviderError::Terminal(msg))
                if msg.contains("InvalidPermission.Duplicate")
                    || msg.contains("InvalidPermission.NotFound") =>
            {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

/// Extract the AWS error code from CLI stderr.
///
/// The CLI prints `An error occurred (Code) when calling the Op operation: ...`.
#[must_use]
pub fn error_code_of(stderr: &str) -> Option<&str> {
    let rest = stderr.split_once("An error occurred (")?.1;
    rest.split_once(')').map(|(code, _)| code)
}

/// Map a failed CLI call onto the provider error taxonomy.
#[must_use]
pub fn classify_failure(kind: ResourceKind, id: &str, stderr: &str) -> ProviderError {
    match error_code_of(stderr) {
        // A missing rule is not a missing resource.
        Some(code) if code.ends_with("NotFound") && !code.starts_with("InvalidPermission.") => {
            ProviderError::NotFound {
                kind,
                id: id.to_string(),
            }
        }
        Some(code) if TRANSIENT_CODES.contains(&code) => ProviderError::Transient(stderr.to_string()),
        Some(_) => ProviderError::Terminal(stderr.to_string()),
        None if stderr.contains("Could not connect to the endpoint URL")
            || stderr.contains("Read timeout") =>
        {
            ProviderError::Transient(stderr.to_string())
        }
        None => ProviderError::Terminal(stderr.to_string()),
    }
}

fn tag_spec(resource_type: &str, tags: &[(&str, &str)]) -> String {
    let tags: Vec<String> = tags
        .iter()
        .map(|(k, v)| format!("{{Key={k},Value={v}}}"))
        .collect();
    format!("ResourceType={resource_type},Tags=[{}]", tags.join(","))
}

fn ip_permissions(rules: &[IngressRule]) -> Value {
    Value::Array(
        rules
            .iter()
            .map(|r| {
                json!({
                    "IpProtocol": r.protocol.as_str(),
                    "FromPort": r.port,
                    "ToPort": r.port,
                    "IpRanges": [{ "CidrIp": r.source }],
                })
            })
            .collect(),
    )
}

fn str_at<'v>(value: &'v Value, pointer: &str) -> Option<&'v str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn tag_value<'v>(instance: &'v Value, key: &str) -> Option<&'v str> {
    instance
        .get("Tags")?
        .as_array()?
        .iter()
        .find(|t| t.get("Key").and_then(Value::as_str) == Some(key))
        .and_then(|t| t.get("Value"))
        .and_then(Value::as_str)
}

/// Build an [`InstanceRecord`] from one element of `Instances`.
///
/// # Errors
///
/// Returns [`ProviderError::Terminal`] when `InstanceId` is missing.
pub fn parse_instance(instance: &Value) -> Result<InstanceRecord, ProviderError> {
    let id = str_at(instance, "/InstanceId")
        .ok_or_else(|| ProviderError::Terminal("instance without InstanceId".to_string()))?;
    let owned = |s: Option<&str>| s.unwrap_or_default().to_string();
    Ok(InstanceRecord {
        id: id.to_string(),
        name: owned(tag_value(instance, "Name")),
        class: owned(str_at(instance, "/InstanceType")),
        image_id: owned(str_at(instance, "/ImageId")),
        bootstrap_digest: owned(tag_value(instance, BOOTSTRAP_TAG)),
        key_name: str_at(instance, "/KeyName").map(str::to_string),
        policy_id: str_at(instance, "/SecurityGroups/0/GroupId").map(str::to_string),
        address: str_at(instance, "/PublicIpAddress").map(str::to_string),
        lifecycle: InstanceLifecycle::from_provider(
            str_at(instance, "/State/Name").unwrap_or_default(),
        ),
    })
}

fn instances_of(reply: &Value) -> Result<Vec<InstanceRecord>, ProviderError> {
    let mut out = Vec::new();
    for reservation in reply
        .get("Reservations")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        for instance in reservation
            .get("Instances")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            out.push(parse_instance(instance)?);
        }
    }
    Ok(out)
}

impl<R: CommandRunner> CloudProvider for AwsCliProvider<R> {
    async fn import_key_pair(
        &self,
        target: &str,
        credential: &CredentialRef,
    ) -> Result<CredentialPairRecord, ProviderError> {
        let material = format!("fileb://{}", credential.public_key_path);
        let tags = tag_spec("key-pair", &[(TARGET_TAG, target)]);
        self.ec2(
            ResourceKind::CredentialPair,
            &credential.name,
            &[
                "import-key-pair",
                "--key-name",
                &credential.name,
                "--public-key-material",
                &material,
                "--tag-specifications",
                &tags,
            ],
        )
        .await?;
        Ok(CredentialPairRecord {
            name: credential.name.clone(),
            public_key_path: credential.public_key_path.clone(),
        })
    }

    async fn delete_key_pair(&self, name: &str) -> Result<(), ProviderError> {
        self.ec2(
            ResourceKind::CredentialPair,
            name,
            &["delete-key-pair", "--key-name", name],
        )
        .await
        .map(|_| ())
    }

    async fn create_security_group(
        &self,
        target: &str,
        name: &str,
    ) -> Result<NetworkPolicyRecord, ProviderError> {
        let description = format!("keel ingress for {target}");
        let tags = tag_spec("security-group", &[("Name", name), (TARGET_TAG, target)]);
        let reply = self
            .ec2(
                ResourceKind::NetworkPolicy,
                name,
                &[
                    "create-security-group",
                    "--group-name",
                    name,
                    "--description",
                    &description,
                    "--tag-specifications",
                    &tags,
                ],
            )
            .await?;
        let id = str_at(&reply, "/GroupId")
            .ok_or_else(|| ProviderError::Terminal("create-security-group returned no GroupId".into()))?;
        Ok(NetworkPolicyRecord {
            id: id.to_string(),
            name: name.to_string(),
            ingress: Vec::new(),
        })
    }

    async fn update_security_group(
        &self,
        current: &NetworkPolicyRecord,
        ingress: &[IngressRule],
    ) -> Result<NetworkPolicyRecord, ProviderError> {
        let have: BTreeSet<IngressRule> = current.ingress.iter().cloned().collect();
        let want: BTreeSet<IngressRule> = ingress.iter().cloned().collect();
        let to_add: Vec<IngressRule> = want.difference(&have).cloned().collect();
        let to_revoke: Vec<IngressRule> = have.difference(&want).cloned().collect();

        self.set_rules(&current.id, "authorize-security-group-ingress", &to_add)
            .await?;
        self.set_rules(&current.id, "revoke-security-group-ingress", &to_revoke)
            .await?;
        Ok(NetworkPolicyRecord {
            ingress: normalize_ingress(ingress),
            ..current.clone()
        })
    }

    async fn delete_security_group(&self, id: &str) -> Result<(), ProviderError> {
        self.ec2(
            ResourceKind::NetworkPolicy,
            id,
            &["delete-security-group", "--group-id", id],
        )
        .await
        .map(|_| ())
    }

    async fn run_instance(
        &self,
        target: &str,
        params: &InstanceParams,
        policy_id: Option<&str>,
    ) -> Result<InstanceRecord, ProviderError> {
        let tags = tag_spec(
            "instance",
            &[
                ("Name", params.name.as_str()),
                (TARGET_TAG, target),
                (BOOTSTRAP_TAG, params.bootstrap_digest.as_str()),
            ],
        );
        let mut args = vec![
            "run-instances",
            "--image-id",
            params.image_id.as_str(),
            "--instance-type",
            params.class.as_str(),
            "--count",
            "1",
            "--user-data",
            params.bootstrap.as_str(),
            "--tag-specifications",
            tags.as_str(),
        ];
        if let Some(key) = &params.key_name {
            args.extend_from_slice(&["--key-name", key.as_str()]);
        }
        if let Some(group) = policy_id {
            args.extend_from_slice(&["--security-group-ids", group]);
        }
        let reply = self
            .ec2(ResourceKind::Instance, &params.name, &args)
            .await?;
        let first = reply
            .pointer("/Instances/0")
            .ok_or_else(|| ProviderError::Terminal("run-instances returned no instance".into()))?;
        parse_instance(first)
    }

    async fn describe_instance(&self, id: &str) -> Result<InstanceRecord, ProviderError> {
        let reply = self
            .ec2(
                ResourceKind::Instance,
                id,
                &["describe-instances", "--instance-ids", id],
            )
            .await?;
        instances_of(&reply)?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound {
                kind: ResourceKind::Instance,
                id: id.to_string(),
            })
    }

    async fn terminate_instance(&self, id: &str) -> Result<(), ProviderError> {
        self.ec2(
            ResourceKind::Instance,
            id,
            &["terminate-instances", "--instance-ids", id],
        )
        .await
        .map(|_| ())
    }

    async fn find_instances_by_tag(
        &self,
        target: &str,
    ) -> Result<Vec<InstanceRecord>, ProviderError> {
        let filter = format!("Name=tag:{TARGET_TAG},Values={target}");
        let reply = self
            .ec2(
                ResourceKind::Instance,
                target,
                &["describe-instances", "--filters", &filter],
            )
            .await?;
        instances_of(&reply)
    }
}
