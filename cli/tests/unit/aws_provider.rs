//! Tests for `AwsCliProvider` against a scripted `aws` binary.

#![allow(clippy::expect_used)]

use std::collections::VecDeque;
use std::process::Output;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use keel_cli::application::ports::{CloudProvider, CommandRunner};
use keel_cli::domain::error::ProviderError;
use keel_cli::infra::aws::AwsCliProvider;
use keel_common::{
    CredentialRef, InstanceLifecycle, InstanceParams, NetworkPolicyRecord, ResourceKind,
};

use crate::helpers::{err_output, ok_output, rule};

/// Replays canned outputs in order and records every invocation.
#[derive(Default)]
struct ScriptedAws {
    replies: Mutex<VecDeque<Result<Output>>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedAws {
    fn replying(replies: Vec<Result<Output>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn next(&self, program: &str, args: &[&str]) -> Result<Output> {
        assert_eq!(program, "aws");
        self.calls
            .lock()
            .expect("calls")
            .push(args.iter().map(ToString::to_string).collect());
        self.replies
            .lock()
            .expect("replies")
            .pop_front()
            .unwrap_or_else(|| Ok(ok_output(b"")))
    }
}

impl CommandRunner for &ScriptedAws {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        self.next(program, args)
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> Result<Output> {
        self.next(program, args)
    }

    async fn run_with_stdin(&self, program: &str, args: &[&str], _stdin: &[u8]) -> Result<Output> {
        self.next(program, args)
    }
}

fn calls(aws: &ScriptedAws) -> Vec<Vec<String>> {
    aws.calls.lock().expect("calls").clone()
}

fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
    args.windows(2).any(|w| w[0] == flag && w[1] == value)
}

const DESCRIBE_RUNNING: &[u8] = br#"{
  "Reservations": [{
    "Instances": [{
      "InstanceId": "i-0abc",
      "InstanceType": "t3.micro",
      "ImageId": "ami-0abcdef1234567890",
      "KeyName": "deploy",
      "PublicIpAddress": "198.51.100.20",
      "State": { "Name": "running" },
      "SecurityGroups": [{ "GroupId": "sg-0123" }],
      "Tags": [
        { "Key": "Name", "Value": "keel-staging" },
        { "Key": "keel:target", "Value": "staging" },
        { "Key": "keel:bootstrap", "Value": "d1g35t" }
      ]
    }]
  }]
}"#;

#[tokio::test]
async fn test_every_call_requests_json_in_configured_region() {
    let aws = ScriptedAws::replying(vec![Ok(ok_output(DESCRIBE_RUNNING))]);
    let provider = AwsCliProvider::new(
        &aws,
        Some("eu-west-1".to_string()),
        Some("ops".to_string()),
    );

    provider.describe_instance("i-0abc").await.expect("described");

    let args = &calls(&aws)[0];
    assert_eq!(args[0], "ec2");
    assert_eq!(args[1], "describe-instances");
    assert!(has_pair(args, "--instance-ids", "i-0abc"));
    assert!(has_pair(args, "--output", "json"));
    assert!(has_pair(args, "--region", "eu-west-1"));
    assert!(has_pair(args, "--profile", "ops"));
}

#[tokio::test]
async fn test_describe_parses_instance_record() {
    let aws = ScriptedAws::replying(vec![Ok(ok_output(DESCRIBE_RUNNING))]);
    let provider = AwsCliProvider::new(&aws, None, None);

    let record = provider.describe_instance("i-0abc").await.expect("described");

    assert_eq!(record.id, "i-0abc");
    assert_eq!(record.name, "keel-staging");
    assert_eq!(record.class, "t3.micro");
    assert_eq!(record.bootstrap_digest, "d1g35t");
    assert_eq!(record.key_name.as_deref(), Some("deploy"));
    assert_eq!(record.policy_id.as_deref(), Some("sg-0123"));
    assert_eq!(record.address.as_deref(), Some("198.51.100.20"));
    assert_eq!(record.lifecycle, InstanceLifecycle::Running);
}

#[tokio::test]
async fn test_missing_instance_maps_to_not_found() {
    let aws = ScriptedAws::replying(vec![Ok(err_output(
        254,
        b"An error occurred (InvalidInstanceID.NotFound) when calling the DescribeInstances operation: The instance ID 'i-gone' does not exist",
    ))]);
    let provider = AwsCliProvider::new(&aws, None, None);

    let err = provider
        .describe_instance("i-gone")
        .await
        .expect_err("gone");

    assert_eq!(
        err,
        ProviderError::NotFound {
            kind: ResourceKind::Instance,
            id: "i-gone".to_string()
        }
    );
}

#[tokio::test]
async fn test_throttling_is_transient_and_bad_parameters_are_terminal() {
    let aws = ScriptedAws::replying(vec![
        Ok(err_output(
            254,
            b"An error occurred (RequestLimitExceeded) when calling the RunInstances operation: Request limit exceeded.",
        )),
        Ok(err_output(
            254,
            b"An error occurred (InvalidAMIID.Malformed) when calling the RunInstances operation: Invalid id",
        )),
    ]);
    let provider = AwsCliProvider::new(&aws, None, None);

    let first = provider.terminate_instance("i-1").await.expect_err("throttled");
    let second = provider.terminate_instance("i-1").await.expect_err("malformed");

    assert!(first.is_transient());
    assert!(matches!(second, ProviderError::Terminal(ref m) if m.contains("InvalidAMIID.Malformed")));
}

#[tokio::test]
async fn test_runner_timeout_is_transient() {
    let aws = ScriptedAws::replying(vec![Err(anyhow::anyhow!(
        "aws timed out after 120s"
    ))]);
    let provider = AwsCliProvider::new(&aws, None, None);

    let err = provider.delete_key_pair("deploy").await.expect_err("timeout");

    assert!(err.is_transient());
}

#[tokio::test]
async fn test_run_instance_tags_and_attaches_group() {
    let aws = ScriptedAws::replying(vec![Ok(ok_output(
        br#"{ "Instances": [{ "InstanceId": "i-0new", "State": { "Name": "pending" } }] }"#,
    ))]);
    let provider = AwsCliProvider::new(&aws, None, None);
    let params = InstanceParams {
        name: "keel-staging".to_string(),
        class: "t3.micro".to_string(),
        image_id: "ami-0abcdef1234567890".to_string(),
        bootstrap: "#!/bin/bash\ntrue\n".to_string(),
        bootstrap_digest: "d1g35t".to_string(),
        key_name: Some("deploy".to_string()),
    };

    let record = provider
        .run_instance("staging", &params, Some("sg-0123"))
        .await
        .expect("launched");

    assert_eq!(record.id, "i-0new");
    assert_eq!(record.lifecycle, InstanceLifecycle::Pending);
    let args = &calls(&aws)[0];
    assert_eq!(args[1], "run-instances");
    assert!(has_pair(args, "--image-id", "ami-0abcdef1234567890"));
    assert!(has_pair(args, "--instance-type", "t3.micro"));
    assert!(has_pair(args, "--key-name", "deploy"));
    assert!(has_pair(args, "--security-group-ids", "sg-0123"));
    let tags = args
        .iter()
        .find(|a| a.starts_with("ResourceType=instance"))
        .expect("tag spec");
    assert!(tags.contains("{Key=keel:target,Value=staging}"), "{tags}");
    assert!(tags.contains("{Key=keel:bootstrap,Value=d1g35t}"), "{tags}");
}

#[tokio::test]
async fn test_import_key_pair_reads_public_key_file() {
    let aws = ScriptedAws::default();
    let provider = AwsCliProvider::new(&aws, None, None);
    let credential = CredentialRef {
        name: "deploy".to_string(),
        public_key_path: "/home/deploy/.ssh/id_ed25519.pub".to_string(),
    };

    let record = provider
        .import_key_pair("staging", &credential)
        .await
        .expect("imported");

    assert_eq!(record.name, "deploy");
    let args = &calls(&aws)[0];
    assert!(has_pair(
        args,
        "--public-key-material",
        "fileb:///home/deploy/.ssh/id_ed25519.pub"
    ));
}

#[tokio::test]
async fn test_update_security_group_only_sends_differences() {
    let aws = ScriptedAws::default();
    let provider = AwsCliProvider::new(&aws, None, None);
    let current = NetworkPolicyRecord {
        id: "sg-0123".to_string(),
        name: "keel-staging".to_string(),
        ingress: vec![rule(22), rule(8080)],
    };

    let updated = provider
        .update_security_group(&current, &[rule(80), rule(22), rule(80)])
        .await
        .expect("updated");

    assert_eq!(updated.ingress, vec![rule(22), rule(80)]);
    let sent = calls(&aws);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0][1], "authorize-security-group-ingress");
    assert!(sent[0].iter().any(|a| a.contains(r#""FromPort":80"#)));
    assert_eq!(sent[1][1], "revoke-security-group-ingress");
    assert!(sent[1].iter().any(|a| a.contains(r#""FromPort":8080"#)));
}

#[tokio::test]
async fn test_update_security_group_tolerates_duplicate_rules() {
    let aws = ScriptedAws::replying(vec![Ok(err_output(
        254,
        b"An error occurred (InvalidPermission.Duplicate) when calling the AuthorizeSecurityGroupIngress operation: the specified rule already exists",
    ))]);
    let provider = AwsCliProvider::new(&aws, None, None);
    let current = NetworkPolicyRecord {
        id: "sg-0123".to_string(),
        name: "keel-staging".to_string(),
        ingress: Vec::new(),
    };

    let updated = provider
        .update_security_group(&current, &[rule(80)])
        .await
        .expect("duplicate is success");

    assert_eq!(updated.ingress, vec![rule(80)]);
}

#[tokio::test]
async fn test_find_instances_filters_on_target_tag() {
    let aws = ScriptedAws::replying(vec![Ok(ok_output(DESCRIBE_RUNNING))]);
    let provider = AwsCliProvider::new(&aws, None, None);

    let found = provider
        .find_instances_by_tag("staging")
        .await
        .expect("listed");

    assert_eq!(found.len(), 1);
    assert!(has_pair(
        &calls(&aws)[0],
        "--filters",
        "Name=tag:keel:target,Values=staging"
    ));
}
